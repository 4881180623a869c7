//! One WebSocket connection: a writer draining the hub's frame queue with
//! pings, and a reader forwarding subscribe/unsubscribe requests.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use signalk_protocol::codec::decode_client_message;
use signalk_protocol::{ClientMessage, SubscribeMode};

use crate::hub::{ClientId, HubHandle, Registration};

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_PERIOD: Duration = Duration::from_secs(60);

pub async fn run_session(socket: WebSocket, hub: HubHandle, mode: SubscribeMode, send_cached: bool) {
    let Some(Registration { id, mut frames }) = hub.register(mode, send_cached).await else {
        debug!("hub stopped, refusing websocket client");
        return;
    };
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
        loop {
            let msg = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(text) => Message::Text(text),
                    None => break,
                },
                _ = ping.tick() => Message::Ping(Vec::new()),
            };
            match timeout(WRITE_TIMEOUT, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client = id, error = %e, "websocket write failed");
                    return;
                }
                Err(_) => {
                    warn!(client = id, "websocket write timed out");
                    return;
                }
            }
        }
        // dropped by the hub
        let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(None))).await;
    });

    let reader = async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => handle_text(&hub, id, &text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(client = id, error = %e, "websocket read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {}
        _ = reader => writer.abort(),
    }
    hub.unregister(id).await;
    info!(client = id, "websocket client disconnected");
}

async fn handle_text(hub: &HubHandle, id: ClientId, text: &str) {
    match decode_client_message(text) {
        Ok(ClientMessage::Subscribe(request)) => hub.subscribe(id, request).await,
        Ok(ClientMessage::Unsubscribe(request)) => hub.unsubscribe(id, request).await,
        Err(e) => warn!(client = id, error = %e, "ignoring client message"),
    }
}
