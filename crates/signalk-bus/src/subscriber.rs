//! Subscribing side of the bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use signalk_core::Delta;
use signalk_protocol::codec::decode_delta;
use signalk_protocol::RawMessage;

use crate::endpoint::{self, Endpoint};
use crate::queue::MessageQueue;
use crate::BusError;

/// Default pause before redialing a lost publisher.
pub const DEFAULT_RECONNECT: Duration = Duration::from_secs(5);

/// Receives from one local publisher or any number of remote ones, merged
/// into a single drop-oldest queue.
pub struct Subscriber {
    queue: Arc<MessageQueue>,
}

impl Subscriber {
    pub(crate) fn from_queue(queue: Arc<MessageQueue>) -> Self {
        Self { queue }
    }

    /// Dial every URL with the default reconnect delay.
    pub fn connect(urls: &[String], capacity: usize) -> Result<Self, BusError> {
        Self::connect_with(urls, capacity, DEFAULT_RECONNECT)
    }

    /// Dial every URL. Each link redials after `reconnect` on failure and
    /// stops when its publisher sends end-of-stream. The subscriber ends
    /// once every link has stopped.
    pub fn connect_with(
        urls: &[String],
        capacity: usize,
        reconnect: Duration,
    ) -> Result<Self, BusError> {
        if urls.is_empty() {
            return Err(BusError::InvalidUrl("no publisher URLs".to_string()));
        }
        let endpoints = urls
            .iter()
            .map(|u| Endpoint::parse(u))
            .collect::<Result<Vec<_>, _>>()?;

        let queue = Arc::new(MessageQueue::new(capacity));
        let live = Arc::new(AtomicUsize::new(endpoints.len()));

        for ep in endpoints {
            let queue = queue.clone();
            let live = live.clone();
            tokio::spawn(async move {
                run_link(&ep, &queue, reconnect).await;
                if live.fetch_sub(1, Ordering::AcqRel) == 1 {
                    queue.close();
                }
            });
        }

        Ok(Self { queue })
    }

    /// Next message, or `None` when every publisher has closed.
    pub async fn recv(&self) -> Option<Bytes> {
        self.queue.pop().await
    }

    /// Next Raw envelope. Undecodable messages are logged and skipped.
    pub async fn recv_raw(&self) -> Option<RawMessage> {
        loop {
            let msg = self.recv().await?;
            match RawMessage::decode(msg) {
                Ok(raw) => return Some(raw),
                Err(e) => warn!(error = %e, "dropping undecodable raw message"),
            }
        }
    }

    /// Next Mapped delta. Undecodable messages are logged and skipped.
    pub async fn recv_delta(&self) -> Option<Delta> {
        loop {
            let msg = self.recv().await?;
            match decode_delta(&msg) {
                Ok(delta) => return Some(delta),
                Err(e) => warn!(error = %e, "dropping undecodable delta"),
            }
        }
    }

    /// Messages discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Stop receiving; pending messages still drain.
    pub fn close(&self) {
        self.queue.close();
    }
}

enum LinkEnd {
    EndOfStream,
    Closed,
}

async fn run_link(ep: &Endpoint, queue: &MessageQueue, reconnect: Duration) {
    loop {
        if queue.is_closed() {
            return;
        }
        let result = match ep {
            Endpoint::Tcp(addr) => match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    read_stream(stream, queue).await
                }
                Err(e) => Err(BusError::Io(e)),
            },
            #[cfg(unix)]
            Endpoint::Ipc(path) => match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => read_stream(stream, queue).await,
                Err(e) => Err(BusError::Io(e)),
            },
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                warn!(url = %ep, "ipc transport needs a Unix platform");
                return;
            }
        };

        match result {
            Ok(LinkEnd::EndOfStream) => {
                info!(url = %ep, "publisher closed the stream");
                return;
            }
            Ok(LinkEnd::Closed) => return,
            Err(e) => {
                warn!(url = %ep, error = %e, "bus link lost, reconnecting");
                tokio::time::sleep(reconnect).await;
            }
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(
    mut stream: R,
    queue: &MessageQueue,
) -> Result<LinkEnd, BusError> {
    endpoint::read_greeting(&mut stream).await?;
    debug!("bus link established");
    loop {
        match endpoint::read_frame(&mut stream).await? {
            Some(msg) => {
                if !queue.push(msg) {
                    return Ok(LinkEnd::Closed);
                }
            }
            None => return Ok(LinkEnd::EndOfStream),
        }
    }
}
