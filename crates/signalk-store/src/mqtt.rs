//! MQTT bridge: Mapped deltas to `<topicPrefix>/<context>` as JSON.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use signalk_bus::Subscriber;
use signalk_core::Delta;

use crate::config::MqttConfig;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("mqtt client: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("encode delta: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn topic(prefix: &str, context: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), context)
}

pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub failed: u64,
}

pub struct MqttBridge {
    client: AsyncClient,
    prefix: String,
    qos: QoS,
    event_loop: JoinHandle<()>,
}

impl MqttBridge {
    /// Create the client and start driving its event loop. Connection
    /// errors are logged and retried by the loop.
    pub fn connect(config: &MqttConfig) -> Self {
        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let host = format!("{}:{}", config.host, config.port);

        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!(broker = %host, "mqtt connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(broker = %host, error = %e, "mqtt connection error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self {
            client,
            prefix: config.topic_prefix.clone(),
            qos: qos(config.qos),
            event_loop,
        }
    }

    pub async fn publish(&self, delta: &Delta) -> Result<(), BridgeError> {
        let payload = serde_json::to_vec(delta)?;
        self.client
            .publish(topic(&self.prefix, &delta.context), self.qos, false, payload)
            .await?;
        Ok(())
    }

    /// Publish a sequence of deltas, counting failures.
    pub async fn publish_all(&self, deltas: &[Delta]) -> BridgeStats {
        let mut stats = BridgeStats::default();
        for delta in deltas {
            self.count(&mut stats, delta).await;
        }
        stats
    }

    /// Forward Mapped traffic from `input` until it closes.
    pub async fn run_live(&self, input: Subscriber) -> BridgeStats {
        let mut stats = BridgeStats::default();
        while let Some(delta) = input.recv_delta().await {
            self.count(&mut stats, &delta).await;
        }
        info!(published = stats.published, failed = stats.failed, "mqtt bridge input closed");
        stats
    }

    async fn count(&self, stats: &mut BridgeStats, delta: &Delta) {
        match self.publish(delta).await {
            Ok(()) => stats.published += 1,
            Err(e) => {
                stats.failed += 1;
                debug!(context = %delta.context, error = %e, "mqtt publish failed");
            }
        }
    }

    /// Disconnect and stop the event loop.
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "mqtt disconnect");
        }
        self.event_loop.abort();
    }
}
