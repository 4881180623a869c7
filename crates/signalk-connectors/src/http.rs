//! HTTP URL-group poller: one ticker per URL, one Raw per good response.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{Connector, ConnectorConfig, ConnectorError, RawEmitter, UrlGroup};

pub struct HttpConnector {
    name: String,
    groups: Vec<UrlGroup>,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1000)))
            .build()?;
        Ok(Self {
            name: config.name.clone(),
            groups: config.url_groups.clone(),
            client,
        })
    }
}

async fn poll_url(
    name: String,
    url: String,
    interval: Duration,
    client: reqwest::Client,
    emitter: RawEmitter,
) -> Result<(), ConnectorError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let response = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(connector = %name, url = %url, error = %e, "poll failed");
                continue;
            }
        };
        if !response.status().is_success() {
            warn!(connector = %name, url = %url, status = %response.status(), "poll returned error status");
            continue;
        }
        match response.bytes().await {
            Ok(body) => {
                debug!(connector = %name, url = %url, bytes = body.len(), "polled");
                emitter.emit(body)?;
            }
            Err(e) => warn!(connector = %name, url = %url, error = %e, "reading body failed"),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, emitter: RawEmitter) -> Result<(), ConnectorError> {
        let mut tasks = tokio::task::JoinSet::new();
        for group in &self.groups {
            for url in &group.urls {
                info!(connector = %self.name, url = %url, interval_ms = group.interval_ms, "polling");
                tasks.spawn(poll_url(
                    self.name.clone(),
                    url.clone(),
                    Duration::from_millis(group.interval_ms),
                    self.client.clone(),
                    emitter.clone(),
                ));
            }
        }
        // pollers only return on a closed bus
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                tasks.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalk_bus::Publisher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_polls_each_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let body = r#"{"temperature":21.5}"#;
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(reply.as_bytes()).await;
                });
            }
        });

        let mut config = ConnectorConfig::new("weather", "json", &format!("http://{addr}"));
        config.url_groups = vec![UrlGroup {
            urls: vec![format!("http://{addr}/a"), format!("http://{addr}/b")],
            interval_ms: 50,
        }];
        let connector = HttpConnector::new(&config).unwrap();
        let publisher = Publisher::new(64);
        let sub = publisher.subscribe();
        let emitter = RawEmitter::new("weather", "json", publisher);
        let task = tokio::spawn(async move { connector.publish(emitter).await });

        for _ in 0..3 {
            let raw = tokio::time::timeout(Duration::from_secs(5), sub.recv_raw())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&raw.payload[..], br#"{"temperature":21.5}"#);
            assert_eq!(raw.protocol, "json");
        }
        task.abort();
    }
}
