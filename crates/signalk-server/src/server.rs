//! Server assembly: cache, hub, router and the Mapped input feed.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use signalk_bus::Subscriber;
use signalk_core::{LatestValueCache, SnapshotSource};
use signalk_store::{StoreSnapshot, TimeSeriesStore};

use crate::hub::{self, HubHandle, HubIdentity, HubStats};
use crate::routes::{create_router, AppState};
use crate::{ServerConfig, ServerError};

/// A running hub with its cache and HTTP state, ready to be served.
pub struct SignalKServer {
    state: AppState,
    cache: Arc<RwLock<LatestValueCache>>,
    hub_task: JoinHandle<HubStats>,
    sweeper: Option<JoinHandle<()>>,
}

impl SignalKServer {
    /// Build the cache (warmed from `store` if configured), start the hub
    /// and the TTL sweep.
    pub async fn start(config: ServerConfig, store: Option<Arc<dyn TimeSeriesStore>>) -> Self {
        let cache = match config.cache.ttl_seconds {
            Some(secs) => LatestValueCache::with_ttl(Duration::from_secs(secs)),
            None => LatestValueCache::new(),
        };
        let cache = Arc::new(RwLock::new(cache));

        if config.cache.warm {
            if let Some(store) = &store {
                warm(&cache, store.clone()).await;
            }
        }

        let (hub, hub_task) = hub::spawn(
            HubIdentity {
                name: config.name.clone(),
                version: config.version.clone(),
                self_context: config.self_context.clone(),
            },
            cache.clone(),
        );

        let sweeper = config
            .cache
            .ttl_seconds
            .map(|secs| tokio::spawn(sweep(cache.clone(), sweep_period(secs))));

        let snapshot: Arc<dyn SnapshotSource> = match store {
            Some(store) => Arc::new(StoreSnapshot(store)) as Arc<dyn SnapshotSource>,
            None => cache.clone() as Arc<dyn SnapshotSource>,
        };

        Self {
            state: AppState {
                hub,
                snapshot,
                config: Arc::new(config),
            },
            cache,
            hub_task,
            sweeper,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub fn hub(&self) -> HubHandle {
        self.state.hub.clone()
    }

    pub fn cache(&self) -> Arc<RwLock<LatestValueCache>> {
        self.cache.clone()
    }

    /// Serve HTTP and WebSocket on `listener` while feeding the hub from
    /// `input`. Returns once the input closes and the hub has stopped.
    pub async fn serve(self, listener: TcpListener, input: Subscriber) -> Result<HubStats, ServerError> {
        let app = self.router();
        let hub = self.hub();
        let feeder = tokio::spawn(feed(input, hub.clone()));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = feeder.await;
                hub.shutdown().await;
            })
            .await?;

        self.stop().await
    }

    /// Stop the hub and the sweep without serving.
    pub async fn stop(self) -> Result<HubStats, ServerError> {
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
        self.state.hub.shutdown().await;
        self.hub_task
            .await
            .map_err(|e| ServerError::Task(e.to_string()))
    }
}

/// Broadcast every delta from `input` until it closes. Returns the count.
pub async fn feed(input: Subscriber, hub: HubHandle) -> u64 {
    let mut forwarded = 0;
    while let Some(delta) = input.recv_delta().await {
        if !hub.broadcast(delta).await {
            break;
        }
        forwarded += 1;
    }
    info!(forwarded, dropped = input.dropped(), "mapped input closed");
    forwarded
}

async fn warm(cache: &Arc<RwLock<LatestValueCache>>, store: Arc<dyn TimeSeriesStore>) {
    match tokio::task::spawn_blocking(move || store.latest_mapped()).await {
        Ok(Ok(rows)) => {
            let mut cache = cache.write();
            let loaded = rows.into_iter().filter(|row| cache.insert(row.clone())).count();
            info!(loaded, "cache warmed from store");
        }
        Ok(Err(e)) => warn!(error = %e, "cache warm-up failed"),
        Err(e) => warn!(error = %e, "cache warm-up task failed"),
    }
}

fn sweep_period(ttl_secs: u64) -> Duration {
    Duration::from_secs((ttl_secs / 2).clamp(1, 60))
}

async fn sweep(cache: Arc<RwLock<LatestValueCache>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let evicted = cache.write().evict_expired(chrono::Utc::now());
        if evicted > 0 {
            info!(evicted, remaining = cache.read().len(), "expired cache entries");
        }
    }
}

/// Run the `server` role until the Mapped input closes.
pub async fn run_server(config: ServerConfig) -> Result<HubStats, ServerError> {
    let input = config.bus.subscriber()?;
    let store = config
        .database
        .as_ref()
        .map(signalk_store::open)
        .transpose()?;
    let listener = TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, self_context = %config.self_context, "signalk server listening");

    let server = SignalKServer::start(config, store).await;
    server.serve(listener, input).await
}
