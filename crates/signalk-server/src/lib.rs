//! # signalk-server
//!
//! The SignalK face of the pipeline. Consumes Mapped deltas from the bus,
//! keeps the latest-value cache and serves:
//!
//! - `GET /signalk`: endpoint discovery
//! - `GET /signalk/v3/api/`: the Full tree, from the store or the cache
//! - `GET /signalk/v1/stream`: WebSocket deltas filtered by subscription

pub mod config;
pub mod hub;
pub mod routes;
pub mod server;
pub mod session;
pub mod subscription;

pub use config::ServerConfig;
pub use hub::{HubHandle, HubStats};
pub use routes::{create_router, AppState};
pub use server::{feed, run_server, SignalKServer};
pub use subscription::{ClientSubscription, SubscriptionManager};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bus(#[from] signalk_bus::BusError),

    #[error(transparent)]
    Store(#[from] signalk_store::StoreError),

    #[error("server task failed: {0}")]
    Task(String),
}
