//! # signalk-bus
//!
//! Brokerless publish/subscribe links between pipeline stages.
//!
//! A stage binds one [`Publisher`] (`tcp://` or `ipc://`) and dials the
//! publishers it consumes with a [`Subscriber`]. Queues are bounded and drop
//! the oldest message on overflow; nothing on the bus ever blocks a producer.

pub mod config;
pub mod endpoint;
pub mod filter;
pub mod publisher;
pub mod queue;
pub mod subscriber;

pub use config::BusConfig;
pub use filter::{run_filter, FilterConfig, FilterStats};
pub use publisher::Publisher;
pub use queue::{MessageQueue, DEFAULT_CAPACITY};
pub use subscriber::Subscriber;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid bus URL: {0}")]
    InvalidUrl(String),

    #[error("bus I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus handshake failed: {0}")]
    Handshake(String),

    #[error("frame of {0} bytes is not allowed")]
    FrameTooLarge(usize),

    #[error("empty messages cannot be published")]
    EmptyMessage,

    #[error("publisher is closed")]
    Closed,
}
