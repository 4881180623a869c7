//! # signalk-core
//!
//! Core SignalK data model and the synchronous pieces of the data plane.
//!
//! This crate provides:
//! - Data model types (Delta, Update, PathValue, Source, SingleValueMapped)
//! - Path and context wildcard matching
//! - The latest-value cache and the Full-tree builder
//! - Rate-limit filter logic (without I/O)
//! - Configuration loading shared by every role
//!
//! This crate contains no async code; the bus, connectors, mappers and
//! server build on it.

pub mod cache;
pub mod config;
pub mod full;
pub mod model;
pub mod path;
pub mod ratelimit;

pub use cache::{LatestValueCache, SnapshotError, SnapshotSource};
pub use config::{CacheConfig, ConfigError, Validate};
pub use full::build_full_tree;
pub use model::*;
pub use path::{PathPattern, PatternError};
pub use ratelimit::{RateLimitConfig, RateLimitFilter};
