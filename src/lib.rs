//! statesink - monitoring state replication
//!
//! A long-running daemon that mirrors live monitoring state and historical
//! events from a Redis-compatible stream store into a relational database,
//! coordinating with peer replicas so that exactly one replica writes at any
//! moment.

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod ha;
pub mod history;
pub mod redis;
pub mod retry;
pub mod sync;
pub mod telemetry;
pub mod types;

// Re-export common types for library usage
pub use config::Config;
pub use error::Error;
pub use types::{Binary, UnixMilli};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
