//! juju-env – WebSocket environment client for an orchestration backend
//!
//! This crate implements the client side of a management console's
//! conversation with its backend:
//! - A connection manager owning one WebSocket (or in-memory) channel
//! - Request/response correlation with exactly-once callbacks
//! - Routing of unsolicited push notifications to subscribers
//! - Adapters for the go and python backend wire dialects

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Environment client modules
pub mod env;

// Re-export key types for convenience
pub use env::{Dialect, EnvError, Environment, EnvironmentConfig, Operation};

/// Current version of the client
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
