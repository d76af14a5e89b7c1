//! Real-time progress hub for mod conversion jobs.
//!
//! Browser sessions attach to a conversion over WebSocket, conversion workers
//! publish progress over HTTP, and [`manager::ConnectionManager`] fans each
//! event out to every live socket of that job while enforcing per-client rate
//! limits, heartbeats and stale-connection cleanup.

pub mod config;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod protocol;
pub mod rate_limiter;
pub mod router;

pub use error::HubError;
pub use manager::{ConnectionManager, ManagerSettings};
