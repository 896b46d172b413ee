//! Connection management for the gateway.
//!
//! Owns the per-session pool lifecycle and the session registry.

mod manager;
mod pool;

pub use manager::{Session, SessionManager};
pub use pool::{ConnectionPool, PoolInfo, PoolState, MAX_AUTH_RETRIES};
