//! Driver seam.
//!
//! The connection pool and the executor talk to the database only through
//! the three traits below, so the gateway logic can run against the sqlx
//! MySQL backend in production and an in-memory mock in tests.

mod mock;
mod mysql;
mod types;

pub use mock::{MockBehavior, MockPoolFactory};
pub use mysql::MySqlPoolFactory;
pub use types::{ColumnInfo, QueryResult, Record, Row, Value};

use crate::config::ConnectParams;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Opens connection pools.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    /// Opens a pool and verifies that at least one connection can be made.
    ///
    /// An authentication-plugin mismatch must be reported as
    /// [`GatewayError::Authentication`](crate::error::GatewayError::Authentication)
    /// so the caller can try the next plugin.
    async fn open(&self, params: &ConnectParams) -> Result<Arc<dyn DatabasePool>>;
}

/// An open pool of connections.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Checks out a connection. Implementations may wait; the caller bounds the wait.
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>>;

    /// Closes the pool. Must be safe to call more than once.
    async fn close(&self);
}

/// A checked-out connection. Returned to its pool on drop.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Runs a row-returning statement.
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Runs a statement and returns the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
