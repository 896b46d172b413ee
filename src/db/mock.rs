//! In-memory backend for tests.
//!
//! Counts pools, acquisitions and statements so tests can assert what the
//! gateway did (or did not do) on the network side.

use super::{ColumnInfo, DatabaseConnection, DatabasePool, PoolFactory, QueryResult, Value};
use crate::config::{AuthPlugin, ConnectParams};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What the mock does when asked to open, acquire or run something.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Plugins whose pool open fails with an authentication error.
    pub failing_plugins: Vec<Option<AuthPlugin>>,
    /// When set, every pool open fails with this error.
    pub open_error: Option<GatewayError>,
    /// Delay before an acquire completes.
    pub acquire_delay: Option<Duration>,
    /// Canned results keyed by uppercase SQL prefix. First match wins.
    pub results: Vec<(String, QueryResult)>,
    /// Canned errors keyed by uppercase SQL prefix. Checked before results.
    pub errors: Vec<(String, GatewayError)>,
    /// Affected-row count returned by `execute`.
    pub affected_rows: u64,
}

#[derive(Debug, Default)]
struct MockStats {
    pools_created: AtomicUsize,
    pools_closed: AtomicUsize,
    acquisitions: AtomicUsize,
    open_attempts: Mutex<Vec<Option<AuthPlugin>>>,
    last_params: Mutex<Option<ConnectParams>>,
    executed: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool factory backed by memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockPoolFactory {
    behavior: Arc<Mutex<MockBehavior>>,
    stats: Arc<MockStats>,
}

impl MockPoolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            stats: Arc::default(),
        }
    }

    /// Makes pool opens with any of `plugins` fail as a plugin mismatch.
    pub fn fail_plugins(self, plugins: impl IntoIterator<Item = Option<AuthPlugin>>) -> Self {
        self.update(|b| b.failing_plugins.extend(plugins));
        self
    }

    /// Serves `result` for statements starting with `prefix`.
    pub fn with_result(self, prefix: &str, result: QueryResult) -> Self {
        self.update(|b| b.results.push((prefix.to_uppercase(), result)));
        self
    }

    /// Fails statements starting with `prefix` with `error`.
    pub fn with_error(self, prefix: &str, error: GatewayError) -> Self {
        self.update(|b| b.errors.push((prefix.to_uppercase(), error)));
        self
    }

    /// Changes behavior after construction, e.g. to break the server mid-test.
    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut lock(&self.behavior));
    }

    pub fn pools_created(&self) -> usize {
        self.stats.pools_created.load(Ordering::SeqCst)
    }

    pub fn pools_closed(&self) -> usize {
        self.stats.pools_closed.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.stats.acquisitions.load(Ordering::SeqCst)
    }

    /// Plugin requested by every open attempt, in order.
    pub fn open_attempts(&self) -> Vec<Option<AuthPlugin>> {
        lock(&self.stats.open_attempts).clone()
    }

    /// Parameters of the most recent open attempt.
    pub fn last_params(&self) -> Option<ConnectParams> {
        lock(&self.stats.last_params).clone()
    }

    /// Every statement run on any connection, including transaction control.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.stats.executed).clone()
    }
}

#[async_trait]
impl PoolFactory for MockPoolFactory {
    async fn open(&self, params: &ConnectParams) -> Result<Arc<dyn DatabasePool>> {
        lock(&self.stats.open_attempts).push(params.auth_plugin);
        *lock(&self.stats.last_params) = Some(params.clone());

        let behavior = lock(&self.behavior).clone();
        if let Some(error) = behavior.open_error {
            return Err(error);
        }
        if behavior.failing_plugins.contains(&params.auth_plugin) {
            return Err(GatewayError::authentication(format!(
                "Authentication plugin '{}' cannot be loaded",
                AuthPlugin::label(params.auth_plugin)
            )));
        }

        self.stats.pools_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPool {
            behavior: Arc::clone(&self.behavior),
            stats: Arc::clone(&self.stats),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockPool {
    behavior: Arc<Mutex<MockBehavior>>,
    stats: Arc<MockStats>,
    closed: AtomicBool,
}

#[async_trait]
impl DatabasePool for MockPool {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::pool_unavailable("pool is closed"));
        }
        let delay = lock(&self.behavior).acquire_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.stats.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            behavior: Arc::clone(&self.behavior),
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.pools_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MockConnection {
    behavior: Arc<Mutex<MockBehavior>>,
    stats: Arc<MockStats>,
}

impl MockConnection {
    fn record(&self, sql: &str) -> Result<()> {
        lock(&self.stats.executed).push(sql.to_string());
        let upper = sql.trim_start().to_uppercase();
        let behavior = lock(&self.behavior);
        match behavior
            .errors
            .iter()
            .find(|(prefix, _)| upper.starts_with(prefix.as_str()))
        {
            Some((_, error)) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn fetch_all(&mut self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        self.record(sql)?;
        let upper = sql.trim_start().to_uppercase();
        let behavior = lock(&self.behavior);
        let result = behavior
            .results
            .iter()
            .find(|(prefix, _)| upper.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| {
                QueryResult::with_data(
                    vec![ColumnInfo::new("result", "VARCHAR")],
                    vec![vec![Value::String(format!("Mock result for: {sql}"))]],
                )
            });
        Ok(result.with_execution_time(Duration::from_millis(1)))
    }

    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.record(sql)?;
        Ok(lock(&self.behavior).affected_rows)
    }

    async fn begin(&mut self) -> Result<()> {
        self.record("START TRANSACTION")
    }

    async fn commit(&mut self) -> Result<()> {
        self.record("COMMIT")
    }

    async fn rollback(&mut self) -> Result<()> {
        self.record("ROLLBACK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use pretty_assertions::assert_eq;

    fn params(plugin: Option<AuthPlugin>) -> ConnectParams {
        let mut params = PolicyConfig::default().connect_params();
        params.auth_plugin = plugin;
        params
    }

    #[tokio::test]
    async fn test_mock_select_default_result() {
        let factory = MockPoolFactory::new();
        let pool = factory.open(&params(None)).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let result = conn.fetch_all("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.columns[0].name, "result");
        assert_eq!(factory.pools_created(), 1);
        assert_eq!(factory.acquisitions(), 1);
        assert_eq!(factory.executed(), vec!["SELECT 1"]);
    }

    #[tokio::test]
    async fn test_mock_canned_results_and_errors() {
        let factory = MockPoolFactory::new()
            .with_result(
                "show tables",
                QueryResult::with_data(
                    vec![ColumnInfo::new("Tables_in_appdb", "VARCHAR")],
                    vec![vec![Value::from("users")]],
                ),
            )
            .with_error("SELECT * FROM secret", GatewayError::permission("", "", "(1142) denied"));
        let pool = factory.open(&params(None)).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let result = conn.fetch_all("SHOW TABLES", &[]).await.unwrap();
        assert_eq!(result.columns[0].name, "Tables_in_appdb");

        let err = conn
            .fetch_all("select * from secret", &[])
            .await
            .unwrap_err();
        assert_eq!(err.category(), "permission");
    }

    #[tokio::test]
    async fn test_mock_failing_plugins() {
        let factory = MockPoolFactory::new().fail_plugins([Some(AuthPlugin::CachingSha2Password)]);

        let err = factory
            .open(&params(Some(AuthPlugin::CachingSha2Password)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Authentication(_)));
        assert!(factory
            .open(&params(Some(AuthPlugin::MysqlNativePassword)))
            .await
            .is_ok());
        assert_eq!(
            factory.open_attempts(),
            vec![
                Some(AuthPlugin::CachingSha2Password),
                Some(AuthPlugin::MysqlNativePassword)
            ]
        );
        assert_eq!(factory.pools_created(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_acquire() {
        let factory = MockPoolFactory::new();
        let pool = factory.open(&params(None)).await.unwrap();
        pool.close().await;
        pool.close().await;

        assert_eq!(factory.pools_closed(), 1);
        assert!(matches!(
            pool.acquire().await.err().unwrap(),
            GatewayError::PoolUnavailable(_)
        ));
    }
}
