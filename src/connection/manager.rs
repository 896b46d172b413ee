//! Sessions: one config and one pool per caller.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{
    PolicyConfig, SessionConfig, MYSQL_DATABASE, MYSQL_HOST, MYSQL_PASSWORD, MYSQL_PORT,
    MYSQL_USER,
};
use crate::db::PoolFactory;
use crate::error::{GatewayError, Result};
use crate::query::QueryExecutor;

use super::pool::{ConnectionPool, MAX_AUTH_RETRIES};

const MAX_HOST_LEN: usize = 128;
const MAX_USER_LEN: usize = 64;
const MAX_PASSWORD_LEN: usize = 128;
const MAX_DATABASE_LEN: usize = 64;

/// One logical caller: a config and the pool built from it, created and
/// torn down together.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    pool: Arc<ConnectionPool>,
}

impl Session {
    pub fn new(id: impl Into<String>, config: PolicyConfig, factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            id: id.into(),
            pool: Arc::new(ConnectionPool::new(SessionConfig::new(config), factory)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        self.pool.config()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Executor bound to this session's pool.
    pub fn executor(&self) -> QueryExecutor {
        QueryExecutor::new(Arc::clone(&self.pool))
    }

    /// Points the session at another server or database.
    ///
    /// The new settings are validated, applied and used to rebuild the pool.
    /// If the rebuild fails the previous connection settings are restored and
    /// the pool is reopened with them.
    pub async fn switch_database(
        &self,
        host: &str,
        port: u32,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<()> {
        validate_switch(host, port, user, password, database)?;

        let keys = [MYSQL_HOST, MYSQL_PORT, MYSQL_USER, MYSQL_PASSWORD, MYSQL_DATABASE];
        let previous: Vec<(&str, String)> = keys
            .iter()
            .map(|key| (*key, self.config().get(key).unwrap_or_default()))
            .collect();

        let port = port.to_string();
        self.config().update([
            (MYSQL_HOST, host),
            (MYSQL_PORT, port.as_str()),
            (MYSQL_USER, user),
            (MYSQL_PASSWORD, password),
            (MYSQL_DATABASE, database),
        ])?;

        match self.pool.initialize_pool(MAX_AUTH_RETRIES).await {
            Ok(()) => {
                info!(session = %self.id, host, database, "Switched database");
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "Database switch failed, restoring previous settings");
                self.config().update(previous)?;
                if let Err(restore) = self.pool.initialize_pool(MAX_AUTH_RETRIES).await {
                    warn!(session = %self.id, error = %restore, "Could not reopen the previous database");
                }
                Err(GatewayError::connection(format!(
                    "Failed to switch to {user}@{host}/{database}: {e}"
                )))
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close_pool().await;
    }
}

fn validate_switch(host: &str, port: u32, user: &str, password: &str, database: &str) -> Result<()> {
    let mut errors = Vec::new();
    check_text(&mut errors, "host", host, MAX_HOST_LEN);
    if !(1..=65535).contains(&port) {
        errors.push("port must be between 1 and 65535".to_string());
    }
    check_text(&mut errors, "user", user, MAX_USER_LEN);
    check_text(&mut errors, "password", password, MAX_PASSWORD_LEN);
    check_text(&mut errors, "database", database, MAX_DATABASE_LEN);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::validation(errors.join(", ")))
    }
}

fn check_text(errors: &mut Vec<String>, field: &str, value: &str, max: usize) {
    if value.trim().is_empty() {
        errors.push(format!("{field} must not be empty"));
    } else if value.chars().count() > max {
        errors.push(format!("{field} must be at most {max} characters"));
    }
}

/// Registry of live sessions keyed by id.
pub struct SessionManager {
    factory: Arc<dyn PoolFactory>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a session, closing any previous session with the same id.
    pub async fn create(&self, id: &str, config: PolicyConfig) -> Session {
        let session = Session::new(id, config, Arc::clone(&self.factory));
        let previous = self
            .sessions
            .write()
            .await
            .insert(id.to_string(), session.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }
        session
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Removes the session and closes its pool. Returns false if unknown.
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
