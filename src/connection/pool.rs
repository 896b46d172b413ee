//! Connection pool lifecycle for one session.
//!
//! ```text
//! Uninitialized --init--> Active --settings changed--> (close, init) --> Active
//! Active --open failure--> Error --reconnect--> Reconnecting --> Active | Error
//! any --close--> Closed
//! ```
//!
//! The pool handle lives in a slot guarded by a short-lived `std` lock that
//! is never held across an await. Every transition that opens or closes a
//! handle goes through the per-pool rebuild lock, so a rebuild cannot race a
//! concurrent `get_connection`.

use crate::config::{AuthPlugin, SessionConfig};
use crate::db::{DatabaseConnection, DatabasePool, PoolFactory};
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Plugin fallback attempts made after the first authentication failure.
pub const MAX_AUTH_RETRIES: u32 = 3;

/// Lifecycle state of a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Uninitialized,
    Active,
    Error,
    Reconnecting,
    Closed,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Active => "active",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// States that `ensure_pool` opens from.
    fn needs_open(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Closed)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health snapshot of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub state: PoolState,
    /// Plugin of the last successful open, or the configured one before that.
    pub auth_plugin: String,
    /// RFC 3339 time of the last successful open.
    pub last_connection_time: Option<String>,
    /// Failed opens since the last successful one.
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

struct Slot {
    handle: Option<Arc<dyn DatabasePool>>,
    state: PoolState,
    /// Hash of the connection settings the current handle was opened with.
    config_hash: Option<String>,
    /// Config generation at which `config_hash` was last confirmed.
    generation: u64,
    /// Outer `None` means no open has succeeded yet.
    successful_plugin: Option<Option<AuthPlugin>>,
    last_connection_time: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

impl Slot {
    fn new() -> Self {
        Self {
            handle: None,
            state: PoolState::Uninitialized,
            config_hash: None,
            generation: 0,
            successful_plugin: None,
            last_connection_time: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// One session's pool: opens lazily, rebuilds when connection settings
/// change, and falls back across authentication plugins.
pub struct ConnectionPool {
    config: SessionConfig,
    factory: Arc<dyn PoolFactory>,
    slot: RwLock<Slot>,
    rebuild: Mutex<()>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(config: SessionConfig, factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            config,
            factory,
            slot: RwLock::new(Slot::new()),
            rebuild: Mutex::new(()),
        }
    }

    /// The config this pool reads its connection settings from.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        self.slot().state
    }

    fn slot(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_mut(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the pool unless it is already active. The error state is left
    /// alone: recovering from it takes an explicit [`reconnect`](Self::reconnect).
    pub async fn ensure_pool(&self) -> Result<()> {
        if !self.state().needs_open() {
            return Ok(());
        }

        let _guard = self.rebuild.lock().await;
        if self.state().needs_open() {
            self.initialize_locked(MAX_AUTH_RETRIES, PoolState::Closed)
                .await?;
        }
        Ok(())
    }

    /// Closes any existing pool and opens a new one.
    pub async fn initialize_pool(&self, max_auth_retries: u32) -> Result<()> {
        let _guard = self.rebuild.lock().await;
        self.initialize_locked(max_auth_retries, PoolState::Closed)
            .await
    }

    /// Checks out a connection, rebuilding the pool first if the connection
    /// settings changed since it was opened.
    pub async fn get_connection(&self) -> Result<Box<dyn DatabaseConnection>> {
        self.ensure_pool().await?;

        if self.needs_rebuild() {
            let _guard = self.rebuild.lock().await;
            if self.needs_rebuild() {
                warn!("Connection settings changed, rebuilding connection pool");
                self.initialize_locked(MAX_AUTH_RETRIES, PoolState::Closed)
                    .await?;
            }
        }

        let handle = {
            let slot = self.slot();
            match (slot.state, &slot.handle) {
                (PoolState::Active, Some(handle)) => Arc::clone(handle),
                (state, _) => {
                    return Err(GatewayError::pool_unavailable(format!(
                        "connection pool is {state}; call reconnect to recover"
                    )))
                }
            }
        };

        let timeout = self.config.read(|c| c.pool_acquire_timeout);
        tokio::time::timeout(timeout, handle.acquire())
            .await
            .map_err(|_| {
                GatewayError::pool_unavailable(format!(
                    "timed out after {:.1}s waiting for a free connection",
                    timeout.as_secs_f64()
                ))
            })?
    }

    /// Closes the current pool and opens a fresh one, whatever the state.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.rebuild.lock().await;
        info!(from = %self.state(), "Reconnecting connection pool");
        self.initialize_locked(MAX_AUTH_RETRIES, PoolState::Reconnecting)
            .await
    }

    /// Closes the pool. Idempotent; the state is `Closed` afterwards even if
    /// the close itself is interrupted.
    pub async fn close_pool(&self) {
        let _guard = self.rebuild.lock().await;
        self.close_locked(PoolState::Closed).await;
    }

    pub fn info(&self) -> PoolInfo {
        let configured = self.config.read(|c| c.auth_plugin);
        let slot = self.slot();
        PoolInfo {
            state: slot.state,
            auth_plugin: AuthPlugin::label(slot.successful_plugin.unwrap_or(configured))
                .to_string(),
            last_connection_time: slot.last_connection_time.map(|t| t.to_rfc3339()),
            reconnect_attempts: slot.reconnect_attempts,
            last_error: slot.last_error.clone(),
        }
    }

    /// True when the pool is active and the connection settings no longer
    /// match the ones it was opened with. Only hashes when the config
    /// generation moved.
    fn needs_rebuild(&self) -> bool {
        let (state, generation, recorded) = {
            let slot = self.slot();
            (slot.state, slot.generation, slot.config_hash.clone())
        };
        if state != PoolState::Active {
            return false;
        }

        let current_generation = self.config.generation();
        if current_generation == generation {
            return false;
        }

        let current = self.config.connection_hash();
        if recorded.as_deref() == Some(current.as_str()) {
            self.slot_mut().generation = current_generation;
            false
        } else {
            true
        }
    }

    /// Takes the handle out and marks the slot `next` before awaiting the
    /// close, so a cancelled close never leaves a half-closed pool behind.
    async fn close_locked(&self, next: PoolState) {
        let handle = {
            let mut slot = self.slot_mut();
            slot.state = next;
            slot.config_hash = None;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            info!("Closing connection pool");
            handle.close().await;
        }
    }

    async fn initialize_locked(&self, max_auth_retries: u32, transitional: PoolState) -> Result<()> {
        self.close_locked(transitional).await;

        // Read before the snapshot: an update racing this open bumps the
        // generation again and forces a hash check on the next checkout.
        let generation = self.config.generation();
        let mut params = self.config.snapshot().connect_params();
        if let Some(plugin) = self.slot().successful_plugin {
            params.auth_plugin = plugin;
        }

        info!(
            server = %params.display_string(),
            plugin = AuthPlugin::label(params.auth_plugin),
            "Initializing connection pool"
        );

        match self.factory.open(&params).await {
            Ok(handle) => {
                self.activate(handle, params.auth_plugin, generation);
                Ok(())
            }
            Err(GatewayError::Authentication(message)) if max_auth_retries > 0 => {
                warn!(%message, "Authentication plugin rejected, trying alternatives");
                let mut retries = max_auth_retries;
                let mut last_error = message;

                for plugin in AuthPlugin::FALLBACK_ORDER {
                    params.auth_plugin = plugin;
                    info!(plugin = AuthPlugin::label(plugin), "Trying authentication plugin");
                    match self.factory.open(&params).await {
                        Ok(handle) => {
                            info!(plugin = AuthPlugin::label(plugin), "Connected");
                            self.activate(handle, plugin, generation);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(plugin = AuthPlugin::label(plugin), error = %e, "Plugin failed");
                            last_error = e.to_string();
                            retries -= 1;
                            if retries == 0 {
                                break;
                            }
                        }
                    }
                }

                error!("All authentication plugins failed");
                let err = GatewayError::connection(format!(
                    "Unable to connect to {}: no authentication plugin was accepted (last error: {last_error})",
                    params.display_string()
                ));
                self.fail(&err);
                Err(err)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn activate(
        &self,
        handle: Arc<dyn DatabasePool>,
        plugin: Option<AuthPlugin>,
        generation: u64,
    ) {
        let mut opened_with = self.config.snapshot();
        if opened_with.auth_plugin != plugin {
            self.config.set_auth_plugin(plugin);
            opened_with.auth_plugin = plugin;
        }

        let mut slot = self.slot_mut();
        slot.handle = Some(handle);
        slot.state = PoolState::Active;
        slot.config_hash = Some(opened_with.connection_hash());
        slot.generation = generation;
        slot.successful_plugin = Some(plugin);
        slot.last_connection_time = Some(Utc::now());
        slot.reconnect_attempts = 0;
        slot.last_error = None;
        info!("Connection pool initialized");
    }

    fn fail(&self, err: &GatewayError) {
        let hint = connection_hint(&err.to_string());
        let mut slot = self.slot_mut();
        slot.state = PoolState::Error;
        slot.reconnect_attempts += 1;
        slot.last_error = Some(err.to_string());
        warn!(
            error = %err,
            hint = hint.unwrap_or("none"),
            attempts = slot.reconnect_attempts,
            "Connection pool failed to initialize"
        );
    }
}

/// Operator hint for a pool-open failure message.
fn connection_hint(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();
    if lower.contains("plugin") {
        Some("set MYSQL_DB_AUTH_PLUGIN to a plugin the server supports")
    } else if lower.contains("access denied") {
        Some("check MYSQL_USER, MYSQL_PASSWORD and the account's host grants")
    } else if lower.contains("unknown database") || lower.contains("does not exist") {
        Some("check MYSQL_DATABASE")
    } else if lower.contains("refused") || lower.contains("cannot connect") {
        Some("check MYSQL_HOST and MYSQL_PORT, and that the server is running")
    } else {
        None
    }
}
