//! Error types for the gateway.
//!
//! Every rejection and failure surfaced to a caller is one of these variants,
//! so callers can tell which rule fired without parsing message text.

use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Empty, oversize or structurally invalid SQL. Rejected before any network call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Risk-level denial or blocked-pattern match.
    #[error("Policy violation: {0}")]
    Policy(String),

    /// One or more database-boundary violations.
    #[error("Scope violation: {}", violations.join("; "))]
    Scope { violations: Vec<String> },

    /// Destructive verb refused at execution time regardless of policy.
    #[error("Operation {operation} is blocked unconditionally")]
    HardBlock { operation: String },

    /// Pool open failed because the server rejected the authentication plugin.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Pool could not be opened (all plugins exhausted, host unreachable, ...).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Pool is closed, in the error state, or no connection slot freed up in time.
    #[error("Pool unavailable: {0}")]
    PoolUnavailable(String),

    /// Privilege error reported by the server at query time.
    #[error("Permission denied for {operation} on {table}: {message}")]
    Permission {
        operation: String,
        table: String,
        message: String,
    },

    /// Any other driver-reported error while running a statement.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Invalid configuration value or file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal state.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Creates a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates a policy violation with the given message.
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Creates a scope violation carrying every failed check.
    pub fn scope(violations: Vec<String>) -> Self {
        Self::Scope { violations }
    }

    /// Creates a hard-block error for the given verb.
    pub fn hard_block(operation: impl Into<String>) -> Self {
        Self::HardBlock {
            operation: operation.into(),
        }
    }

    /// Creates an authentication error with the given message.
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a pool-unavailable error with the given message.
    pub fn pool_unavailable(msg: impl Into<String>) -> Self {
        Self::PoolUnavailable(msg.into())
    }

    /// Creates a permission error.
    pub fn permission(
        operation: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Permission {
            operation: operation.into(),
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates an execution error with the given message.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the rule class that produced this error.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Policy(_) => "policy",
            Self::Scope { .. } => "scope",
            Self::HardBlock { .. } => "hard_block",
            Self::Authentication(_) => "authentication",
            Self::Connection(_) => "connection",
            Self::PoolUnavailable(_) => "pool_unavailable",
            Self::Permission { .. } => "permission",
            Self::Execution(_) => "execution",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// True for rejections rendered before any statement reaches the server.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Policy(_) | Self::Scope { .. } | Self::HardBlock { .. }
        )
    }

    /// True when an explicit `reconnect` may resolve the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolUnavailable(_))
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
