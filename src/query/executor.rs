//! Gated query execution.
//!
//! Every statement passes the gate before a connection is checked out, so a
//! denied statement never reaches the network. Allowed statements run on a
//! pooled connection; row-returning ones come back as records, everything
//! else is committed and reported as an affected-row count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionPool, PoolInfo};
use crate::db::{DatabaseConnection, Record, Value};
use crate::error::{GatewayError, Result};
use crate::safety::{has_statement_separator, Decision, Gate, ParsedStatement, SecurityReport};

use super::params::QueryParams;
use super::redact::{redact_sql, truncate};
use super::shape::shape_result;

const LOG_SQL_CHARS: usize = 150;
const SLOW_QUERY: Duration = Duration::from_millis(1000);
const NOTABLE_QUERY: Duration = Duration::from_millis(500);

/// Server version plus pool health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub version: Option<String>,
    /// Why the version query failed, when it did.
    pub error: Option<String>,
    #[serde(flatten)]
    pub pool: PoolInfo,
}

/// Runs statements for one session.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
    gate: Arc<Gate>,
}

impl QueryExecutor {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            gate: Arc::new(Gate::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Dry run: the gate's verdict under the session's current policy.
    pub fn check_operation(&self, sql: &str) -> Decision {
        let policy = self.pool.config().snapshot();
        self.gate.check_operation(sql, &policy)
    }

    pub fn security_report(&self, sql: &str) -> SecurityReport {
        let policy = self.pool.config().snapshot();
        self.gate.security_report(sql, &policy)
    }

    /// Gates and runs one statement.
    ///
    /// Multiple statements in one call are refused; run them through
    /// [`execute_transaction`](Self::execute_transaction) instead.
    pub async fn execute_query(&self, sql: &str, params: QueryParams) -> Result<Vec<Record>> {
        let (sql, values) = params.bind(sql)?;
        let stmt = self.admit(&sql)?;

        let mut conn = self.pool.get_connection().await?;
        let start = Instant::now();
        let result = run_statement(conn.as_mut(), &stmt, &sql, &values).await;
        self.log_performance(&sql, start.elapsed(), result.as_ref().err());

        result.map_err(|e| annotate_permission(e, &stmt))
    }

    /// Gates every statement, then runs them in order inside one transaction.
    ///
    /// Nothing runs unless every statement is allowed. The first failure
    /// rolls the whole transaction back.
    pub async fn execute_transaction(&self, statements: &[&str]) -> Result<Vec<Vec<Record>>> {
        if statements.is_empty() {
            return Err(GatewayError::validation("transaction has no statements"));
        }
        let parsed = statements
            .iter()
            .map(|sql| self.admit(sql))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.pool.get_connection().await?;
        conn.begin().await?;

        let mut results = Vec::with_capacity(statements.len());
        for (sql, stmt) in statements.iter().zip(&parsed) {
            let start = Instant::now();
            let outcome = if stmt.returns_rows() {
                fetch_records(conn.as_mut(), stmt, sql, &[]).await
            } else {
                conn.execute(sql, &[])
                    .await
                    .map(|affected| vec![affected_record(stmt, affected)])
            };
            self.log_performance(sql, start.elapsed(), outcome.as_ref().err());

            match outcome {
                Ok(records) => results.push(records),
                Err(e) => {
                    if let Err(rollback) = conn.rollback().await {
                        error!(error = %rollback, "Rollback failed");
                    }
                    warn!(error = %e, "Transaction rolled back");
                    return Err(annotate_permission(e, stmt));
                }
            }
        }

        conn.commit().await?;
        info!(statements = statements.len(), "Transaction committed");
        Ok(results)
    }

    /// Name of the session's default database, if one is selected.
    pub async fn get_current_database(&self) -> Result<Option<String>> {
        let rows = self
            .execute_query("SELECT DATABASE() AS db LIMIT 1", QueryParams::None)
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("db"))
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    /// Server version and pool health. Pool health is reported even when
    /// the version query fails.
    pub async fn get_database_info(&self) -> DatabaseInfo {
        let outcome = self
            .execute_query("SELECT VERSION() AS version LIMIT 1", QueryParams::None)
            .await;

        let (version, error) = match outcome {
            Ok(rows) => (
                rows.first()
                    .and_then(|row| row.get("version"))
                    .map(Value::to_display_string),
                None,
            ),
            Err(e) => (None, Some(e.to_string())),
        };

        DatabaseInfo {
            version,
            error,
            pool: self.pool.info(),
        }
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.pool.reconnect().await
    }

    pub async fn close_pool(&self) {
        self.pool.close_pool().await;
    }

    /// Runs the gate and the single-statement check. Fails closed.
    fn admit(&self, sql: &str) -> Result<ParsedStatement> {
        let policy = self.pool.config().snapshot();
        let decision = self.gate.enforce_operation(sql, &policy)?;
        let stmt = decision
            .statement
            .unwrap_or_else(|| self.gate.parser().parse(sql));

        if stmt.is_multi_statement || has_statement_separator(sql) {
            return Err(GatewayError::validation(format!(
                "{} statements in one call; use a transaction to run several statements",
                stmt.statement_count.max(2)
            )));
        }
        Ok(stmt)
    }

    fn log_performance(&self, sql: &str, elapsed: Duration, error: Option<&GatewayError>) {
        let password = self.pool.config().read(|c| c.password.clone());
        let sql = truncate(&redact_sql(sql, password.expose()), LOG_SQL_CHARS);
        let ms = elapsed.as_millis() as u64;

        if let Some(e) = error {
            warn!(%sql, elapsed_ms = ms, error = %e, "Query failed");
        } else if elapsed >= SLOW_QUERY {
            warn!(%sql, elapsed_ms = ms, "Slow query");
        } else if elapsed >= NOTABLE_QUERY {
            info!(%sql, elapsed_ms = ms, "Query took longer than usual");
        } else {
            debug!(%sql, elapsed_ms = ms, "Query executed");
        }
    }
}

async fn run_statement(
    conn: &mut dyn DatabaseConnection,
    stmt: &ParsedStatement,
    sql: &str,
    values: &[Value],
) -> Result<Vec<Record>> {
    if stmt.returns_rows() {
        return fetch_records(conn, stmt, sql, values).await;
    }

    let affected = conn.execute(sql, values).await?;
    conn.commit().await?;
    debug!(operation = %stmt.operation, affected, "Statement committed");
    Ok(vec![affected_record(stmt, affected)])
}

async fn fetch_records(
    conn: &mut dyn DatabaseConnection,
    stmt: &ParsedStatement,
    sql: &str,
    values: &[Value],
) -> Result<Vec<Record>> {
    let mut result = conn.fetch_all(sql, values).await?;
    shape_result(stmt, &mut result);
    Ok(result.records())
}

fn affected_record(stmt: &ParsedStatement, affected: u64) -> Record {
    Record::from([
        ("operation".to_string(), Value::from(stmt.operation.as_str())),
        ("affected_rows".to_string(), Value::from(affected)),
    ])
}

/// Privilege errors from the driver carry no statement context; fill it in.
fn annotate_permission(err: GatewayError, stmt: &ParsedStatement) -> GatewayError {
    match err {
        GatewayError::Permission { message, .. } => {
            GatewayError::permission(stmt.operation.clone(), stmt.table_list(), message)
        }
        other => other,
    }
}
