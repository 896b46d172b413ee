//! MySQL backend built on sqlx.
//!
//! sqlx negotiates the authentication plugin with the server on its own, so
//! a requested plugin is recorded in the logs but not forced on the wire.
//! Plugin rejections are still reported as authentication errors so the
//! pool's fallback loop behaves the same for every backend.

use crate::config::{AuthPlugin, ConnectParams};
use crate::db::{
    ColumnInfo, DatabaseConnection, DatabasePool, PoolFactory, QueryResult, Row, Value,
};
use crate::error::{GatewayError, Result};
use crate::safety::has_statement_separator;
use async_trait::async_trait;
use sqlx::mysql::{
    MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlPool,
    MySqlPoolOptions, MySqlQueryResult, MySqlRow,
};
use std::future::Future;
use std::pin::Pin;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column as SqlxColumn, Executor, Row as SqlxRow, TypeInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Server error numbers that mean "you lack the privilege", as opposed to a
/// broken statement: 1044 (database access), 1045 (access denied),
/// 1142 (table command), 1143 (column command), 1227 (SUPER or similar).
pub const PERMISSION_ERROR_CODES: &[u16] = &[1044, 1045, 1142, 1143, 1227];

/// "This command is not supported in the prepared statement protocol yet".
const ER_UNSUPPORTED_PS: u16 = 1295;

/// Lower bound on the pool-open timeout.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens sqlx MySQL pools.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlPoolFactory;

impl MySqlPoolFactory {
    pub fn new() -> Self {
        Self
    }
}

fn connect_options(params: &ConnectParams) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.user)
        .password(params.password.expose())
        .charset("utf8mb4");

    if !params.database.is_empty() {
        options = options.database(&params.database);
    }
    options
}

#[async_trait]
impl PoolFactory for MySqlPoolFactory {
    async fn open(&self, params: &ConnectParams) -> Result<Arc<dyn DatabasePool>> {
        debug!(
            server = %params.display_string(),
            plugin = AuthPlugin::label(params.auth_plugin),
            "Opening MySQL pool"
        );

        let timeout = params.connect_timeout.max(MIN_CONNECT_TIMEOUT);
        let pending = MySqlPoolOptions::new()
            .min_connections(params.min_connections)
            .max_connections(params.max_connections.max(1))
            .acquire_timeout(params.acquire_timeout)
            .idle_timeout(params.idle_timeout)
            .max_lifetime(params.max_lifetime)
            .connect_with(connect_options(params));

        let pool = tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| {
                GatewayError::connection(format!(
                    "Connection to {}:{} timed out after {}s. The server may be overloaded or unreachable.",
                    params.host,
                    params.port,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| map_connection_error(e, params))?;

        Ok(Arc::new(MySqlBackend { pool }))
    }
}

#[derive(Debug)]
struct MySqlBackend {
    pool: MySqlPool,
}

#[async_trait]
impl DatabasePool for MySqlBackend {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>> {
        let conn = self.pool.acquire().await.map_err(map_query_error)?;
        Ok(Box::new(PooledConnection { conn }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PooledConnection {
    conn: PoolConnection<MySql>,
}

#[async_trait]
impl DatabaseConnection for PooledConnection {
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let start = Instant::now();
        let conn: &mut MySqlConnection = &mut self.conn;

        let rows = fetch_rows(conn, sql, params)
            .await
            .map_err(map_query_error)?;

        let columns = rows.first().map(column_info).unwrap_or_default();
        let rows: Vec<Row> = rows.iter().map(convert_row).collect();

        Ok(QueryResult::with_data(columns, rows).with_execution_time(start.elapsed()))
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let conn: &mut MySqlConnection = &mut self.conn;
        let result = execute_statement(conn, sql, params)
            .await
            .map_err(map_query_error)?;

        Ok(result.rows_affected())
    }

    async fn begin(&mut self) -> Result<()> {
        run_control(&mut self.conn, "START TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<()> {
        run_control(&mut self.conn, "COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        run_control(&mut self.conn, "ROLLBACK").await
    }
}

/// Fetches the rows of one statement through the prepared protocol, where the
/// server accepts a single statement only.
async fn fetch_rows(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[Value],
) -> std::result::Result<Vec<MySqlRow>, sqlx::Error> {
    let prepared = prepared_fetch_all(&mut *conn, sql, params).await;

    match prepared {
        Err(e) if can_run_as_text(&e, sql, params) => text_fetch_all(conn, sql).await,
        result => result,
    }
}

async fn execute_statement(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[Value],
) -> std::result::Result<MySqlQueryResult, sqlx::Error> {
    let prepared = prepared_execute(&mut *conn, sql, params).await;

    match prepared {
        Err(e) if can_run_as_text(&e, sql, params) => text_execute(conn, sql).await,
        result => result,
    }
}

fn prepared_fetch_all<'a>(
    conn: &'a mut MySqlConnection,
    sql: &'a str,
    params: &'a [Value],
) -> BoxFuture<'a, std::result::Result<Vec<MySqlRow>, sqlx::Error>> {
    Box::pin(
        bind_params(sqlx::query(sql), params)
            .persistent(false)
            .fetch_all(conn),
    )
}

fn prepared_execute<'a>(
    conn: &'a mut MySqlConnection,
    sql: &'a str,
    params: &'a [Value],
) -> BoxFuture<'a, std::result::Result<MySqlQueryResult, sqlx::Error>> {
    Box::pin(
        bind_params(sqlx::query(sql), params)
            .persistent(false)
            .execute(conn),
    )
}

fn text_fetch_all<'a>(
    conn: &'a mut MySqlConnection,
    sql: &'a str,
) -> BoxFuture<'a, std::result::Result<Vec<MySqlRow>, sqlx::Error>> {
    conn.fetch_all(sqlx::raw_sql(sql))
}

fn text_execute<'a>(
    conn: &'a mut MySqlConnection,
    sql: &'a str,
) -> BoxFuture<'a, std::result::Result<MySqlQueryResult, sqlx::Error>> {
    conn.execute(sqlx::raw_sql(sql))
}

/// Statements the prepared protocol rejects (`USE`, `LOCK`, some `SHOW`
/// forms) may go over the text protocol, but only without parameters and
/// only when the server would read a single statement.
fn can_run_as_text(error: &sqlx::Error, sql: &str, params: &[Value]) -> bool {
    let unsupported = error
        .as_database_error()
        .and_then(|e| e.try_downcast_ref::<MySqlDatabaseError>())
        .is_some_and(|e| e.number() == ER_UNSUPPORTED_PS);
    unsupported && params.is_empty() && !has_statement_separator(sql)
}

async fn run_control(conn: &mut MySqlConnection, sql: &'static str) -> Result<()> {
    text_execute(conn, sql)
        .await
        .map(|_| ())
        .map_err(map_query_error)
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [Value],
) -> Query<'q, MySql, MySqlArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::String(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
        };
    }
    query
}

fn column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

fn convert_row(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Decodes one column by its MySQL type name, falling back to text and then
/// raw bytes for anything without a native mapping.
fn convert_value(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    let typed = match type_name {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(index).ok().map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<Option<i64>, _>(index).ok().map(Value::from)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row.try_get::<Option<u64>, _>(index).ok().map(Value::from),
        "YEAR" => row
            .try_get_unchecked::<Option<u64>, _>(index)
            .ok()
            .map(Value::from),
        "FLOAT" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .map(|v| Value::from(v.map(f64::from))),
        "DOUBLE" => row.try_get::<Option<f64>, _>(index).ok().map(Value::from),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .ok()
            .map(|v| Value::from(v.map(|d| d.to_string()))),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .ok()
            .map(|v| Value::from(v.map(|d| d.to_string()))),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(index)
            .ok()
            .map(|v| Value::from(v.map(|t| t.to_string()))),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .map(Value::from),
        _ => row.try_get::<Option<String>, _>(index).ok().map(Value::from),
    };

    typed.unwrap_or_else(|| {
        row.try_get_unchecked::<Option<String>, _>(index)
            .map(Value::from)
            .or_else(|_| row.try_get_unchecked::<Option<Vec<u8>>, _>(index).map(Value::from))
            .unwrap_or(Value::Null)
    })
}

/// Maps pool-open failures to actionable messages. Plugin rejections become
/// [`GatewayError::Authentication`] so the caller can try another plugin.
fn map_connection_error(error: sqlx::Error, params: &ConnectParams) -> GatewayError {
    let message = error.to_string();
    let lower = message.to_lowercase();

    if lower.contains("plugin") {
        GatewayError::authentication(format!(
            "Authentication plugin {} was rejected for user '{}': {message}",
            AuthPlugin::label(params.auth_plugin),
            params.user
        ))
    } else if lower.contains("access denied") {
        GatewayError::connection(format!(
            "Access denied for user '{}'. Check MYSQL_USER and MYSQL_PASSWORD.",
            params.user
        ))
    } else if lower.contains("unknown database") {
        GatewayError::connection(format!(
            "Database '{}' does not exist. Check MYSQL_DATABASE.",
            params.database
        ))
    } else if lower.contains("connection refused") || lower.contains("could not connect") {
        GatewayError::connection(format!(
            "Cannot connect to {}:{}. Check that the server is running.",
            params.host, params.port
        ))
    } else if lower.contains("timed out") || lower.contains("timeout") {
        GatewayError::connection(format!(
            "Connection to {}:{} timed out. The server may be overloaded or unreachable.",
            params.host, params.port
        ))
    } else {
        GatewayError::connection(message)
    }
}

/// Maps query-time failures. Privilege errors come back as
/// [`GatewayError::Permission`] with the operation and table left empty for
/// the executor to fill in.
fn map_query_error(error: sqlx::Error) -> GatewayError {
    match &error {
        sqlx::Error::PoolTimedOut => {
            return GatewayError::pool_unavailable("timed out waiting for a free connection")
        }
        sqlx::Error::PoolClosed => return GatewayError::pool_unavailable("pool is closed"),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            return GatewayError::connection(error.to_string())
        }
        _ => {}
    }

    let Some(db_error) = error.as_database_error() else {
        return GatewayError::execution(error.to_string());
    };
    let message = db_error.message().to_string();

    match db_error.try_downcast_ref::<MySqlDatabaseError>() {
        Some(mysql) if PERMISSION_ERROR_CODES.contains(&mysql.number()) => {
            GatewayError::permission("", "", format!("({}) {message}", mysql.number()))
        }
        Some(mysql) => GatewayError::execution(format!("({}) {message}", mysql.number())),
        None => GatewayError::execution(message),
    }
}
