//! Connection pool lifecycle tests.
//!
//! Tests rebuild-on-change, authentication-plugin fallback and recovery
//! through the public session API.

use std::sync::Arc;

use mysql_gate::config::*;
use mysql_gate::connection::{PoolState, Session, MAX_AUTH_RETRIES};
use mysql_gate::db::MockPoolFactory;
use mysql_gate::error::GatewayError;
use mysql_gate::query::QueryParams;
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;

fn session(factory: &MockPoolFactory, entries: &[(&str, &str)]) -> Session {
    let config = PolicyConfig::from_map(entries.iter().copied()).unwrap();
    Session::new("pool-test", config, Arc::new(factory.clone()))
}

#[tokio::test]
async fn test_unchanged_config_reuses_the_pool() {
    let factory = MockPoolFactory::new();
    let session = session(&factory, &[]);

    drop(assert_ok!(session.pool().get_connection().await));
    drop(assert_ok!(session.pool().get_connection().await));

    assert_eq!(factory.pools_created(), 1);
    assert_eq!(factory.acquisitions(), 2);
}

#[tokio::test]
async fn test_port_change_triggers_exactly_one_rebuild() {
    let factory = MockPoolFactory::new();
    let session = session(&factory, &[]);
    drop(assert_ok!(session.pool().get_connection().await));

    session.config().update([(MYSQL_PORT, "3310")]).unwrap();
    for _ in 0..3 {
        drop(assert_ok!(session.pool().get_connection().await));
    }

    assert_eq!(factory.pools_created(), 2);
    assert_eq!(factory.last_params().unwrap().port, 3310);
}

#[tokio::test]
async fn test_queries_after_a_switch_use_the_new_pool() {
    let factory = MockPoolFactory::new();
    let session = session(&factory, &[(MYSQL_DATABASE, "appdb")]);
    let exec = session.executor();
    assert_ok!(exec.execute_query("SELECT 1 LIMIT 1", QueryParams::None).await);

    session.config().update([(MYSQL_DATABASE, "reports")]).unwrap();
    assert_ok!(exec.execute_query("SELECT 1 LIMIT 1", QueryParams::None).await);

    assert_eq!(factory.pools_created(), 2);
    assert_eq!(factory.pools_closed(), 1);
    assert_eq!(factory.last_params().unwrap().database, "reports");
}

#[tokio::test]
async fn test_plugin_fallback_persists_the_working_plugin() {
    let factory =
        MockPoolFactory::new().fail_plugins([Some(AuthPlugin::CachingSha2Password), None]);
    let session = session(&factory, &[(MYSQL_DB_AUTH_PLUGIN, "caching_sha2_password")]);

    assert_ok!(session.pool().initialize_pool(MAX_AUTH_RETRIES).await);

    assert_eq!(session.pool().state(), PoolState::Active);
    assert_eq!(
        session.config().get(MYSQL_DB_AUTH_PLUGIN).as_deref(),
        Some("mysql_native_password")
    );

    // A later rebuild starts from the plugin that worked.
    session.config().update([(MYSQL_PORT, "3307")]).unwrap();
    drop(assert_ok!(session.pool().get_connection().await));
    assert_eq!(
        factory.open_attempts().last().copied().flatten(),
        Some(AuthPlugin::MysqlNativePassword)
    );
}

#[tokio::test]
async fn test_error_state_requires_explicit_reconnect() {
    let factory = MockPoolFactory::new();
    factory.update(|b| {
        b.open_error = Some(GatewayError::connection("Can't connect to MySQL server"))
    });
    let session = session(&factory, &[]);
    let exec = session.executor();

    let err = exec
        .execute_query("SELECT 1 LIMIT 1", QueryParams::None)
        .await
        .unwrap_err();
    assert_eq!(err.category(), "connection");

    let err = exec
        .execute_query("SELECT 1 LIMIT 1", QueryParams::None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(factory.open_attempts().len(), 1);

    factory.update(|b| b.open_error = None);
    assert_ok!(exec.reconnect().await);
    assert_ok!(exec.execute_query("SELECT 1 LIMIT 1", QueryParams::None).await);
    assert_eq!(session.pool().info().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_close_then_reuse() {
    let factory = MockPoolFactory::new();
    let session = session(&factory, &[]);
    let exec = session.executor();
    assert_ok!(exec.execute_query("SELECT 1 LIMIT 1", QueryParams::None).await);

    exec.close_pool().await;
    exec.close_pool().await;
    assert_eq!(session.pool().state(), PoolState::Closed);
    assert_eq!(factory.pools_closed(), 1);

    assert_ok!(exec.execute_query("SELECT 1 LIMIT 1", QueryParams::None).await);
    assert_eq!(session.pool().state(), PoolState::Active);
    assert_eq!(factory.pools_created(), 2);
}
