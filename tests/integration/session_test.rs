//! Session isolation and database switching.

use std::sync::Arc;

use mysql_gate::config::*;
use mysql_gate::connection::{PoolState, SessionManager};
use mysql_gate::db::MockPoolFactory;
use mysql_gate::error::GatewayError;
use mysql_gate::query::QueryParams;
use pretty_assertions::assert_eq;

fn tenant(database: &str) -> PolicyConfig {
    PolicyConfig::from_map([
        (MYSQL_HOST, "db.internal"),
        (MYSQL_USER, "app"),
        (MYSQL_PASSWORD, "secret"),
        (MYSQL_DATABASE, database),
        (MYSQL_ENABLE_DATABASE_ISOLATION, "true"),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_concurrent_sessions_keep_their_own_scope() {
    let factory = MockPoolFactory::new();
    let manager = Arc::new(SessionManager::new(Arc::new(factory.clone())));
    manager.create("alice", tenant("sales")).await;
    manager.create("bob", tenant("hr")).await;

    let tasks: Vec<_> = [("alice", "sales"), ("bob", "hr")]
        .into_iter()
        .map(|(id, own)| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let exec = manager.get(id).await.unwrap().executor();
                let own_query = format!("SELECT * FROM {own}.staff LIMIT 5");
                let other = if own == "sales" { "hr" } else { "sales" };
                let other_query = format!("SELECT * FROM {other}.staff LIMIT 5");

                let own_result = exec.execute_query(&own_query, QueryParams::None).await;
                let other_result = exec.execute_query(&other_query, QueryParams::None).await;
                (own_result.is_ok(), other_result.err())
            })
        })
        .collect();

    for task in tasks {
        let (own_ok, other_err) = task.await.unwrap();
        assert!(own_ok);
        assert!(matches!(other_err, Some(GatewayError::Scope { .. })));
    }
    assert_eq!(factory.pools_created(), 2);

    manager.close_all().await;
    assert_eq!(factory.pools_closed(), 2);
}

#[tokio::test]
async fn test_switch_database_moves_the_scope() {
    let factory = MockPoolFactory::new();
    let manager = SessionManager::new(Arc::new(factory.clone()));
    let session = manager.create("s", tenant("sales")).await;
    let exec = session.executor();

    session
        .switch_database("db.internal", 3306, "app", "secret", "hr")
        .await
        .unwrap();

    assert!(exec
        .execute_query("SELECT * FROM hr.staff LIMIT 1", QueryParams::None)
        .await
        .is_ok());
    assert!(exec
        .execute_query("SELECT * FROM sales.staff LIMIT 1", QueryParams::None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_switch_validation_lists_every_problem() {
    let manager = SessionManager::new(Arc::new(MockPoolFactory::new()));
    let session = manager.create("s", tenant("sales")).await;

    let err = session
        .switch_database(&"h".repeat(129), 3306, "", "pw", &"d".repeat(65))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        GatewayError::validation(
            "host must be at most 128 characters, user must not be empty, database must be at most 64 characters"
        )
    );
    assert_eq!(session.config().snapshot().database, "sales");
}

#[tokio::test]
async fn test_failed_switch_keeps_the_old_database_usable() {
    let factory = MockPoolFactory::new();
    let manager = SessionManager::new(Arc::new(factory.clone()));
    let session = manager.create("s", tenant("sales")).await;
    session.pool().ensure_pool().await.unwrap();

    factory.update(|b| b.open_error = Some(GatewayError::connection("Access denied for user 'app'")));
    let switch = session
        .switch_database("other.internal", 3306, "app", "wrong", "hr")
        .await;
    assert!(switch.is_err());

    factory.update(|b| b.open_error = None);
    session.executor().reconnect().await.unwrap();

    assert_eq!(session.pool().state(), PoolState::Active);
    let params = factory.last_params().unwrap();
    assert_eq!(params.host, "db.internal");
    assert_eq!(params.database, "sales");
}
