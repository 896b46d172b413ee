//! End-to-end gateway tests against the in-memory backend.
//!
//! Tests the full path: parameter binding, gate, pool checkout, execution
//! and result shaping.

use std::sync::Arc;

use mysql_gate::config::*;
use mysql_gate::connection::Session;
use mysql_gate::db::{ColumnInfo, MockPoolFactory, QueryResult, Value};
use mysql_gate::error::GatewayError;
use mysql_gate::query::QueryParams;
use mysql_gate::safety::{
    has_statement_separator, Gate, RiskLevel, Rule, ScopeGuard, StatementParser,
};
use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};

const ALL_RISK_LEVELS: (&str, &str) = (MYSQL_ALLOWED_RISK_LEVELS, "LOW,MEDIUM,HIGH,CRITICAL");

fn session(factory: &MockPoolFactory, entries: &[(&str, &str)]) -> Session {
    let config = PolicyConfig::from_map(entries.iter().copied()).unwrap();
    Session::new("test", config, Arc::new(factory.clone()))
}

#[tokio::test]
async fn test_destructive_verbs_are_always_hard_blocked() {
    let factory = MockPoolFactory::new();
    let session = session(
        &factory,
        &[ALL_RISK_LEVELS, (MYSQL_ENABLE_QUERY_CHECK, "false")],
    );
    let exec = session.executor();

    for sql in [
        "DROP TABLE users",
        "TRUNCATE TABLE users",
        "ALTER TABLE users ADD COLUMN age INT",
        "RENAME TABLE users TO people",
        "LOCK TABLES users WRITE",
        "DELETE FROM users WHERE id = 1",
        "UPDATE users SET name = 'x' WHERE id = 1",
    ] {
        let err = exec
            .execute_query(sql, QueryParams::None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, GatewayError::HardBlock { .. }),
            "{sql}: expected hard block, got {err}"
        );
    }
    assert_eq!(factory.acquisitions(), 0);
}

#[tokio::test]
async fn test_destructive_verb_hidden_by_comment_rules_is_blocked() {
    let factory = MockPoolFactory::new();
    let exec = session(&factory, &[]).executor();

    for sql in [
        "SELECT 1 --1; DELETE FROM users",
        "SELECT 1 --x; UPDATE users SET name = 'x'",
        "SELECT 1 /* /* */ ; ALTER TABLE users ADD COLUMN age INT",
        "SELECT 1 /*!50000 ; RENAME TABLE users TO people */",
    ] {
        let err = exec
            .execute_query(sql, QueryParams::None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, GatewayError::HardBlock { .. }),
            "{sql}: expected hard block, got {err}"
        );
    }

    // A real trailing comment is still a single statement.
    assert_ok!(exec.execute_query("SELECT 1 LIMIT 1 --", QueryParams::None).await);
    assert_ok!(
        exec.execute_query("SELECT 1 LIMIT 1 -- ; DELETE FROM users", QueryParams::None)
            .await
    );
    assert_eq!(
        factory.executed(),
        vec![
            "SELECT 1 LIMIT 1 --",
            "SELECT 1 LIMIT 1 -- ; DELETE FROM users",
        ]
    );
}

#[test]
fn test_parser_scope_and_driver_agree_on_boundaries() {
    let policy = PolicyConfig::from_map([
        (MYSQL_ENABLE_DATABASE_ISOLATION, "true"),
        (MYSQL_DATABASE_ACCESS_LEVEL, "restricted"),
        (MYSQL_DATABASE, "appdb"),
    ])
    .unwrap();
    let parser = StatementParser::new();
    let scope = ScopeGuard::new();
    let gate = Gate::new();

    // (sql, the server reads more than one statement)
    let cases = [
        ("SELECT * FROM appdb.t --x\n", false),
        ("SELECT 1 --1; SELECT * FROM otherdb.t", true),
        ("SELECT 1 -- ; SELECT * FROM otherdb.t", false),
        ("SELECT 1 # ; SELECT * FROM otherdb.t", false),
        ("SELECT 1 /* /* */ ; SELECT * FROM otherdb.t", true),
        ("SELECT 1 /*! ; SELECT * FROM otherdb.t */", true),
        (r"SELECT 'x\'; SELECT * FROM otherdb.t' FROM appdb.t", false),
        ("SELECT 'a''b; otherdb.t' FROM appdb.t", false),
    ];

    for (sql, multi) in cases {
        let stmt = parser.parse(sql);
        assert_eq!(stmt.is_multi_statement, multi, "parser: {sql}");
        assert_eq!(has_statement_separator(sql), multi, "separator: {sql}");
        let decision = gate.check_operation(sql, &policy);
        assert_eq!(
            decision.statement.map(|s| s.is_multi_statement),
            Some(multi),
            "gate: {sql}"
        );

        // Only the hidden second statement names otherdb.
        let (allowed, _) = scope.check(sql, &policy);
        assert_eq!(allowed, !multi, "scope: {sql}");
    }
}

#[test]
fn test_delete_without_where_is_riskier() {
    let exec = session(&MockPoolFactory::new(), &[]).executor();

    let bounded = exec.check_operation("DELETE FROM users WHERE id = 1");
    let unbounded = exec.check_operation("DELETE FROM users");

    assert!(unbounded.risk_level > bounded.risk_level);
    assert_eq!(unbounded.risk_level, Some(RiskLevel::High));
}

#[tokio::test]
async fn test_restricted_scope() {
    let factory = MockPoolFactory::new();
    let session = session(
        &factory,
        &[
            (MYSQL_DATABASE_ACCESS_LEVEL, "restricted"),
            (MYSQL_ENABLE_DATABASE_ISOLATION, "true"),
            (MYSQL_DATABASE, "appdb"),
        ],
    );
    let exec = session.executor();

    assert_ok!(
        exec.execute_query("SELECT * FROM appdb.t LIMIT 1", QueryParams::None)
            .await
    );

    let err = assert_err!(
        exec.execute_query("SELECT * FROM otherdb.t LIMIT 1", QueryParams::None)
            .await
    );
    match err {
        GatewayError::Scope { violations } => {
            assert!(violations.iter().any(|v| v.contains("otherdb")))
        }
        other => panic!("expected scope violation, got {other}"),
    }
    assert_eq!(factory.acquisitions(), 1);
}

#[test]
fn test_strict_denies_show_databases() {
    let exec = session(
        &MockPoolFactory::new(),
        &[
            (MYSQL_DATABASE_ACCESS_LEVEL, "strict"),
            (MYSQL_ENABLE_DATABASE_ISOLATION, "true"),
            (MYSQL_DATABASE, "appdb"),
        ],
    )
    .executor();

    let decision = exec.check_operation("SHOW DATABASES");
    assert!(!decision.allowed);
    assert!(decision.has_rule(Rule::Scope));
}

#[tokio::test]
async fn test_empty_sql_never_touches_the_network() {
    let factory = MockPoolFactory::new();
    let exec = session(&factory, &[]).executor();

    let decision = exec.check_operation("");
    assert!(!decision.allowed);
    assert!(decision.has_rule(Rule::Empty));

    let err = assert_err!(exec.execute_query("   ", QueryParams::None).await);
    assert_eq!(err.category(), "validation");

    assert!(factory.open_attempts().is_empty());
    assert_eq!(factory.acquisitions(), 0);
}

#[test]
fn test_multi_statement_takes_the_highest_risk() {
    let exec = session(&MockPoolFactory::new(), &[]).executor();

    assert_eq!(
        exec.check_operation("SELECT 1 LIMIT 1").risk_level,
        Some(RiskLevel::Low)
    );

    let decision = exec.check_operation("SELECT 1; DROP TABLE t");
    assert!(!decision.allowed);
    assert_eq!(decision.risk_level, Some(RiskLevel::Critical));
}

#[tokio::test]
async fn test_show_tables_is_normalized_for_any_database() {
    for database in ["appdb", "Reports_2024"] {
        let factory = MockPoolFactory::new().with_result(
            "SHOW",
            QueryResult::with_data(
                vec![ColumnInfo::new(format!("Tables_in_{database}"), "VARCHAR")],
                vec![vec![Value::from("users")], vec![Value::from("orders")]],
            ),
        );
        let exec = session(&factory, &[]).executor();

        let rows = exec
            .execute_query("SHOW TABLES", QueryParams::None)
            .await
            .unwrap();
        let names: Vec<&Value> = rows.iter().map(|row| &row["table_name"]).collect();
        assert_eq!(names, vec![&Value::from("users"), &Value::from("orders")]);
        assert_eq!(rows[0]["database"], Value::from(database));
    }
}

#[test]
fn test_production_policy_narrows_risk_levels() {
    let exec = session(
        &MockPoolFactory::new(),
        &[ALL_RISK_LEVELS, (ENV_TYPE, "production")],
    )
    .executor();

    let config = exec.pool().config().snapshot();
    assert!(config.enable_database_isolation);
    assert_eq!(config.access_level, AccessLevel::Restricted);
    assert_eq!(
        config.allowed_risk_levels.into_iter().collect::<Vec<_>>(),
        vec![RiskLevel::Low, RiskLevel::Medium]
    );

    let decision = exec.check_operation("DELETE FROM t");
    assert!(decision.has_rule(Rule::Risk));
    assert!(decision.has_rule(Rule::HardBlock));

    let decision = exec.check_operation("SELECT * FROM t");
    assert_eq!(decision.risk_level, Some(RiskLevel::Medium));
    assert!(decision.allowed);
}

#[tokio::test]
async fn test_blocked_pattern_reports_the_rule() {
    let factory = MockPoolFactory::new();
    let exec = session(
        &factory,
        &[ALL_RISK_LEVELS, (MYSQL_BLOCKED_PATTERNS, "SLEEP,BENCHMARK")],
    )
    .executor();

    let decision = exec.check_operation("SELECT SLEEP(10) LIMIT 1");
    assert!(decision.has_rule(Rule::Pattern));

    let err = assert_err!(
        exec.execute_query("SELECT SLEEP(10) LIMIT 1", QueryParams::None)
            .await
    );
    assert_eq!(err.category(), "policy");
}

#[tokio::test]
async fn test_named_parameters_reach_the_driver_as_placeholders() {
    let factory = MockPoolFactory::new();
    let exec = session(&factory, &[]).executor();

    let params = QueryParams::Named(
        [("id".to_string(), Value::Int(7))].into_iter().collect(),
    );
    assert_ok!(
        exec.execute_query("SELECT name FROM users WHERE id = %(id)s LIMIT 1", params)
            .await
    );
    assert_eq!(
        factory.executed(),
        vec!["SELECT name FROM users WHERE id = ? LIMIT 1"]
    );
}

#[test]
fn test_parse_is_stable_under_formatting() {
    let parser = StatementParser::new();
    for sql in [
        "select id, name from users u join orders o on u.id = o.uid where o.total > 10 limit 5",
        "insert into audit (who, what) values ('a', 'b')",
        "show full tables",
        "describe users",
    ] {
        let original = parser.parse(sql);
        let formatted = parser.parse(&parser.format(sql));
        assert_eq!(formatted.operation, original.operation, "{sql}");
        assert_eq!(formatted.category, original.category, "{sql}");
        assert_eq!(formatted.tables, original.tables, "{sql}");
    }
}
