//! Database-scope checks.
//!
//! Works on the raw SQL text, independent of the statement parser: string
//! literals and comments are masked, backticks removed, then a fixed set of
//! patterns pulls out every database the statement names.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::lexer::{mask_literals, strip_comments};
use crate::config::{AccessLevel, PolicyConfig};

/// Schemas readable under `restricted` access.
pub const SYSTEM_DATABASES: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];

/// Words that can follow a table name without being its alias.
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "ON", "USING", "JOIN", "INNER", "LEFT", "RIGHT", "OUTER", "CROSS", "NATURAL",
    "STRAIGHT_JOIN", "SET", "GROUP", "ORDER", "LIMIT", "HAVING", "WINDOW", "UNION", "VALUES",
    "VALUE", "SELECT", "PARTITION", "FOR", "LOCK", "INTO", "USE", "IGNORE", "FORCE", "WITH",
    "AS", "FROM", "WRITE", "READ", "LOW_PRIORITY", "DEFAULT", "CHARACTER", "COLLATE",
];

static TABLE_POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(FROM|JOIN|UPDATE|INTO|TABLE|TABLES)\b").expect("valid table-position regex")
});

static TABLE_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*([\w$]+)(?:\s*\.\s*([\w$]+))?(?:\s+(?:AS\s+)?([\w$]+))?\s*")
        .expect("valid table-item regex")
});

static QUALIFIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z_$][\w$]*)\s*\.\s*([a-z_$*][\w$]*)(?:\s*\.\s*([a-z_$*][\w$]*))?")
        .expect("valid qualified-name regex")
});

static DERIVED_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\)\s*(?:AS\s+)?([\w$]+))|(?:\b([\w$]+)\s+AS\s*\()")
        .expect("valid alias regex")
});

static SHOW_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bSHOW\s+(?:FULL\s+)?(?:TABLES|TABLE\s+STATUS|TRIGGERS|EVENTS|OPEN\s+TABLES)\s+(?:FROM|IN)\s+([\w$]+)",
    )
    .expect("valid show-from regex")
});

static SHOW_COLUMNS_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bSHOW\s+(?:FULL\s+)?(?:COLUMNS|FIELDS|INDEX|INDEXES|KEYS)\s+(?:FROM|IN)\s+[\w$.]+\s+(?:FROM|IN)\s+([\w$]+)",
    )
    .expect("valid show-columns regex")
});

static SHOW_DATABASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSHOW\s+(?:DATABASES|SCHEMAS)\b").expect("valid show-databases regex")
});

static USE_DATABASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*USE\s+([\w$]+)").expect("valid use regex")
});

static DATABASE_DDL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(CREATE|DROP|ALTER)\s+(?:DATABASE|SCHEMA)\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?([\w$]+)?",
    )
    .expect("valid database-ddl regex")
});

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@@?[\w$]+(?:\.[\w$]+)?").expect("valid variable regex")
});

/// How a database name was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    /// `db.table` or `SHOW ... FROM db`.
    Qualified,
    Use,
    CreateDatabase,
    DropDatabase,
    AlterDatabase,
}

#[derive(Debug, Clone)]
struct DatabaseRef {
    name: String,
    kind: RefKind,
    /// Statement verb is DDL, which `permissive` lets cross databases.
    in_ddl: bool,
}

/// Per-query breakdown of database references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReport {
    pub isolation_enabled: bool,
    pub primary_database: String,
    pub access_level: AccessLevel,
    pub allowed_databases: Vec<String>,
    pub referenced_databases: BTreeSet<String>,
    pub is_cross_database: bool,
    pub violations: Vec<String>,
}

/// Decides whether a statement stays inside the authorized databases.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeGuard;

impl ScopeGuard {
    pub fn new() -> Self {
        Self
    }

    /// Returns one violation per failed check. Always empty when isolation is off.
    pub fn check(&self, sql: &str, policy: &PolicyConfig) -> (bool, Vec<String>) {
        if !policy.enable_database_isolation {
            return (true, Vec::new());
        }
        let violations = self.violations(sql, policy);
        (violations.is_empty(), violations)
    }

    /// Databases a session may read under its policy.
    pub fn allowed_databases(&self, policy: &PolicyConfig) -> Vec<String> {
        let mut allowed = Vec::new();
        if !policy.database.is_empty() {
            allowed.push(policy.database.clone());
        }
        if policy.access_level == AccessLevel::Restricted {
            allowed.extend(SYSTEM_DATABASES.iter().map(|db| db.to_string()));
        }
        allowed
    }

    /// True when the statement names any database other than the primary one.
    pub fn is_cross_database_query(&self, sql: &str, policy: &PolicyConfig) -> bool {
        let primary = policy.database.to_lowercase();
        extract_references(sql)
            .iter()
            .any(|r| r.name.to_lowercase() != primary)
    }

    /// Full breakdown for diagnostics. Violations are computed even when
    /// isolation is disabled, so callers can preview the effect of enabling it.
    pub fn access_report(&self, sql: &str, policy: &PolicyConfig) -> AccessReport {
        let referenced: BTreeSet<String> = extract_references(sql)
            .into_iter()
            .map(|r| r.name.to_lowercase())
            .collect();
        AccessReport {
            isolation_enabled: policy.enable_database_isolation,
            primary_database: policy.database.clone(),
            access_level: policy.access_level,
            allowed_databases: self.allowed_databases(policy),
            is_cross_database: self.is_cross_database_query(sql, policy),
            referenced_databases: referenced,
            violations: self.violations(sql, policy),
        }
    }

    fn violations(&self, sql: &str, policy: &PolicyConfig) -> Vec<String> {
        let level = policy.access_level;
        let primary = policy.database.to_lowercase();
        let mut violations = Vec::new();

        let masked = mask_sql(sql);
        if level == AccessLevel::Strict && SHOW_DATABASES.is_match(&masked) {
            violations.push("SHOW DATABASES is not allowed at access level strict".to_string());
        }

        for reference in extract_references(sql) {
            let name = reference.name.to_lowercase();
            let is_primary = !primary.is_empty() && name == primary;
            let message = match reference.kind {
                RefKind::Qualified => {
                    let ddl_exempt = reference.in_ddl && level == AccessLevel::Permissive;
                    if is_database_allowed(&name, policy) || ddl_exempt {
                        continue;
                    }
                    if level == AccessLevel::Strict && is_system_database(&name) {
                        format!("access to system database '{name}' is not allowed at access level strict")
                    } else {
                        format!(
                            "access to database '{name}' is not allowed (authorized: '{}')",
                            policy.database
                        )
                    }
                }
                RefKind::Use => {
                    if is_database_allowed(&name, policy) {
                        continue;
                    }
                    format!("USE {name} switches to a database outside the authorized scope")
                }
                RefKind::CreateDatabase => {
                    if level == AccessLevel::Permissive {
                        continue;
                    }
                    format!("CREATE DATABASE {name} is not allowed at access level {level}")
                }
                RefKind::DropDatabase => {
                    if is_primary {
                        format!("dropping the primary database '{name}' is never allowed")
                    } else if level == AccessLevel::Permissive {
                        continue;
                    } else {
                        format!("DROP DATABASE {name} is not allowed at access level {level}")
                    }
                }
                RefKind::AlterDatabase => {
                    if is_primary || level == AccessLevel::Permissive {
                        continue;
                    }
                    format!("ALTER DATABASE {name} is not allowed at access level {level}")
                }
            };
            if !violations.contains(&message) {
                violations.push(message);
            }
        }

        violations
    }
}

fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.contains(&name)
}

fn is_database_allowed(name: &str, policy: &PolicyConfig) -> bool {
    (!policy.database.is_empty() && name.eq_ignore_ascii_case(&policy.database))
        || (policy.access_level == AccessLevel::Restricted && is_system_database(name))
}

/// Collects every database reference in the statement text.
fn extract_references(sql: &str) -> Vec<DatabaseRef> {
    let masked = mask_sql(sql);
    let mut refs = Vec::new();

    for piece in masked.split(';') {
        let verb = piece
            .split_whitespace()
            .next()
            .map(str::to_uppercase)
            .unwrap_or_default();
        let in_ddl = matches!(
            verb.as_str(),
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME"
        );
        let push = |refs: &mut Vec<DatabaseRef>, name: &str, kind: RefKind| {
            refs.push(DatabaseRef {
                name: name.to_string(),
                kind,
                in_ddl,
            });
        };

        if let Some(caps) = USE_DATABASE.captures(piece) {
            push(&mut refs, &caps[1], RefKind::Use);
        }

        for caps in DATABASE_DDL.captures_iter(piece) {
            let kind = match caps[1].to_uppercase().as_str() {
                "CREATE" => RefKind::CreateDatabase,
                "DROP" => RefKind::DropDatabase,
                _ => RefKind::AlterDatabase,
            };
            // ALTER DATABASE without a name targets the current database.
            match caps.get(2).map(|m| m.as_str()) {
                Some(name) if !is_database_option(name) => push(&mut refs, name, kind),
                _ => {}
            }
        }

        for caps in SHOW_FROM
            .captures_iter(piece)
            .chain(SHOW_COLUMNS_FROM.captures_iter(piece))
        {
            push(&mut refs, &caps[1], RefKind::Qualified);
        }

        let (table_refs, declared) = scan_table_positions(piece);
        for name in &table_refs {
            push(&mut refs, name, RefKind::Qualified);
        }

        for caps in QUALIFIED.captures_iter(piece) {
            let qualifier = &caps[1];
            let three_part = caps.get(3).is_some();
            if three_part || !declared.contains(&qualifier.to_lowercase()) {
                push(&mut refs, qualifier, RefKind::Qualified);
            }
        }
    }

    refs
}

fn is_database_option(word: &str) -> bool {
    matches!(
        word.to_uppercase().as_str(),
        "DEFAULT" | "CHARACTER" | "CHARSET" | "COLLATE" | "ENCRYPTION" | "READ"
    )
}

/// Walks `FROM a [AS] x, db.b y`-style lists after each table keyword.
/// Returns databases that qualify a table in table position, and the set of
/// local names (tables, aliases, derived tables, CTEs) a qualifier may refer to.
fn scan_table_positions(piece: &str) -> (Vec<String>, BTreeSet<String>) {
    let mut databases = Vec::new();
    let mut declared = BTreeSet::new();

    for caps in DERIVED_ALIAS.captures_iter(piece) {
        if let Some(alias) = caps.get(1).or_else(|| caps.get(2)) {
            if !is_clause_word(alias.as_str()) {
                declared.insert(alias.as_str().to_lowercase());
            }
        }
    }

    for marker in TABLE_POSITION.captures_iter(piece) {
        let keyword = marker[1].to_uppercase();
        let Some(whole) = marker.get(0) else {
            continue;
        };
        let mut rest = &piece[whole.end()..];

        loop {
            let Some(item) = TABLE_ITEM.captures(rest) else {
                break;
            };
            let first = &item[1];
            if is_clause_word(first) {
                break;
            }
            match item.get(2) {
                Some(table) => {
                    databases.push(first.to_string());
                    declared.insert(table.as_str().to_lowercase());
                }
                None => {
                    declared.insert(first.to_lowercase());
                }
            }
            if let Some(alias) = item.get(3) {
                if !is_clause_word(alias.as_str()) {
                    declared.insert(alias.as_str().to_lowercase());
                }
            }

            let Some(end) = item.get(0).map(|m| m.end()) else {
                break;
            };
            rest = &rest[end..];
            let lists = matches!(keyword.as_str(), "FROM" | "TABLE" | "TABLES" | "UPDATE");
            match rest.strip_prefix(',') {
                Some(next) if lists => rest = next,
                _ => break,
            }
        }
    }

    (databases, declared)
}

fn is_clause_word(word: &str) -> bool {
    CLAUSE_WORDS.contains(&word.to_uppercase().as_str())
}

/// Replaces string literals with `''`, drops comments and backticks, and
/// removes `@var`/`@@scope.var` references. The body of a versioned comment
/// (`/*!50000 ... */`) is kept since MySQL executes it.
fn mask_sql(sql: &str) -> String {
    let masked = mask_literals(&strip_comments(sql)).replace('`', "");
    VARIABLE.replace_all(&masked, " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MYSQL_DATABASE, MYSQL_DATABASE_ACCESS_LEVEL, MYSQL_ENABLE_DATABASE_ISOLATION};
    use pretty_assertions::assert_eq;

    fn policy(level: &str) -> PolicyConfig {
        PolicyConfig::from_map([
            (MYSQL_ENABLE_DATABASE_ISOLATION, "true"),
            (MYSQL_DATABASE, "appdb"),
            (MYSQL_DATABASE_ACCESS_LEVEL, level),
        ])
        .unwrap()
    }

    fn check(sql: &str, level: &str) -> (bool, Vec<String>) {
        ScopeGuard::new().check(sql, &policy(level))
    }

    #[test]
    fn test_disabled_isolation_allows_everything() {
        let policy = PolicyConfig::from_map([(MYSQL_DATABASE, "appdb")]).unwrap();
        let (allowed, violations) =
            ScopeGuard::new().check("SELECT * FROM otherdb.secrets", &policy);
        assert!(allowed);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_restricted_primary_and_foreign_database() {
        let (allowed, violations) = check("SELECT * FROM appdb.t", "restricted");
        assert!(allowed, "{violations:?}");

        let (allowed, violations) = check("SELECT * FROM otherdb.t", "restricted");
        assert!(!allowed);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("otherdb"));
    }

    #[test]
    fn test_primary_comparison_ignores_case_and_backticks() {
        let (allowed, _) = check("SELECT * FROM `AppDB`.`users`", "strict");
        assert!(allowed);
    }

    #[test]
    fn test_system_schemas_depend_on_access_level() {
        let sql = "SELECT table_name FROM information_schema.tables";
        assert!(check(sql, "restricted").0);

        let (allowed, violations) = check(sql, "strict");
        assert!(!allowed);
        assert!(violations[0].contains("system database 'information_schema'"));

        assert!(!check("SELECT user FROM mysql.user", "permissive").0);
    }

    #[test]
    fn test_show_databases_only_denied_under_strict() {
        let (allowed, violations) = check("SHOW DATABASES", "strict");
        assert!(!allowed);
        assert_eq!(
            violations,
            vec!["SHOW DATABASES is not allowed at access level strict"]
        );
        assert!(check("SHOW DATABASES", "restricted").0);
    }

    #[test]
    fn test_show_tables_from_other_database() {
        let (allowed, violations) = check("SHOW FULL TABLES FROM otherdb", "restricted");
        assert!(!allowed);
        assert!(violations[0].contains("otherdb"));

        assert!(check("SHOW TABLES IN appdb", "strict").0);
        assert!(!check("SHOW COLUMNS FROM users FROM otherdb", "restricted").0);
    }

    #[test]
    fn test_use_statement() {
        assert!(check("USE appdb", "strict").0);
        let (allowed, violations) = check("USE otherdb", "permissive");
        assert!(!allowed);
        assert_eq!(
            violations,
            vec!["USE otherdb switches to a database outside the authorized scope"]
        );
    }

    #[test]
    fn test_database_ddl_rules() {
        assert!(!check("CREATE DATABASE scratch", "restricted").0);
        assert!(check("CREATE DATABASE IF NOT EXISTS scratch", "permissive").0);

        let (allowed, violations) = check("DROP DATABASE appdb", "permissive");
        assert!(!allowed);
        assert_eq!(
            violations,
            vec!["dropping the primary database 'appdb' is never allowed"]
        );
        assert!(!check("DROP SCHEMA IF EXISTS scratch", "strict").0);
        assert!(check("DROP DATABASE scratch", "permissive").0);

        assert!(check("ALTER DATABASE appdb CHARACTER SET utf8mb4", "strict").0);
        assert!(check("ALTER DATABASE CHARACTER SET utf8mb4", "strict").0);
        assert!(!check("ALTER DATABASE otherdb CHARACTER SET utf8mb4", "restricted").0);
    }

    #[test]
    fn test_permissive_allows_cross_database_ddl_but_not_reads() {
        assert!(check("CREATE TABLE otherdb.t (id INT)", "permissive").0);
        assert!(!check("CREATE TABLE otherdb.t (id INT)", "restricted").0);
        assert!(!check("SELECT * FROM otherdb.t", "permissive").0);
    }

    #[test]
    fn test_aliases_and_columns_are_not_databases() {
        assert!(check("SELECT u.id, o.total FROM users u JOIN orders AS o ON u.id = o.uid", "strict").0);
        assert!(check("SELECT users.id FROM users WHERE users.active = 1", "strict").0);
        assert!(check("SELECT d.id FROM (SELECT id FROM t) AS d", "strict").0);
        assert!(check("WITH recent AS (SELECT 1 AS id) SELECT recent.id FROM recent", "strict").0);
    }

    #[test]
    fn test_alias_cannot_shadow_database_in_table_list() {
        let (allowed, violations) =
            check("SELECT * FROM users otherdb, otherdb.secrets", "restricted");
        assert!(!allowed);
        assert!(violations[0].contains("otherdb"));

        assert!(!check("SELECT * FROM otherdb.secrets otherdb", "restricted").0);
    }

    #[test]
    fn test_three_part_names_always_name_a_database() {
        let (allowed, violations) =
            check("SELECT otherdb.t.c FROM t otherdb", "restricted");
        assert!(!allowed);
        assert!(violations[0].contains("otherdb"));
    }

    #[test]
    fn test_literals_comments_and_variables_are_masked() {
        assert!(check("SELECT * FROM t WHERE note = 'see otherdb.t'", "strict").0);
        assert!(check("SELECT * FROM t -- otherdb.t\n", "strict").0);
        assert!(check("SELECT * FROM t /* otherdb.t */", "strict").0);
        assert!(check("SELECT @@session.sql_mode, @x.y", "strict").0);
    }

    #[test]
    fn test_comment_boundaries_follow_server_rules() {
        assert!(!check("SELECT 1 --1; SELECT * FROM otherdb.t", "restricted").0);
        assert!(!check("SELECT 1 /* /* */ FROM otherdb.t", "restricted").0);
        assert!(check("SELECT 1 # FROM otherdb.t", "restricted").0);
        assert!(check("SELECT `it's` FROM appdb.t WHERE c = 'otherdb.t'", "restricted").0);
    }

    #[test]
    fn test_versioned_comment_body_is_checked() {
        assert!(!check("SELECT 1 /*!50000 FROM otherdb.t */", "restricted").0);
    }

    #[test]
    fn test_violations_are_deduplicated() {
        let (_, violations) =
            check("SELECT * FROM otherdb.a JOIN otherdb.b ON otherdb.a.id = otherdb.b.id", "restricted");
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_allowed_databases() {
        let guard = ScopeGuard::new();
        assert_eq!(guard.allowed_databases(&policy("strict")), vec!["appdb"]);
        assert_eq!(guard.allowed_databases(&policy("restricted")).len(), 5);
    }

    #[test]
    fn test_access_report() {
        let report = ScopeGuard::new()
            .access_report("SELECT * FROM appdb.a JOIN otherdb.b ON 1 = 1", &policy("restricted"));
        assert!(report.is_cross_database);
        assert_eq!(
            report.referenced_databases,
            BTreeSet::from(["appdb".to_string(), "otherdb".to_string()])
        );
        assert_eq!(report.violations.len(), 1);
    }
}
