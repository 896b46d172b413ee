//! Statement safety evaluation.
//!
//! Parses SQL text, classifies its risk, checks which databases it touches,
//! and combines the three into a single allow/deny [`Decision`].

mod gate;
mod lexer;
mod parser;
mod risk;
mod scope;

pub use gate::{AffectedRows, Decision, EstimatedImpact, Gate, Rule, SecurityReport, Violation};
pub use lexer::{has_statement_separator, mask_literals, strip_comments};
pub use parser::{format_sql, StatementParser};
pub use risk::RiskClassifier;
pub use scope::{AccessReport, ScopeGuard, SYSTEM_DATABASES};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Verbs that change schema objects.
pub const DDL_OPERATIONS: &[&str] = &["CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME"];

/// Verbs that read or write rows.
pub const DML_OPERATIONS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE", "MERGE"];

/// Verbs that inspect the server or session without touching row data.
pub const METADATA_OPERATIONS: &[&str] = &[
    "SHOW", "DESC", "DESCRIBE", "EXPLAIN", "HELP", "ANALYZE", "CHECK", "CHECKSUM", "OPTIMIZE",
    "SET", "USE", "BEGIN", "COMMIT", "ROLLBACK", "START", "KILL",
];

/// Stored-routine invocation verbs.
pub const PROCEDURE_OPERATIONS: &[&str] = &["CALL", "EXECUTE", "EXEC"];

/// Verbs refused at execution time no matter what the risk policy allows.
pub const HARD_BLOCKED_OPERATIONS: &[&str] = &[
    "DROP", "TRUNCATE", "ALTER", "RENAME", "LOCK", "DELETE", "UPDATE",
];

/// Ordered risk classification. Higher is more dangerous.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl RiskLevel {
    /// All levels in ascending order.
    pub const ALL: [RiskLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parses a level name, ignoring case and surrounding whitespace.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Returns true for levels that warrant a warning in diagnostics.
    pub fn is_dangerous(&self) -> bool {
        *self >= Self::High
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation category derived from the statement verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Ddl,
    Dml,
    Metadata,
    Procedure,
    Unknown,
}

impl Category {
    /// Maps an operation verb (possibly compound, like `SHOW TABLES`) to its category.
    pub fn for_operation(operation: &str) -> Self {
        let verb = operation.split_whitespace().next().unwrap_or("");
        if DDL_OPERATIONS.contains(&verb) {
            Self::Ddl
        } else if DML_OPERATIONS.contains(&verb) {
            Self::Dml
        } else if METADATA_OPERATIONS.contains(&verb) {
            Self::Metadata
        } else if PROCEDURE_OPERATIONS.contains(&verb) {
            Self::Procedure
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ddl => "DDL",
            Self::Dml => "DML",
            Self::Metadata => "METADATA",
            Self::Procedure => "PROCEDURE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured description of one SQL string.
///
/// For multi-statement input this is the aggregate: the riskiest
/// sub-statement supplies `operation` and `category`, tables are unioned and
/// the WHERE/LIMIT flags are OR-ed. The individual statements are kept in
/// `sub_statements`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedStatement {
    /// Uppercase verb, e.g. `SELECT` or `SHOW TABLES`.
    pub operation: String,
    pub category: Category,
    /// Referenced tables, lowercased, with any `db.` qualifier kept.
    pub tables: BTreeSet<String>,
    pub has_where: bool,
    pub has_limit: bool,
    pub is_multi_statement: bool,
    pub statement_count: usize,
    /// Comment-free text with collapsed whitespace and uppercased keywords.
    pub normalized: String,
    pub original: String,
    pub is_valid: bool,
    /// Set when the tokenizer rejected the input and the whitespace heuristic was used.
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sub_statements: Vec<ParsedStatement>,
}

impl ParsedStatement {
    /// The result for empty or comment-only input.
    pub fn empty(original: &str) -> Self {
        Self {
            operation: "UNKNOWN".to_string(),
            category: Category::Unknown,
            tables: BTreeSet::new(),
            has_where: false,
            has_limit: false,
            is_multi_statement: false,
            statement_count: 0,
            normalized: String::new(),
            original: original.to_string(),
            is_valid: false,
            used_fallback: false,
            sub_statements: Vec::new(),
        }
    }

    /// True when every verb in the statement belongs to a supported category.
    pub fn is_supported(&self) -> bool {
        if self.is_multi_statement {
            return self.sub_statements.iter().all(ParsedStatement::is_supported);
        }
        self.operation.starts_with("SHOW ")
            || matches!(
                self.category,
                Category::Ddl | Category::Dml | Category::Metadata
            )
    }

    /// Verbs of every statement, in order.
    pub fn operations(&self) -> Vec<&str> {
        if self.is_multi_statement {
            self.sub_statements
                .iter()
                .map(|s| s.operation.as_str())
                .collect()
        } else {
            vec![self.operation.as_str()]
        }
    }

    /// First verb that is refused unconditionally at execution time.
    pub fn hard_blocked_operation(&self) -> Option<&str> {
        self.operations().into_iter().find(|op| {
            let verb = op.split_whitespace().next().unwrap_or("");
            HARD_BLOCKED_OPERATIONS.contains(&verb)
        })
    }

    /// True when the statement produces a result set rather than an affected-row count.
    pub fn returns_rows(&self) -> bool {
        let verb = self.operation.split_whitespace().next().unwrap_or("");
        matches!(
            verb,
            "SELECT"
                | "SHOW"
                | "DESC"
                | "DESCRIBE"
                | "EXPLAIN"
                | "HELP"
                | "ANALYZE"
                | "CHECK"
                | "CHECKSUM"
                | "OPTIMIZE"
        )
    }

    /// Tables joined with `,` for error messages; `unknown` when none were found.
    pub fn table_list(&self) -> String {
        if self.tables.is_empty() {
            "unknown".to_string()
        } else {
            self.tables.iter().cloned().collect::<Vec<_>>().join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical as u8, 4);
        assert_eq!(
            [RiskLevel::Medium, RiskLevel::Critical, RiskLevel::Low]
                .into_iter()
                .max(),
            Some(RiskLevel::Critical)
        );
    }

    #[test]
    fn test_risk_level_parse() {
        assert_eq!(RiskLevel::parse(" low "), Some(RiskLevel::Low));
        assert_eq!(RiskLevel::parse("Critical"), Some(RiskLevel::Critical));
        assert_eq!(RiskLevel::parse("extreme"), None);
        assert_eq!(RiskLevel::High.to_string(), "HIGH");
    }

    #[test]
    fn test_category_for_operation() {
        assert_eq!(Category::for_operation("DROP"), Category::Ddl);
        assert_eq!(Category::for_operation("SELECT"), Category::Dml);
        assert_eq!(Category::for_operation("SHOW TABLES"), Category::Metadata);
        assert_eq!(
            Category::for_operation("SHOW ENGINE INNODB STATUS"),
            Category::Metadata
        );
        assert_eq!(Category::for_operation("CALL"), Category::Procedure);
        assert_eq!(Category::for_operation("GRANT"), Category::Unknown);
        assert_eq!(Category::for_operation(""), Category::Unknown);
    }

    #[test]
    fn test_empty_statement() {
        let stmt = ParsedStatement::empty("   ");
        assert!(!stmt.is_valid);
        assert_eq!(stmt.statement_count, 0);
        assert_eq!(stmt.category, Category::Unknown);
        assert!(!stmt.is_supported());
    }

    #[test]
    fn test_serialize_risk_level_uppercase() {
        let json = serde_json::to_string(&RiskLevel::Medium).unwrap();
        assert_eq!(json, "\"MEDIUM\"");
    }
}
