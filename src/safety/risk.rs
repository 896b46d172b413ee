//! Risk classification of parsed statements.

use std::collections::BTreeSet;

use super::{Category, ParsedStatement, RiskLevel};

/// Pure rule table mapping a [`ParsedStatement`] to a [`RiskLevel`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RiskClassifier;

impl RiskClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classifies a statement. Aggregates take the highest sub-statement level.
    pub fn classify(&self, stmt: &ParsedStatement) -> RiskLevel {
        if stmt.is_multi_statement && !stmt.sub_statements.is_empty() {
            return stmt
                .sub_statements
                .iter()
                .map(|sub| self.classify(sub))
                .max()
                .unwrap_or(RiskLevel::Medium);
        }

        match stmt.category {
            Category::Metadata => RiskLevel::Low,
            Category::Ddl => match stmt.operation.as_str() {
                "DROP" | "TRUNCATE" => RiskLevel::Critical,
                "ALTER" | "RENAME" => RiskLevel::High,
                _ => RiskLevel::Medium,
            },
            Category::Dml => match stmt.operation.as_str() {
                "DELETE" | "UPDATE" if !stmt.has_where => RiskLevel::High,
                "DELETE" | "UPDATE" => RiskLevel::Medium,
                "SELECT" if stmt.has_limit => RiskLevel::Low,
                _ => RiskLevel::Medium,
            },
            Category::Procedure | Category::Unknown => RiskLevel::Medium,
        }
    }

    /// Checks a level against the allowed set. The error carries the reason.
    pub fn is_allowed(
        &self,
        level: RiskLevel,
        allowed: &BTreeSet<RiskLevel>,
    ) -> std::result::Result<(), String> {
        if allowed.contains(&level) {
            return Ok(());
        }
        let names: Vec<&str> = allowed.iter().map(RiskLevel::as_str).collect();
        Err(format!(
            "risk level {level} is not allowed (allowed: {})",
            names.join(", ")
        ))
    }
}
