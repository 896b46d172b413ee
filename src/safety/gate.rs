//! The allow/deny gate.
//!
//! Runs every check against a statement and collects all failures into one
//! [`Decision`]. Only empty and oversize input short-circuit, since nothing
//! downstream can say anything useful about them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::{EnvType, PolicyConfig, PolicySummary};
use crate::error::{GatewayError, Result};

use super::{
    AccessReport, Category, ParsedStatement, RiskClassifier, RiskLevel, ScopeGuard,
    StatementParser,
};

/// The check that produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Empty,
    Length,
    Pattern,
    Invalid,
    Unsupported,
    Scope,
    Risk,
    HardBlock,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Length => "length",
            Self::Pattern => "pattern",
            Self::Invalid => "invalid",
            Self::Unsupported => "unsupported",
            Self::Scope => "scope",
            Self::Risk => "risk",
            Self::HardBlock => "hard_block",
        }
    }
}

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: Rule,
    pub message: String,
}

impl Violation {
    fn new(rule: Rule, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

/// Rough size of the row set a statement touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectedRows {
    Bounded(u64),
    Unbounded,
}

impl AffectedRows {
    fn times(self, count: usize) -> Self {
        match self {
            Self::Bounded(n) => Self::Bounded(n.saturating_mul(count as u64)),
            Self::Unbounded => Self::Unbounded,
        }
    }
}

/// What a statement would touch if it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatedImpact {
    pub operation: String,
    pub needs_where: bool,
    pub has_where: bool,
    pub needs_limit: bool,
    pub has_limit: bool,
    pub is_multi_statement: bool,
    pub is_dangerous: bool,
    pub estimated_rows: AffectedRows,
}

/// Result of one gate check. Built once and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// `None` when the input was rejected before it could be classified.
    pub risk_level: Option<RiskLevel>,
    pub violations: Vec<Violation>,
    pub statement: Option<ParsedStatement>,
    pub scope_violations: Vec<String>,
    pub impact: Option<EstimatedImpact>,
    pub warning: Option<String>,
}

impl Decision {
    fn rejected(violation: Violation) -> Self {
        Self {
            allowed: false,
            risk_level: None,
            violations: vec![violation],
            statement: None,
            scope_violations: Vec::new(),
            impact: None,
            warning: None,
        }
    }

    /// Violation messages, for display.
    pub fn reasons(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.message.as_str()).collect()
    }

    pub fn has_rule(&self, rule: Rule) -> bool {
        self.violations.iter().any(|v| v.rule == rule)
    }

    /// Converts a denial into the matching error. A hard block outranks
    /// validation, which outranks scope, which outranks policy.
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            return Ok(self);
        }

        if let Some(v) = self.violations.iter().find(|v| v.rule == Rule::HardBlock) {
            let operation = self
                .statement
                .as_ref()
                .and_then(|s| s.hard_blocked_operation())
                .map(str::to_string)
                .unwrap_or_else(|| v.message.clone());
            return Err(GatewayError::hard_block(operation));
        }

        let messages_for = |rules: &[Rule]| -> Vec<String> {
            self.violations
                .iter()
                .filter(|v| rules.contains(&v.rule))
                .map(|v| format!("[{}] {}", v.rule.as_str(), v.message))
                .collect()
        };

        let validation = messages_for(&[Rule::Empty, Rule::Length, Rule::Invalid, Rule::Unsupported]);
        if !validation.is_empty() {
            return Err(GatewayError::validation(validation.join("; ")));
        }
        if !self.scope_violations.is_empty() {
            return Err(GatewayError::scope(self.scope_violations));
        }
        let policy = messages_for(&[Rule::Pattern, Rule::Risk]);
        Err(GatewayError::policy(if policy.is_empty() {
            "statement denied".to_string()
        } else {
            policy.join("; ")
        }))
    }
}

/// Everything the gate knows about one statement, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    pub decision: Decision,
    pub policy: PolicySummary,
    pub access: AccessReport,
}

/// Composes parsing, scope and risk checks into one decision.
#[derive(Debug, Default)]
pub struct Gate {
    parser: StatementParser,
    classifier: RiskClassifier,
    scope: ScopeGuard,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parser(&self) -> &StatementParser {
        &self.parser
    }

    /// Evaluates `sql` against `policy`. Pure: no I/O, no policy mutation.
    pub fn check_operation(&self, sql: &str, policy: &PolicyConfig) -> Decision {
        if sql.trim().is_empty() {
            let decision = Decision::rejected(Violation::new(Rule::Empty, "SQL query must not be empty"));
            log_decision(&decision, sql);
            return decision;
        }

        let length = sql.chars().count();
        if length > policy.max_sql_length {
            let decision = Decision::rejected(Violation::new(
                Rule::Length,
                format!(
                    "SQL length {length} exceeds the maximum of {} characters",
                    policy.max_sql_length
                ),
            ));
            log_decision(&decision, sql);
            return decision;
        }

        let mut violations = Vec::new();
        let stmt = self.parser.parse(sql);

        if policy.enable_query_check {
            for pattern in blocked_patterns_in(sql, &stmt.normalized, &policy.blocked_patterns) {
                violations.push(Violation::new(
                    Rule::Pattern,
                    format!("blocked pattern '{pattern}' found"),
                ));
            }
        }

        if !stmt.is_valid {
            violations.push(Violation::new(
                Rule::Invalid,
                "statement could not be parsed into a recognizable operation",
            ));
        } else if !stmt.is_supported() {
            let unsupported: Vec<&str> = stmt
                .operations()
                .into_iter()
                .filter(|op| {
                    let single = Category::for_operation(op);
                    !(op.starts_with("SHOW ")
                        || matches!(single, Category::Ddl | Category::Dml | Category::Metadata))
                })
                .collect();
            violations.push(Violation::new(
                Rule::Unsupported,
                format!("operation {} is not supported", unsupported.join(", ")),
            ));
        }

        let (_, scope_violations) = self.scope.check(sql, policy);
        violations.extend(
            scope_violations
                .iter()
                .map(|message| Violation::new(Rule::Scope, message.clone())),
        );

        let risk = self.classifier.classify(&stmt);
        if policy.enable_query_check {
            if let Err(reason) = self.classifier.is_allowed(risk, &policy.allowed_risk_levels) {
                violations.push(Violation::new(Rule::Risk, reason));
            }
        }

        if let Some(operation) = stmt.hard_blocked_operation() {
            violations.push(Violation::new(
                Rule::HardBlock,
                format!("operation {operation} is blocked unconditionally"),
            ));
        }

        let impact = stmt
            .is_valid
            .then(|| estimate_impact(&stmt, risk, policy.env_type));
        let warning = risk.is_dangerous().then(|| {
            format!(
                "{} is classified as {risk} and may modify or destroy data",
                stmt.operation
            )
        });

        let decision = Decision {
            allowed: violations.is_empty(),
            risk_level: Some(risk),
            violations,
            statement: Some(stmt),
            scope_violations,
            impact,
            warning,
        };
        log_decision(&decision, sql);
        decision
    }

    /// Like [`check_operation`](Self::check_operation), but a denial becomes an error.
    pub fn enforce_operation(&self, sql: &str, policy: &PolicyConfig) -> Result<Decision> {
        self.check_operation(sql, policy).into_result()
    }

    /// Decision plus policy summary and scope breakdown.
    pub fn security_report(&self, sql: &str, policy: &PolicyConfig) -> SecurityReport {
        SecurityReport {
            decision: self.check_operation(sql, policy),
            policy: policy.summary(),
            access: self.scope.access_report(sql, policy),
        }
    }
}

/// Patterns that occur as whole words in the raw or normalized text. Runs of
/// whitespace inside a pattern match any whitespace.
fn blocked_patterns_in<'a>(raw: &str, normalized: &str, patterns: &'a [String]) -> Vec<&'a str> {
    let raw = raw.to_uppercase();
    let normalized = normalized.to_uppercase();

    patterns
        .iter()
        .filter(|pattern| {
            let body = pattern
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+");
            match Regex::new(&format!(r"\b{body}\b")) {
                Ok(re) => re.is_match(&raw) || re.is_match(&normalized),
                Err(_) => raw.contains(pattern.as_str()) || normalized.contains(pattern.as_str()),
            }
        })
        .map(String::as_str)
        .collect()
}

fn estimate_impact(stmt: &ParsedStatement, risk: RiskLevel, env: EnvType) -> EstimatedImpact {
    let production = env == EnvType::Production;
    let unbounded_or = |n: u64| {
        if production {
            AffectedRows::Unbounded
        } else {
            AffectedRows::Bounded(n)
        }
    };

    let op = stmt.operation.as_str();
    let per_statement = match (stmt.category, op) {
        (Category::Ddl, _) => unbounded_or(1000),
        (_, "UPDATE" | "DELETE") if !stmt.has_where => unbounded_or(10_000),
        (_, "UPDATE" | "DELETE") => AffectedRows::Bounded(if production { 1000 } else { 100 }),
        (_, "INSERT") => AffectedRows::Bounded(1),
        (_, "SELECT") if !stmt.has_limit => unbounded_or(1000),
        (_, "SELECT") => AffectedRows::Bounded(100),
        _ => AffectedRows::Bounded(0),
    };

    EstimatedImpact {
        operation: stmt.operation.clone(),
        needs_where: matches!(op, "UPDATE" | "DELETE"),
        has_where: stmt.has_where,
        needs_limit: op == "SELECT",
        has_limit: stmt.has_limit,
        is_multi_statement: stmt.is_multi_statement,
        is_dangerous: risk.is_dangerous(),
        estimated_rows: per_statement.times(stmt.statement_count.max(1)),
    }
}

fn log_decision(decision: &Decision, sql: &str) {
    let preview: String = sql.chars().take(100).collect();
    let reasons = decision.reasons().join("; ");
    if decision.has_rule(Rule::HardBlock) {
        error!(sql = %preview, %reasons, "hard-blocked statement");
    } else if !decision.allowed {
        warn!(sql = %preview, %reasons, "statement denied");
    } else {
        debug!(
            sql = %preview,
            risk = ?decision.risk_level,
            "statement allowed"
        );
    }
}
