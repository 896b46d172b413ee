//! Secret scrubbing for SQL that ends up in log lines.

use std::sync::LazyLock;

use regex::Regex;

const MASK: &str = "***";

static IDENTIFIED_BY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(IDENTIFIED\s+(?:WITH\s+\S+\s+)?BY\s+)('[^']*'|"[^"]*")"#)
        .expect("valid IDENTIFIED BY regex")
});

static PASSWORD_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(PASSWORD\s*\(\s*)('[^']*'|"[^"]*")"#).expect("valid PASSWORD() regex")
});

static PASSWORD_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(PASSWORD\s*=\s*)('[^']*'|"[^"]*")"#).expect("valid PASSWORD = regex")
});

/// Replaces the configured password and any password literal in account
/// statements with `***`.
pub fn redact_sql(sql: &str, password: &str) -> String {
    let mut out = sql.to_string();
    for re in [&*IDENTIFIED_BY, &*PASSWORD_CALL, &*PASSWORD_ASSIGN] {
        out = re.replace_all(&out, format!("${{1}}'{MASK}'")).into_owned();
    }
    if !password.is_empty() {
        out = out.replace(password, MASK);
    }
    out
}

/// Cuts `text` to at most `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push_str("...");
    cut
}
