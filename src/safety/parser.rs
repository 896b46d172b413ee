//! SQL statement parsing.
//!
//! Uses the sqlparser-rs tokenizer with the MySQL dialect rather than the full
//! grammar: the gate needs the verb, the tables and a couple of clause flags,
//! and must still produce an answer for SQL the grammar would reject. When the
//! tokenizer itself fails, a whitespace heuristic takes over.

use std::collections::BTreeSet;

use sqlparser::dialect::MySqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, TokenizerError, Whitespace};
use tracing::debug;

use super::lexer::strip_comments;
use super::{Category, ParsedStatement, RiskClassifier};

/// Keywords after which a table name follows.
const TABLE_MARKERS: &[&str] = &["FROM", "JOIN", "UPDATE", "INTO", "TABLE"];

/// Unquoted words that can follow a table marker without naming a table.
const NOT_TABLES: &[&str] = &[
    "SELECT", "WHERE", "SET", "DUAL", "OUTFILE", "DUMPFILE", "LATERAL", "VALUES",
];

/// Words that open a nested query when they follow `(`.
const SUBQUERY_STARTS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE"];

/// Metadata verbs that never reference user tables.
const TABLELESS_SHOW: &[&str] = &[
    "SHOW PROCESSLIST",
    "SHOW FULL PROCESSLIST",
    "SHOW VARIABLES",
    "SHOW STATUS",
    "SHOW DATABASES",
];

/// Parser that turns raw SQL into a [`ParsedStatement`].
#[derive(Debug)]
pub struct StatementParser {
    dialect: MySqlDialect,
}

impl Default for StatementParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementParser {
    /// Creates a new statement parser.
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    /// Parses a SQL string. Never fails: malformed input goes through the
    /// fallback heuristic and empty input yields [`ParsedStatement::empty`].
    pub fn parse(&self, sql: &str) -> ParsedStatement {
        let text = strip_comments(sql);
        if text.trim().is_empty() {
            return ParsedStatement::empty(sql);
        }

        let tokens = match self.tokenize(&text) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, "tokenizer rejected SQL, using fallback parse");
                return fallback_parse(&text, sql);
            }
        };

        let mut statements: Vec<ParsedStatement> = split_statements(tokens)
            .iter()
            .map(|tokens| analyze_statement(tokens, None))
            .collect();

        match statements.len() {
            0 => ParsedStatement::empty(sql),
            1 => {
                let mut stmt = statements.remove(0);
                stmt.original = sql.to_string();
                stmt
            }
            _ => aggregate(statements, sql, false),
        }
    }

    /// Formatting pass: strips comments, collapses whitespace, uppercases
    /// keywords and rejoins statements with `; `.
    pub fn format(&self, sql: &str) -> String {
        let text = strip_comments(sql);
        match self.tokenize(&text) {
            Ok(tokens) => split_statements(tokens)
                .iter()
                .map(|tokens| render(tokens))
                .collect::<Vec<_>>()
                .join("; "),
            Err(_) => text.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }

    /// Tokenizes comment-free text from [`strip_comments`]. Comments are
    /// removed beforehand because sqlparser's rules for `--`, `#` and nested
    /// `/* */` differ from the server's.
    fn tokenize(&self, text: &str) -> std::result::Result<Vec<Token>, TokenizerError> {
        let raw = Tokenizer::new(&self.dialect, text)
            .with_unescape(false)
            .tokenize()?;

        Ok(raw
            .into_iter()
            .filter(|token| *token != Token::EOF)
            .map(|token| match token {
                Token::Whitespace(_) => Token::Whitespace(Whitespace::Space),
                other => other,
            })
            .collect())
    }
}

/// Convenience function to format SQL without creating a parser instance.
pub fn format_sql(sql: &str) -> String {
    StatementParser::new().format(sql)
}

/// Splits on every `;` token and drops statements that are only whitespace.
fn split_statements(tokens: Vec<Token>) -> Vec<Vec<Token>> {
    let mut statements = Vec::new();
    let mut current = Vec::new();

    for token in tokens {
        if token == Token::SemiColon {
            statements.push(std::mem::take(&mut current));
        } else {
            current.push(token);
        }
    }
    statements.push(current);

    statements
        .into_iter()
        .filter(|stmt| stmt.iter().any(|t| !matches!(t, Token::Whitespace(_))))
        .collect()
}

/// Renders tokens back to text with single spaces and uppercased keywords.
fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut pending_space = false;

    for token in tokens {
        if matches!(token, Token::Whitespace(_)) {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;

        match token {
            Token::Word(w) if w.quote_style.is_none() && w.keyword != Keyword::NoKeyword => {
                out.push_str(&w.value.to_uppercase());
            }
            other => out.push_str(&other.to_string()),
        }
    }
    out
}

/// Uppercase value of an unquoted word token.
fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
        _ => None,
    }
}

fn keyword_at(tokens: &[Token], index: usize) -> Option<String> {
    tokens.get(index).and_then(keyword)
}

/// Analyzes a single statement. `tokens` may contain whitespace.
fn analyze_statement(tokens: &[Token], normalized: Option<String>) -> ParsedStatement {
    let normalized = normalized.unwrap_or_else(|| render(tokens));
    let significant: Vec<Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .cloned()
        .collect();
    let leading_parens = significant
        .iter()
        .take_while(|t| **t == Token::LParen)
        .count();
    let body = &significant[leading_parens..];

    let operation = operation_of(body);

    // EXPLAIN ANALYZE runs the statement it explains.
    if operation == "EXPLAIN" && keyword_at(body, 1).as_deref() == Some("ANALYZE") {
        let inner = analyze_statement(&body[2..], Some(normalized.clone()));
        if inner.category == Category::Dml && inner.operation != "SELECT" {
            return inner;
        }
    }

    let category = Category::for_operation(&operation);
    let tables = if TABLELESS_SHOW.contains(&operation.as_str())
        || operation.starts_with("SHOW ENGINE")
    {
        BTreeSet::new()
    } else {
        extract_tables(body, &operation)
    };

    let (has_where, has_limit) = if category == Category::Metadata {
        (false, false)
    } else {
        let top = top_level_keywords(body);
        (
            top.iter().any(|w| w == "WHERE"),
            top.iter().any(|w| w == "LIMIT"),
        )
    };

    ParsedStatement {
        is_valid: !operation.is_empty(),
        operation,
        category,
        tables,
        has_where,
        has_limit,
        is_multi_statement: false,
        statement_count: 1,
        original: normalized.clone(),
        normalized,
        used_fallback: false,
        sub_statements: Vec::new(),
    }
}

/// Determines the statement verb, including compound `SHOW` verbs and the
/// main verb behind a `WITH` clause.
fn operation_of(body: &[Token]) -> String {
    let Some(first) = body.first().and_then(keyword) else {
        return String::new();
    };

    match first.as_str() {
        "SHOW" => show_operation(&body[1..]),
        "WITH" => top_level_keywords(body)
            .into_iter()
            .skip(1)
            .find(|w| matches!(w.as_str(), "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "REPLACE"))
            .unwrap_or(first),
        _ => first,
    }
}

fn show_operation(rest: &[Token]) -> String {
    let words: Vec<String> = rest.iter().take(4).map_while(keyword).collect();
    let skip = usize::from(matches!(
        words.first().map(String::as_str),
        Some("GLOBAL" | "SESSION")
    ));
    let word = |n: usize| words.get(skip + n).map(String::as_str);

    match (word(0), word(1), word(2)) {
        (Some("FULL"), Some(next), _) => format!("SHOW FULL {next}"),
        (Some("ENGINE"), Some(engine), Some("STATUS")) => format!("SHOW ENGINE {engine} STATUS"),
        (Some(next), _, _) => format!("SHOW {next}"),
        _ => "SHOW".to_string(),
    }
}

/// Unquoted words outside any parentheses.
fn top_level_keywords(body: &[Token]) -> Vec<String> {
    let mut depth = 0usize;
    let mut words = Vec::new();
    for token in body {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            _ if depth == 0 => {
                if let Some(word) = keyword(token) {
                    words.push(word);
                }
            }
            _ => {}
        }
    }
    words
}

/// Collects table names following table markers. Markers inside a
/// parenthesised expression that is not a sub-query (e.g. `EXTRACT(YEAR FROM d)`)
/// are ignored.
fn extract_tables(body: &[Token], operation: &str) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();

    // Verbs whose object follows directly, without a marker keyword.
    if matches!(operation, "DESC" | "DESCRIBE" | "TRUNCATE")
        && keyword_at(body, 1).as_deref() != Some("TABLE")
    {
        if let Some((name, _)) = qualified_name(body, 1, false) {
            tables.insert(name);
        }
    }

    // One entry per open paren: true when it opens a sub-query.
    let mut parens: Vec<bool> = Vec::new();
    let mut i = 0;
    while i < body.len() {
        match &body[i] {
            Token::LParen => {
                let opens_query = matches!(body.get(i + 1), Some(Token::LParen))
                    || keyword_at(body, i + 1)
                        .is_some_and(|w| SUBQUERY_STARTS.contains(&w.as_str()));
                parens.push(opens_query);
            }
            Token::RParen => {
                parens.pop();
            }
            token => {
                let in_expression = parens.last().is_some_and(|opens_query| !opens_query);
                if let Some(marker) = keyword(token) {
                    if !in_expression && TABLE_MARKERS.contains(&marker.as_str()) {
                        collect_after_marker(body, i, &marker, &mut tables);
                    }
                }
            }
        }
        i += 1;
    }

    tables
}

fn collect_after_marker(body: &[Token], at: usize, marker: &str, tables: &mut BTreeSet<String>) {
    // ON DUPLICATE KEY UPDATE col = ...
    if marker == "UPDATE" && at > 0 && keyword_at(body, at - 1).as_deref() == Some("KEY") {
        return;
    }

    let mut j = at + 1;
    if keyword_at(body, j).as_deref() == Some("IF") {
        j += 1;
        if keyword_at(body, j).as_deref() == Some("NOT") {
            j += 1;
        }
        if keyword_at(body, j).as_deref() == Some("EXISTS") {
            j += 1;
        }
    }

    // A paren right after a FROM/JOIN name is a table function call; after
    // INTO or TABLE it is a column list.
    let is_source = matches!(marker, "FROM" | "JOIN");
    while let Some((name, next)) = qualified_name(body, j, is_source) {
        tables.insert(name);
        if marker != "FROM" {
            break;
        }

        // FROM a [AS] x, b y
        let mut k = next;
        if keyword_at(body, k).as_deref() == Some("AS") {
            k += 1;
        }
        if let Some(Token::Word(alias)) = body.get(k) {
            if alias.quote_style.is_some() || alias.keyword == Keyword::NoKeyword {
                k += 1;
            }
        }
        if body.get(k) == Some(&Token::Comma) {
            j = k + 1;
        } else {
            break;
        }
    }
}

/// Reads `name` or `db.name` starting at `index`. Returns the lowercased
/// name and the index after it, or `None` when the tokens there do not name
/// a table (variables, sub-queries, keywords like `DUAL`, and function calls
/// when `reject_call` is set).
fn qualified_name(body: &[Token], index: usize, reject_call: bool) -> Option<(String, usize)> {
    let Some(Token::Word(first)) = body.get(index) else {
        return None;
    };
    if first.quote_style.is_none()
        && (NOT_TABLES.contains(&first.value.to_uppercase().as_str())
            || first.value.starts_with('@'))
    {
        return None;
    }

    let mut parts = vec![first.value.clone()];
    let mut k = index + 1;
    while body.get(k) == Some(&Token::Period) {
        match body.get(k + 1) {
            Some(Token::Word(w)) => {
                parts.push(w.value.clone());
                k += 2;
            }
            _ => break,
        }
    }

    if reject_call && body.get(k) == Some(&Token::LParen) {
        return None;
    }
    Some((parts.join(".").to_lowercase(), k))
}

/// Combines sub-statements into one aggregate. The first sub-statement with
/// the highest risk supplies the verb and category.
fn aggregate(statements: Vec<ParsedStatement>, original: &str, used_fallback: bool) -> ParsedStatement {
    let classifier = RiskClassifier::new();
    let mut representative = 0;
    let mut highest = None;
    for (i, stmt) in statements.iter().enumerate() {
        let level = classifier.classify(stmt);
        if highest.map_or(true, |h| level > h) {
            highest = Some(level);
            representative = i;
        }
    }

    let rep = &statements[representative];
    ParsedStatement {
        operation: rep.operation.clone(),
        category: rep.category,
        tables: statements
            .iter()
            .flat_map(|s| s.tables.iter().cloned())
            .collect(),
        has_where: statements.iter().any(|s| s.has_where),
        has_limit: statements.iter().any(|s| s.has_limit),
        is_multi_statement: true,
        statement_count: statements.len(),
        normalized: statements
            .iter()
            .map(|s| s.normalized.as_str())
            .collect::<Vec<_>>()
            .join("; "),
        original: original.to_string(),
        is_valid: statements.iter().all(|s| s.is_valid),
        used_fallback,
        sub_statements: statements,
    }
}

/// Whitespace-splitting heuristic for comment-free `text` the tokenizer
/// rejects (unterminated quotes and the like). Still splits on `;` so a
/// trailing destructive statement cannot hide behind a broken literal.
fn fallback_parse(text: &str, sql: &str) -> ParsedStatement {
    let mut statements: Vec<ParsedStatement> = text
        .split(';')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(fallback_statement)
        .collect();

    match statements.len() {
        0 => ParsedStatement::empty(sql),
        1 => {
            let mut stmt = statements.remove(0);
            stmt.original = sql.to_string();
            stmt
        }
        _ => aggregate(statements, sql, true),
    }
}

fn fallback_statement(text: &str) -> ParsedStatement {
    let words: Vec<&str> = text.split_whitespace().collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();

    let mut operation = upper
        .first()
        .map(|w| w.trim_start_matches('(').to_string())
        .unwrap_or_default();
    if operation == "SHOW" {
        if let Some(next) = upper.get(1) {
            operation = format!("SHOW {next}");
        }
    }
    let category = Category::for_operation(&operation);

    let mut tables = BTreeSet::new();
    for (i, word) in upper.iter().enumerate() {
        if !TABLE_MARKERS.contains(&word.as_str()) {
            continue;
        }
        let Some(next) = words.get(i + 1) else {
            continue;
        };
        if next.starts_with('(') || next.starts_with('\'') {
            continue;
        }
        let name = next
            .replace('`', "")
            .trim_end_matches([';', ',', ')'])
            .to_lowercase();
        if !name.is_empty() && !NOT_TABLES.contains(&name.to_uppercase().as_str()) {
            tables.insert(name);
        }
    }

    let (has_where, has_limit) = if category == Category::Metadata {
        (false, false)
    } else {
        (
            upper.iter().any(|w| w == "WHERE"),
            upper.iter().any(|w| w == "LIMIT"),
        )
    };

    let normalized = words.join(" ");
    ParsedStatement {
        is_valid: !operation.is_empty(),
        operation,
        category,
        tables,
        has_where,
        has_limit,
        is_multi_statement: false,
        statement_count: 1,
        original: normalized.clone(),
        normalized,
        used_fallback: true,
        sub_statements: Vec::new(),
    }
}
