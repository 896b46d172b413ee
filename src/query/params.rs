//! Query parameters and placeholder binding.
//!
//! Statements reach the driver with `?` placeholders only. Named parameters
//! written as `%(name)s` or `:name` are rewritten to `?` in order of
//! appearance, and the values are laid out to match.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::db::Value;
use crate::error::{GatewayError, Result};

/// Values to bind into a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryParams {
    #[default]
    None,
    /// Bound to `?` placeholders left to right.
    Positional(Vec<Value>),
    /// Bound to `%(name)s` or `:name` placeholders. A name may appear more than once.
    Named(HashMap<String, Value>),
}

impl QueryParams {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(values) => values.is_empty(),
            Self::Named(values) => values.is_empty(),
        }
    }

    /// Returns the statement with `?` placeholders and the values in bind order.
    pub fn bind<'a>(&self, sql: &'a str) -> Result<(Cow<'a, str>, Vec<Value>)> {
        match self {
            Self::None => Ok((Cow::Borrowed(sql), Vec::new())),
            Self::Positional(values) => {
                let placeholders = scan(sql, |_, _| {}).1;
                if placeholders != values.len() {
                    return Err(GatewayError::validation(format!(
                        "statement has {placeholders} placeholders but {} parameters were given",
                        values.len()
                    )));
                }
                Ok((Cow::Borrowed(sql), values.clone()))
            }
            Self::Named(values) => {
                let mut bound = Vec::new();
                let mut missing = Vec::new();
                let (rewritten, _) = scan(sql, |name, out| {
                    match values.get(name) {
                        Some(value) => bound.push(value.clone()),
                        None => missing.push(name.to_string()),
                    }
                    out.push('?');
                });
                if !missing.is_empty() {
                    missing.dedup();
                    return Err(GatewayError::validation(format!(
                        "missing value for parameter {}",
                        missing.join(", ")
                    )));
                }
                Ok((Cow::Owned(rewritten), bound))
            }
        }
    }
}

impl From<Vec<Value>> for QueryParams {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl From<HashMap<String, Value>> for QueryParams {
    fn from(values: HashMap<String, Value>) -> Self {
        Self::Named(values)
    }
}

/// Walks `sql` outside of quoted strings and identifiers. Every named
/// placeholder is handed to `on_named`, which writes its replacement; text
/// is copied otherwise. Returns the rewritten text and the number of `?`
/// placeholders in the input.
fn scan(sql: &str, mut on_named: impl FnMut(&str, &mut String)) -> (String, usize) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut positional = 0;
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            out.push(c);
            if c == '\\' && q != '`' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            '?' => {
                positional += 1;
                out.push(c);
                i += 1;
            }
            '%' if chars.get(i + 1) == Some(&'(') => {
                let close = chars[i + 2..].iter().position(|&ch| ch == ')');
                match close {
                    Some(len) if chars.get(i + 3 + len) == Some(&'s') && len > 0 => {
                        let name: String = chars[i + 2..i + 2 + len].iter().collect();
                        on_named(&name, &mut out);
                        i += len + 4;
                    }
                    _ => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            ':' if is_name_start(chars.get(i + 1))
                && (i == 0 || !is_name_char(chars[i - 1]) && chars[i - 1] != ':') =>
            {
                let len = chars[i + 1..]
                    .iter()
                    .take_while(|&&ch| is_name_char(ch))
                    .count();
                let name: String = chars[i + 1..i + 1 + len].iter().collect();
                on_named(&name, &mut out);
                i += len + 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    (out, positional)
}

fn is_name_start(c: Option<&char>) -> bool {
    matches!(c, Some(ch) if ch.is_ascii_alphabetic() || *ch == '_')
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
