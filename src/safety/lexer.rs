//! MySQL lexical rules for comments, literals and statement boundaries.
//!
//! The parser, the scope guard and the driver all decide where a statement
//! ends from the output of these helpers, so they agree with each other and
//! with the server.

/// Removes comments the way the MySQL server reads them.
///
/// - `#` runs to the end of the line.
/// - `--` starts a comment only when followed by whitespace, a control
///   character or the end of input. Otherwise it is two minus signs and is
///   written out as `- -`.
/// - `/* ... */` ends at the first `*/`. Block comments do not nest.
/// - The body of a versioned comment (`/*!50000 ... */`) is executed by the
///   server, so it is kept.
///
/// String literals and quoted identifiers are copied through unchanged.
pub fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut in_versioned = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' | '"' | '`' => i = copy_quoted(&chars, i, &mut out),
            '/' if next == Some('*') => {
                if chars.get(i + 2) == Some(&'!') {
                    i += 3;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    in_versioned = true;
                } else {
                    i = skip_block_comment(&chars, i + 2);
                }
                out.push(' ');
            }
            '*' if in_versioned && next == Some('/') => {
                in_versioned = false;
                i += 2;
                out.push(' ');
            }
            '#' => i = skip_line(&chars, i),
            '-' if next == Some('-') => {
                if opens_dash_comment(chars.get(i + 2).copied()) {
                    i = skip_line(&chars, i);
                } else {
                    out.push_str("- ");
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Replaces every string literal in comment-free SQL with `''`. Backtick
/// identifiers are kept.
pub fn mask_literals(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\'' | '"' => {
                literal.clear();
                i = copy_quoted(&chars, i, &mut literal);
                out.push_str("''");
            }
            '`' => i = copy_quoted(&chars, i, &mut out),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// True when the server would read more than one statement from `sql`,
/// i.e. a `;` outside literals and comments is followed by more SQL.
pub fn has_statement_separator(sql: &str) -> bool {
    let chars: Vec<char> = strip_comments(sql).chars().collect();
    let mut scratch = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\'' | '"' | '`' => {
                scratch.clear();
                i = copy_quoted(&chars, i, &mut scratch);
            }
            ';' => {
                return chars[i + 1..]
                    .iter()
                    .any(|c| !c.is_whitespace() && *c != ';')
            }
            _ => i += 1,
        }
    }
    false
}

fn opens_dash_comment(after: Option<char>) -> bool {
    after.map_or(true, |c| c.is_whitespace() || c.is_control())
}

/// Copies the quoted section opening at `start` into `out` and returns the
/// index after its closing quote. Backslash escapes apply to string literals
/// only; a doubled quote is an escaped quote for all three quote styles.
fn copy_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push(quote);
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        if c == '\\' && quote != '`' {
            if let Some(&escaped) = chars.get(i + 1) {
                out.push(escaped);
            }
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                out.push(quote);
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn skip_block_comment(chars: &[char], from: usize) -> usize {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

/// Index of the newline ending the current line. The newline itself is kept.
fn skip_line(chars: &[char], from: usize) -> usize {
    chars[from..]
        .iter()
        .position(|&c| c == '\n')
        .map_or(chars.len(), |offset| from + offset)
}
