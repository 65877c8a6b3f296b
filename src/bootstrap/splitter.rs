//! Migration script splitter
//!
//! Scripts are split line by line. A nesting counter goes up on every
//! `BEGIN` or `CASE` keyword and down on every `END`; a line ending in
//! `;` closes the current statement only when the counter is back at
//! zero. That keeps trigger bodies, which contain their own semicolons,
//! in one piece.
//!
//! Keywords inside string literals, quoted identifiers and `--` comments
//! are ignored. A `BEGIN` that opens a statement (`BEGIN TRANSACTION;`)
//! does not nest.

/// Split a script into executable statements, in order
///
/// Nesting is counted per keyword rather than per line, so a trigger
/// written on one line (`... BEGIN ...; END;`) stays whole. `CASE` counts
/// as an opener too, since its `END` would otherwise close a trigger body
/// early. Scripts that put each `BEGIN` and `END` on its own line split
/// the same way under either rule.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut buffer = String::new();
    let mut depth: usize = 0;
    let mut started = false;

    for line in script.lines() {
        let code = code_only(line);

        for word in code
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
        {
            if word.eq_ignore_ascii_case("BEGIN") {
                if started {
                    depth += 1;
                }
            } else if word.eq_ignore_ascii_case("CASE") {
                depth += 1;
            } else if word.eq_ignore_ascii_case("END") {
                depth = depth.saturating_sub(1);
            }
            started = true;
        }

        buffer.push_str(line);
        buffer.push('\n');

        if depth == 0 && code.trim_end().ends_with(';') {
            push_statement(&mut statements, &buffer);
            buffer.clear();
            started = false;
        }
    }

    push_statement(&mut statements, &buffer);
    statements
}

fn push_statement(statements: &mut Vec<String>, buffer: &str) {
    let has_code = buffer
        .lines()
        .map(code_only)
        .any(|code| !code.trim().trim_matches(';').trim().is_empty());
    if has_code {
        statements.push(buffer.trim().to_string());
    }
}

/// The line with quoted text blanked out and any `--` comment removed
fn code_only(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(' ');
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(' ');
                }
                '-' if chars.peek() == Some(&'-') => break,
                _ => out.push(c),
            },
        }
    }
    out
}
