//! Minimal SQL text scanning: splitting migration files into statements and inlining bound
//! arguments as literals. Quoted strings, quoted identifiers, comments and dollar quotes are
//! skipped so that `;`, `?` and `$1` inside them are left alone.

use crate::core::Value;

/// A statement as read back from a migration file.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawStatement {
    pub comment: Option<String>,
    pub sql: String,
}

/// If a quoted region or comment starts at `i`, return the index just past its end.
fn skip_region(src: &[u8], i: usize) -> Option<usize> {
    let len = src.len();
    match src[i] {
        quote @ (b'\'' | b'"' | b'`') => {
            let mut j = i + 1;
            while j < len {
                if src[j] == b'\\' && quote == b'\'' {
                    j += 2;
                    continue;
                }
                if src[j] == quote {
                    if j + 1 < len && src[j + 1] == quote {
                        j += 2;
                        continue;
                    }
                    return Some(j + 1);
                }
                j += 1;
            }
            Some(len)
        }
        b'-' if src.get(i + 1) == Some(&b'-') => Some(
            src[i..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(len, |p| i + p),
        ),
        b'/' if src.get(i + 1) == Some(&b'*') => Some(
            src[i + 2..]
                .windows(2)
                .position(|w| w == b"*/")
                .map_or(len, |p| i + 2 + p + 2),
        ),
        b'$' => {
            let mut j = i + 1;
            while j < len && (src[j].is_ascii_alphanumeric() || src[j] == b'_') {
                j += 1;
            }
            let tag_starts_with_digit = j > i + 1 && src[i + 1].is_ascii_digit();
            if j < len && src[j] == b'$' && !tag_starts_with_digit {
                let tag = &src[i..=j];
                let body = j + 1;
                Some(
                    src[body..]
                        .windows(tag.len())
                        .position(|w| w == tag)
                        .map_or(len, |p| body + p + tag.len()),
                )
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Nesting of `BEGIN`/`CASE` ... `END` blocks inside a `CREATE TRIGGER` statement, whose body
/// holds `;`-terminated statements of its own.
#[derive(Debug, Default)]
struct TriggerBody {
    leading: Vec<String>,
    is_trigger: bool,
    depth: usize,
    after_end: bool,
}

impl TriggerBody {
    fn word(&mut self, word: &str) {
        let word = word.to_ascii_uppercase();
        if self.leading.len() < 3 {
            self.leading.push(word.clone());
            let leading: Vec<&str> = self.leading.iter().map(String::as_str).collect();
            self.is_trigger = matches!(
                leading.as_slice(),
                ["CREATE", "TRIGGER", ..] | ["CREATE", "TEMP" | "TEMPORARY", "TRIGGER"]
            );
        }
        if !self.is_trigger {
            return;
        }
        let after_end = std::mem::take(&mut self.after_end);
        match word.as_str() {
            "BEGIN" | "CASE" if !after_end => self.depth += 1,
            "END" => {
                self.depth = self.depth.saturating_sub(1);
                self.after_end = true;
            }
            // `END IF` and friends close blocks that were never counted
            "IF" | "LOOP" | "WHILE" | "REPEAT" if after_end => self.depth += 1,
            _ => {}
        }
    }

    fn is_open(&self) -> bool {
        self.depth > 0
    }
}

/// Split migration file content into statements. Consecutive `--` lines directly before a
/// statement become that statement's comment; the terminating `;` is not part of the text.
/// A `;` inside the `BEGIN ... END` body of a trigger does not end the statement.
pub(crate) fn split_statements(src: &str) -> Vec<RawStatement> {
    let bytes = src.as_bytes();
    let mut statements = Vec::new();
    let mut comment_lines: Vec<String> = Vec::new();
    let mut start: Option<usize> = None;
    let mut body = TriggerBody::default();
    let mut i = 0;

    let mut push = |start: usize, end: usize, comment_lines: &mut Vec<String>| {
        let sql = src[start..end].trim();
        if sql.is_empty() {
            return;
        }
        let comment = if comment_lines.is_empty() {
            None
        } else {
            Some(comment_lines.join("\n"))
        };
        comment_lines.clear();
        statements.push(RawStatement {
            comment,
            sql: sql.to_string(),
        });
    };

    while i < bytes.len() {
        match start {
            None => {
                if bytes[i].is_ascii_whitespace() {
                    i += 1;
                } else if bytes[i] == b'-' && bytes.get(i + 1) == Some(&b'-') {
                    let end = skip_region(bytes, i).unwrap_or(bytes.len());
                    let line = src[i + 2..end].trim_end_matches('\r');
                    comment_lines.push(line.strip_prefix(' ').unwrap_or(line).to_string());
                    i = end;
                } else if bytes[i] == b';' {
                    i += 1;
                } else {
                    start = Some(i);
                }
            }
            Some(s) => {
                if let Some(end) = skip_region(bytes, i) {
                    i = end;
                } else if bytes[i].is_ascii_alphabetic() || bytes[i] == b'_' {
                    let end = bytes[i..]
                        .iter()
                        .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                        .map_or(bytes.len(), |p| i + p);
                    body.word(&src[i..end]);
                    i = end;
                } else if bytes[i] == b';' && !body.is_open() {
                    push(s, i, &mut comment_lines);
                    start = None;
                    body = TriggerBody::default();
                    i += 1;
                } else {
                    i += 1;
                }
            }
        }
    }
    if let Some(s) = start {
        push(s, bytes.len(), &mut comment_lines);
    }
    statements
}

/// Render one statement for a migration file: comment lines, then the text and its terminator.
pub(crate) fn render_statement(comment: Option<&str>, sql: &str) -> String {
    let mut out = String::new();
    if let Some(comment) = comment {
        for line in comment.lines() {
            if line.is_empty() {
                out.push_str("--\n");
            } else {
                out.push_str("-- ");
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    let sql = normalize(sql);
    out.push_str(sql);
    if ends_in_line_comment(sql) {
        out.push('\n');
    }
    out.push_str(";\n");
    out
}

/// Trim whitespace and any trailing terminators.
fn normalize(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn ends_in_line_comment(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match skip_region(bytes, i) {
            Some(end) => {
                if end >= bytes.len() && bytes[i] == b'-' {
                    return true;
                }
                i = end;
            }
            None => i += 1,
        }
    }
    false
}

/// Replace `?` and `$N` placeholders with the literal form of the bound arguments.
pub(crate) fn inline_args(sql: &str, args: &[Value]) -> Result<String, String> {
    if args.is_empty() {
        return Ok(sql.to_string());
    }
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + args.len() * 8);
    let mut last = 0;
    let mut positional = 0;
    let mut highest_numbered = 0;
    let mut i = 0;
    while i < bytes.len() {
        if let Some(end) = skip_region(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'?' => {
                let value = args.get(positional).ok_or_else(|| {
                    format!(
                        "placeholder {} has no bound argument ({} bound)",
                        positional + 1,
                        args.len()
                    )
                })?;
                out.push_str(&sql[last..i]);
                out.push_str(&value.to_sql_literal());
                positional += 1;
                i += 1;
                last = i;
            }
            b'$' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                let n: usize = sql[i + 1..j]
                    .parse()
                    .map_err(|_| format!("invalid placeholder {}", &sql[i..j]))?;
                let value = n
                    .checked_sub(1)
                    .and_then(|idx| args.get(idx))
                    .ok_or_else(|| {
                        format!("placeholder ${n} has no bound argument ({} bound)", args.len())
                    })?;
                out.push_str(&sql[last..i]);
                out.push_str(&value.to_sql_literal());
                highest_numbered = highest_numbered.max(n);
                i = j;
                last = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[last..]);
    let consumed = positional.max(highest_numbered);
    if consumed != args.len() {
        return Err(format!(
            "{} arguments bound but only {} placeholders used",
            args.len(),
            consumed
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons_only() {
        let src = "CREATE TABLE t (a TEXT DEFAULT ';');\n\
                   INSERT INTO t VALUES ('it''s; fine');\n\
                   CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1; $body$ LANGUAGE sql;";
        let statements = split_statements(src);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].sql, "CREATE TABLE t (a TEXT DEFAULT ';')");
        assert_eq!(statements[1].sql, "INSERT INTO t VALUES ('it''s; fine')");
        assert_eq!(
            statements[2].sql,
            "CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1; $body$ LANGUAGE sql"
        );
    }

    #[test]
    fn leading_comment_lines_attach_to_the_next_statement() {
        let src = "-- first\n-- second\nUPDATE t SET a = 1;\n\nDELETE FROM t -- inline; not a split\nWHERE a = 2;";
        let statements = split_statements(src);
        assert_eq!(
            statements,
            vec![
                RawStatement {
                    comment: Some("first\nsecond".to_string()),
                    sql: "UPDATE t SET a = 1".to_string(),
                },
                RawStatement {
                    comment: None,
                    sql: "DELETE FROM t -- inline; not a split\nWHERE a = 2".to_string(),
                },
            ]
        );
    }

    #[test]
    fn trigger_bodies_stay_in_one_statement() {
        let src = "CREATE TABLE a (id INTEGER);\n\
                   CREATE TABLE b (id INTEGER);\n\
                   CREATE TRIGGER a_ins AFTER INSERT ON a BEGIN INSERT INTO b VALUES (NEW.id); END;\n\
                   -- after\n\
                   UPDATE a SET id = 1;";
        let statements = split_statements(src);
        assert_eq!(statements.len(), 4);
        assert_eq!(
            statements[2].sql,
            "CREATE TRIGGER a_ins AFTER INSERT ON a BEGIN INSERT INTO b VALUES (NEW.id); END"
        );
        assert_eq!(statements[3].comment.as_deref(), Some("after"));
        assert_eq!(statements[3].sql, "UPDATE a SET id = 1");
    }

    #[test]
    fn trigger_bodies_with_case_and_nested_blocks() {
        let src = "create temp trigger t_upd before update on t\n\
                   begin\n\
                     update u set v = case when new.x > 0 then 'end;' else 0 end;\n\
                     select raise(abort, 'no') where new.x is null;\n\
                   end;\n\
                   CREATE TRIGGER m BEFORE INSERT ON t FOR EACH ROW BEGIN\n\
                     IF NEW.x < 0 THEN SET NEW.x = 0; END IF;\n\
                   END;\n\
                   SELECT 'begin';";
        let statements = split_statements(src);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].sql.ends_with("where new.x is null;\nend"));
        assert!(statements[1].sql.ends_with("END IF;\nEND"));
        assert_eq!(statements[2].sql, "SELECT 'begin'");
    }

    #[test]
    fn begin_outside_a_trigger_does_not_nest() {
        let statements = split_statements("BEGIN;\nUPDATE t SET a = 1;\nCOMMIT;");
        assert_eq!(statements.len(), 3);
    }

    #[test]
    fn unterminated_final_statement_is_kept() {
        let statements = split_statements("SELECT 1;\nSELECT 2\n");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].sql, "SELECT 2");
    }

    #[test]
    fn render_moves_terminator_out_of_trailing_comment() {
        let rendered = render_statement(None, "SELECT 1 -- trailing");
        assert_eq!(rendered, "SELECT 1 -- trailing\n;\n");
        let parsed = split_statements(&rendered);
        assert_eq!(parsed[0].sql, "SELECT 1 -- trailing");
    }

    #[test]
    fn inlines_positional_and_numbered_placeholders() {
        let sql = inline_args(
            "UPDATE t SET a = ?, b = ? WHERE c = '?'",
            &[Value::Int(1), Value::Text("x'y".into())],
        )
        .unwrap();
        assert_eq!(sql, "UPDATE t SET a = 1, b = 'x''y' WHERE c = '?'");

        let sql = inline_args("SELECT $2, $1", &[Value::Null, Value::Bool(true)]).unwrap();
        assert_eq!(sql, "SELECT TRUE, NULL");
    }

    #[test]
    fn placeholder_argument_mismatch_is_reported() {
        assert!(inline_args("SELECT ?", &[Value::Int(1), Value::Int(2)]).is_err());
        assert!(inline_args("SELECT ?, ?", &[Value::Int(1)]).is_err());
    }
}
