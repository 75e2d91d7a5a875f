//! Lexical helpers over raw T-SQL text used by the compiler and the
//! recovery steps of the engine. None of these parse SQL; they are
//! keyword heuristics that skip string literals where it matters.

/// Marker variable embedded by [`rewrap_nonquery`].
pub const REWRAP_MARKER: &str = "@__sqlchain_rowcount";

/// Substrings that mark a statement as server-scoped and only runnable
/// through `EXEC ... AT`.
const RPC_ONLY: &[&str] = &[
    "create login",
    "alter login",
    "drop login",
    "alter server",
    "sp_configure",
    "reconfigure",
    "xp_",
    "create endpoint",
];

/// Strip trailing terminators and whitespace, then terminate exactly once.
pub fn terminate(statement: &str) -> String {
    let body = statement.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    format!("{};", body)
}

/// Bracket-quote an identifier.
pub fn bracket(identifier: &str) -> String {
    format!("[{}]", identifier.replace(']', "]]"))
}

/// Single-quote a string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Lowercase and collapse every whitespace run into one space.
fn normalize(statement: &str) -> String {
    statement
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '$')
}

/// True when `keyword` (lowercase) starts at a word boundary in `haystack`
/// (lowercase, normalized). Keywords ending in `_` are prefixes and match
/// any continuation; all others must also end at a word boundary.
fn has_keyword(haystack: &str, keyword: &str) -> bool {
    let prefix = keyword.ends_with('_');
    haystack.match_indices(keyword).any(|(at, _)| {
        let head = haystack[..at].chars().last().map_or(true, |c| !is_word_char(c));
        let tail = prefix
            || haystack[at + keyword.len()..]
                .chars()
                .next()
                .map_or(true, |c| !is_word_char(c));
        head && tail
    })
}

/// Whether the statement must be sent with `EXEC ... AT` rather than
/// through `OPENQUERY`.
pub fn requires_rpc(statement: &str) -> bool {
    let text = normalize(statement);
    RPC_ONLY.iter().any(|keyword| has_keyword(&text, keyword))
}

fn starts_with_use(s: &str) -> bool {
    s.get(..3).map_or(false, |head| head.eq_ignore_ascii_case("use"))
        && s[3..]
            .chars()
            .next()
            .map_or(false, |c| c.is_whitespace() || c == '[')
}

/// Drop leading `USE <db>;` statements.
fn skip_use(statement: &str) -> &str {
    let mut rest = statement.trim_start();
    while starts_with_use(rest) {
        match rest.find(';') {
            Some(end) => rest = rest[end + 1..].trim_start(),
            None => break,
        }
    }
    rest
}

/// Heuristic for a plain data-returning SELECT: starts with SELECT (after
/// any `USE` statements), has a FROM, and modifies nothing.
pub fn is_data_select(statement: &str) -> bool {
    let text = normalize(skip_use(statement));
    text.starts_with("select")
        && has_keyword(&text, "from")
        && !["insert", "update", "delete"]
            .iter()
            .any(|kw| has_keyword(&text, kw))
}

pub fn is_rewrapped(statement: &str) -> bool {
    statement.contains(REWRAP_MARKER)
}

/// Wrap a statement that produces no rowset so that it always yields exactly
/// one row with a `Result` column (row count, or `OK`) and an `Error` column
/// (NULL, or the caught error message).
pub fn rewrap_nonquery(statement: &str) -> String {
    format!(
        "SET NOCOUNT ON; DECLARE {marker} INT; \
         BEGIN TRY {body} SET {marker} = @@ROWCOUNT; \
         SELECT COALESCE(CAST({marker} AS NVARCHAR(4000)), 'OK') AS [Result], \
         CAST(NULL AS NVARCHAR(4000)) AS [Error]; END TRY \
         BEGIN CATCH SELECT CAST(NULL AS NVARCHAR(4000)) AS [Result], \
         ERROR_MESSAGE() AS [Error]; END CATCH;",
        marker = REWRAP_MARKER,
        body = terminate(statement),
    )
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || matches!(b, b'_' | b'@' | b'#' | b'[')
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'@' | b'#' | b'$')
}

/// End offset of the identifier starting at `start`, bracketed or bare.
fn ident_end(bytes: &[u8], start: usize) -> usize {
    if bytes[start] == b'[' {
        let mut i = start + 1;
        while i < bytes.len() {
            if bytes[i] == b']' {
                if bytes.get(i + 1) == Some(&b']') {
                    i += 2;
                    continue;
                }
                return i + 1;
            }
            i += 1;
        }
        return bytes.len();
    }
    let mut i = start;
    while i < bytes.len() && is_ident_byte(bytes[i]) {
        i += 1;
    }
    i
}

/// End offset of the string literal starting at `start`.
fn literal_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Remove the database part of three-part names (`db.schema.object`,
/// `db..object`) outside string literals.
pub fn strip_database_prefix(statement: &str) -> String {
    let bytes = statement.as_bytes();
    let mut out = String::with_capacity(statement.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\'' {
            let end = literal_end(bytes, i);
            out.push_str(&statement[i..end]);
            i = end;
        } else if is_ident_start(b) {
            // Collect the dotted name as a list of (possibly empty) parts.
            let start = i;
            let mut parts = Vec::new();
            let mut j = i;
            loop {
                let end = if j < bytes.len() && is_ident_start(bytes[j]) {
                    ident_end(bytes, j)
                } else {
                    j
                };
                parts.push((j, end));
                if end < bytes.len() && bytes[end] == b'.' {
                    j = end + 1;
                } else {
                    j = end;
                    break;
                }
            }
            if parts.len() == 3 && parts[0].0 < parts[0].1 {
                // `db..object` keeps just the object
                let keep = if parts[1].0 < parts[1].1 { parts[1].0 } else { parts[2].0 };
                out.push_str(&statement[keep..j]);
            } else {
                out.push_str(&statement[start..j]);
            }
            i = j;
        } else {
            let len = statement[i..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&statement[i..i + len]);
            i += len;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminate() {
        assert_eq!(terminate("SELECT 1"), "SELECT 1;");
        assert_eq!(terminate("  SELECT 1;;  ; "), "SELECT 1;");
        assert_eq!(terminate("SELECT ';'"), "SELECT ';';");
    }

    #[test]
    fn test_quoting() {
        assert_eq!(bracket("we]ird"), "[we]]ird]");
        assert_eq!(quote("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_requires_rpc() {
        assert!(requires_rpc("EXEC sp_configure 'show advanced options', 1"));
        assert!(requires_rpc("reconfigure;"));
        assert!(requires_rpc("EXEC master..xp_dirtree '\\\\10.0.0.5\\x'"));
        assert!(requires_rpc("CREATE   LOGIN [x] WITH PASSWORD = 'p'"));
        assert!(requires_rpc("alter\nserver role sysadmin add member x"));
        assert!(requires_rpc("CREATE ENDPOINT ep STATE = STARTED"));
        assert!(!requires_rpc("SELECT name FROM sys.servers"));
        assert!(!requires_rpc("SELECT exp_date FROM t"));
        assert!(!requires_rpc("SELECT reconfigured FROM t"));
    }

    #[test]
    fn test_is_data_select() {
        assert!(is_data_select("SELECT name FROM sys.databases"));
        assert!(is_data_select("USE [hr]; use msdb; SELECT * FROM jobs"));
        assert!(!is_data_select("SELECT 1"));
        assert!(!is_data_select("SELECT * INTO x FROM y; DELETE FROM y"));
        assert!(!is_data_select("UPDATE t SET a = 1 FROM t"));
        assert!(!is_data_select("EXEC sp_who"));
    }

    #[test]
    fn test_rewrap() {
        let wrapped = rewrap_nonquery("UPDATE t SET a = 1;");
        assert!(is_rewrapped(&wrapped));
        assert!(!is_rewrapped("UPDATE t SET a = 1;"));
        assert!(wrapped.contains("BEGIN TRY UPDATE t SET a = 1; SET"));
        assert!(wrapped.contains("AS [Result]"));
        assert!(wrapped.contains("ERROR_MESSAGE() AS [Error]"));
        assert_eq!(wrapped.matches("AS [Result]").count(), 2);
        assert_eq!(wrapped.matches("AS [Error]").count(), 2);
    }

    #[test]
    fn test_strip_database_prefix() {
        assert_eq!(
            strip_database_prefix("SELECT name FROM master.sys.databases"),
            "SELECT name FROM sys.databases"
        );
        assert_eq!(
            strip_database_prefix("EXEC master..xp_dirtree 'a.b.c'"),
            "EXEC xp_dirtree 'a.b.c'"
        );
        assert_eq!(
            strip_database_prefix("SELECT * FROM [my db].[dbo].[t] t"),
            "SELECT * FROM [dbo].[t] t"
        );
        assert_eq!(
            strip_database_prefix("SELECT a.b FROM dbo.t a"),
            "SELECT a.b FROM dbo.t a"
        );
        assert_eq!(
            strip_database_prefix("SELECT 1.5, N'é' FROM srv.db.dbo.t"),
            "SELECT 1.5, N'é' FROM srv.db.dbo.t"
        );
    }
}
