//! Parser for `.properties`-style env files.
//!
//! Lines take the form `KEY=VALUE` or `KEY+=VALUE` (both plain assignment),
//! with an optional leading `export`. Values may be bare, single-quoted
//! (taken verbatim), or double-quoted (backslash escapes one character).
//! Bare values are trimmed and a `#` starts an inline comment; quoted
//! values keep `#` verbatim. Blank lines and `#` comments are skipped, and
//! so are malformed lines.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{codes, Error};
use crate::result::ApiResult;

/// Reads and parses an env file. An unreadable file is error 5019;
/// malformed lines inside a readable file are skipped, not rejected.
pub fn parse_env_file(path: &Path) -> ApiResult<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        Error::new(
            codes::CONFIG_UNREADABLE,
            format!("Failed to open env file: {}: {err}", path.display()),
        )
    })?;
    Ok(parse_env_text(&content))
}

/// Parses env-file content that is already in memory.
pub fn parse_env_text(content: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for raw_line in content.lines() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let line = line.trim_start_matches([' ', '\t']);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = match line.strip_prefix("export") {
            Some(rest) if rest.is_empty() || rest.starts_with([' ', '\t']) => {
                rest.trim_start_matches([' ', '\t'])
            }
            _ => line,
        };
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let key_end = line.find(['=', ' ', '\t']).unwrap_or(line.len());
        let mut key = line[..key_end].trim_end_matches([' ', '\t']).to_string();
        if key.is_empty() {
            continue;
        }

        let rest = line[key_end..].trim_start_matches([' ', '\t']);
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        if key.ends_with('+') {
            key.pop();
        }

        let rest = rest.trim_start_matches([' ', '\t']);
        let value = parse_value(rest);
        env.insert(key, value);
    }

    env
}

fn parse_value(rest: &str) -> String {
    let mut chars = rest.chars();
    match chars.next() {
        Some('\'') => {
            // verbatim up to the closing quote
            let body = &rest[1..];
            match body.find('\'') {
                Some(end) => body[..end].to_string(),
                None => body.to_string(),
            }
        }
        Some('"') => {
            let mut value = String::new();
            let mut escaped = false;
            for c in rest[1..].chars() {
                if escaped {
                    value.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    break;
                } else {
                    value.push(c);
                }
            }
            value
        }
        Some(_) => {
            let end = rest.find('#').unwrap_or(rest.len());
            rest[..end].trim_matches([' ', '\t']).to_string()
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn basic_assignments_and_export_prefix() {
        let env = parse_env_text("FOO=bar\nexport BAZ=qux\nexport\tTABBED=1\n");
        assert_eq!(env["FOO"], "bar");
        assert_eq!(env["BAZ"], "qux");
        assert_eq!(env["TABBED"], "1");
    }

    #[test]
    fn plus_equals_is_plain_assignment() {
        let env = parse_env_text("PATH+=/extra/bin\n");
        assert_eq!(env["PATH"], "/extra/bin");
    }

    #[test]
    fn bare_values_trim_and_stop_at_comments() {
        let env = parse_env_text("A=  spaced out  \nB=value # trailing comment\n");
        assert_eq!(env["A"], "spaced out");
        assert_eq!(env["B"], "value");
    }

    #[test]
    fn quoting_rules() {
        let env = parse_env_text(concat!(
            "SINGLE='keep \\n literal # hash'\n",
            "DOUBLE=\"a\\\"b # kept\"\n",
            "EMPTY=\n",
        ));
        assert_eq!(env["SINGLE"], "keep \\n literal # hash");
        assert_eq!(env["DOUBLE"], "a\"b # kept");
        assert_eq!(env["EMPTY"], "");
    }

    #[test]
    fn comments_blanks_and_malformed_lines_are_skipped() {
        let env = parse_env_text(concat!(
            "# full line comment\n",
            "\n",
            "   \t\n",
            "no_equals_sign\n",
            "=no_key\n",
            "GOOD=1\n",
        ));
        assert_eq!(env.len(), 1);
        assert_eq!(env["GOOD"], "1");
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let env = parse_env_text("A=1\r\nB=2\r\n");
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "2");
    }

    #[test]
    fn unreadable_file_is_error_5019() {
        let err = parse_env_file(Path::new("/nonexistent/definitely/missing.env")).unwrap_err();
        assert_eq!(err.code, codes::CONFIG_UNREADABLE);
    }

    #[test]
    fn reads_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "export TOKEN=abc123").unwrap();
        let env = parse_env_file(file.path()).unwrap();
        assert_eq!(env["TOKEN"], "abc123");
    }
}
