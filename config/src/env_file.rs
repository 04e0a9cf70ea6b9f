//! Parse a project `.env` file into a key-value map (applied in lib, never here).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Path of the `.env` to read: `override_dir` when given, else the current directory.
fn env_file_path(override_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = match override_dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().ok()?,
    };
    let path = dir.join(".env");
    path.is_file().then_some(path)
}

/// Strips matching surrounding quotes. Double quotes honor `\"` escapes;
/// single quotes are literal.
fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return value[1..value.len() - 1].replace("\\\"", "\"");
    }
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].to_string();
    }
    value.to_string()
}

/// Minimal `.env` parser: `KEY=VALUE` lines, `#`-prefixed lines and blanks
/// skipped, keys and values trimmed. No multiline values.
fn parse(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), unquote(value.trim()));
    }
    out
}

/// Loads the `.env` into a map. A missing file yields an empty map.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    match env_file_path(override_dir) {
        Some(path) => Ok(parse(&std::fs::read_to_string(path)?)),
        None => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_values() {
        let m = parse("FOO=bar\nBAZ=quux\n");
        assert_eq!(m.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(m.get("BAZ"), Some(&"quux".to_string()));
    }

    #[test]
    fn comments_blanks_and_bare_lines_skipped() {
        let m = parse("# comment\n\nNOT_A_PAIR\nKEY=val\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("KEY"), Some(&"val".to_string()));
    }

    #[test]
    fn quotes_are_stripped() {
        let m = parse("A=\"hello world\"\nB='single'\nC=\"say \\\"hi\\\"\"\n");
        assert_eq!(m.get("A"), Some(&"hello world".to_string()));
        assert_eq!(m.get("B"), Some(&"single".to_string()));
        assert_eq!(m.get("C"), Some(&"say \"hi\"".to_string()));
    }

    #[test]
    fn empty_value_and_empty_key() {
        let m = parse("EMPTY=\n=value_only\nOK=1\n");
        assert_eq!(m.get("EMPTY"), Some(&String::new()));
        assert!(!m.contains_key(""));
        assert_eq!(m.get("OK"), Some(&"1".to_string()));
    }

    #[test]
    fn missing_file_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn reads_file_from_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=1\nB=2\n").unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert_eq!(m.get("A"), Some(&"1".to_string()));
        assert_eq!(m.get("B"), Some(&"2".to_string()));
    }
}
