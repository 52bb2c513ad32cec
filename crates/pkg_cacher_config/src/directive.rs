//! The line-oriented `key value` directive format pkg-cacher's
//! configuration file uses: one directive per line, `#`-prefixed comments
//! and blank lines ignored, the value running to end-of-line.

use crate::error::LoadError;
use std::collections::HashMap;

/// Parses directive text into a key → raw value map. Later occurrences of a
/// key overwrite earlier ones, matching how the original configuration file
/// behaves when a key is repeated.
pub fn parse_directives(text: &str) -> Result<HashMap<String, String>, LoadError> {
    let mut directives = HashMap::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();

        if key.is_empty() || value.is_empty() {
            return Err(LoadError::MalformedDirective {
                line: idx + 1,
                text: raw_line.to_string(),
            });
        }

        directives.insert(key.to_string(), value.to_string());
    }

    Ok(directives)
}

/// Applies `PKG_CACHER_<KEY>` environment overrides on top of parsed file
/// directives, as CGI mode requires (§6, "Environment (CGI mode)").
pub fn apply_env_overrides(directives: &mut HashMap<String, String>, keys: &[&str]) {
    for &key in keys {
        let env_name = format!("PKG_CACHER_{}", key.to_uppercase());
        if let Ok(value) = std::env::var(&env_name) {
            directives.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_simple_directives() {
        let text = "cache_dir /var/cache/pkg-cacher\n# a comment\n\ndaemon_port 8080\n";
        let directives = parse_directives(text).unwrap();
        assert_eq!(directives.get("cache_dir").unwrap(), "/var/cache/pkg-cacher");
        assert_eq!(directives.get("daemon_port").unwrap(), "8080");
    }

    #[test]
    fn later_key_wins() {
        let text = "debug 0\ndebug 1\n";
        let directives = parse_directives(text).unwrap();
        assert_eq!(directives.get("debug").unwrap(), "1");
    }

    #[test]
    fn rejects_key_without_value() {
        let err = parse_directives("cache_dir\n").unwrap_err();
        match err {
            LoadError::MalformedDirective { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn env_override_takes_priority() {
        std::env::set_var("PKG_CACHER_DEBUG", "1");
        let mut directives = HashMap::new();
        directives.insert("debug".to_string(), "0".to_string());
        apply_env_overrides(&mut directives, &["debug"]);
        assert_eq!(directives.get("debug").unwrap(), "1");
        std::env::remove_var("PKG_CACHER_DEBUG");
    }
}
