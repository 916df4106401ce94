//! `ADT_*` environment lookups shared by both binaries.
//!
//! Every setting resolves as: explicit flag, then environment, then default.

use std::str::FromStr;
use tracing::warn;

/// Non-blank value of `key`.
pub fn env_value(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub fn env_true(key: &str) -> bool {
    env_value(key).is_some_and(|value| is_truthy(&value))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// String setting where an empty flag counts as unset.
pub fn resolve_string(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_value(key).unwrap_or_else(|| default.to_string())
}

/// Typed setting. An environment value that does not parse is logged and ignored.
pub fn resolve_with<T>(
    flag: Option<T>,
    key: &str,
    default: T,
    parse: impl FnOnce(&str) -> Option<T>,
) -> T {
    if let Some(value) = flag {
        return value;
    }
    let Some(raw) = env_value(key) else {
        return default;
    };
    match parse(raw.trim()) {
        Some(value) => value,
        None => {
            warn!(event = "env_invalid", key, value = %raw);
            default
        }
    }
}

pub fn resolve_parsed<T: FromStr>(flag: Option<T>, key: &str, default: T) -> T {
    resolve_with(flag, key, default, |raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "off", "enabled"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn flag_wins_over_environment() {
        std::env::set_var("ADT_TEST_FLAG_WINS", "99");
        assert_eq!(resolve_parsed(Some(3u64), "ADT_TEST_FLAG_WINS", 10), 3);
        assert_eq!(
            resolve_string("/var/log/adt", "ADT_TEST_FLAG_WINS", ".adt/logs"),
            "/var/log/adt"
        );
    }

    #[test]
    fn environment_fills_missing_flags() {
        std::env::set_var("ADT_TEST_ENV_FILLS", " 45 ");
        assert_eq!(resolve_parsed(None, "ADT_TEST_ENV_FILLS", 10u64), 45);
        assert_eq!(resolve_string("", "ADT_TEST_ENV_FILLS", "x"), " 45 ");
    }

    #[test]
    fn unparsable_or_blank_environment_falls_back() {
        std::env::set_var("ADT_TEST_ENV_BAD", "soon");
        assert_eq!(resolve_parsed(None, "ADT_TEST_ENV_BAD", 10u64), 10);
        std::env::set_var("ADT_TEST_ENV_BLANK", "   ");
        assert_eq!(resolve_parsed(None, "ADT_TEST_ENV_BLANK", 2.5f64), 2.5);
        assert_eq!(resolve_parsed(None, "ADT_TEST_ENV_UNSET_KEY", 7u64), 7);
    }
}
