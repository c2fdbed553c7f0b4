//! Helpers for `from_env` configuration constructors.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::CoreError;

/// Read `key`, falling back to `default` when unset.
pub fn string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse `key`, falling back to `default` when unset.
///
/// A set but unparsable value is a validation error naming the variable.
pub fn parse_or<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

/// Read and parse `key` if it is set.
pub fn parse_opt<T>(key: &str) -> Result<Option<T>, CoreError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

/// Parse one raw value, attributing failures to `key`.
pub fn parse_value<T>(key: &str, raw: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CoreError::Validation(format!("{key} is invalid ({raw:?}): {e}")))
}

/// Comma-separated list with blanks removed.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
