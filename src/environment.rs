use std::env;
use std::str::FromStr;

/// Retrieves an environment variable, falling back to a default when unset.
pub fn get_env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Retrieves an environment variable and parses it, falling back to a default
/// when unset or unparseable.
pub fn get_env_parsed<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
