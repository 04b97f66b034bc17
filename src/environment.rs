use std::env;
use std::str::FromStr;

use tracing::warn;

/// Retrieves an environment variable and splits it into a vector of strings based on a delimiter.
///
/// Empty segments are dropped, so an unset variable yields an empty vector.
///
/// # Arguments
/// - `var`: The name of the environment variable.
/// - `delimiter`: The character to split the environment variable's value by.
///
/// # Returns
/// - `Vec<String>`
pub fn get_env_var_as_vec(var: &str, delimiter: char) -> Vec<String> {
    env::var(var)
        .unwrap_or_default()
        .split(delimiter)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reads and parses an environment variable, falling back to `default` when it is
/// unset or malformed. A malformed value is logged.
pub fn get_env_var_or<T: FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring malformed value {:?} for {}, using default", raw, var);
                default
            }
        },
        _ => default,
    }
}

/// Reads an optional environment variable, treating blank values as unset.
pub fn get_env_var_opt(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
