//! `${VAR}` / `${VAR:-default}` substitution for config files and descriptors.
//!
//! Lookups go through a caller-supplied function so that resolution happens
//! exactly once, at startup, and tests never touch the process environment.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex")
    })
}

/// Lookup backed by the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Replace every `${VAR}` and `${VAR:-default}` in `input`.
///
/// A variable that is unset (or empty) falls back to its default; with no
/// default it is an error.
pub fn substitute<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in var_pattern().captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&input[last..whole.start()]);

        let name = &caps[1];
        let value = match (lookup(name).filter(|v| !v.is_empty()), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => return Err(ConfigError::MissingEnv(name.to_string())),
        };
        out.push_str(&value);
        last = whole.end();
    }

    out.push_str(&input[last..]);
    Ok(out)
}

/// Apply [`substitute`] to every string value in a TOML tree.
///
/// Keys and comments are left alone.
pub fn substitute_toml<F>(value: &mut toml::Value, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        toml::Value::String(s) => {
            *s = substitute(s, lookup)?;
        }
        toml::Value::Array(items) => {
            for item in items {
                substitute_toml(item, lookup)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_toml(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Apply [`substitute`] to every string scalar in a YAML tree.
pub fn substitute_yaml<F>(value: &mut serde_yaml::Value, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        serde_yaml::Value::String(s) => {
            *s = substitute(s, lookup)?;
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                substitute_yaml(item, lookup)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_yaml(item, lookup)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => substitute_yaml(&mut tagged.value, lookup)?,
        _ => {}
    }
    Ok(())
}
