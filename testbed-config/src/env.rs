// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;
use std::path::Path;

/// Prefix of every variable Testbed reads.
pub const DEFAULT_PREFIX: &str = "TESTBED";

/// Reads prefixed environment variables, e.g. `TESTBED_STRICT_LISTENER`.
#[derive(Debug, Clone)]
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Every variable carrying the prefix, keyed by the lowercased remainder.
    pub fn load(&self) -> HashMap<String, String> {
        Self::strip(&self.prefix, env::vars())
    }

    fn strip(
        prefix: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> HashMap<String, String> {
        let marker = format!("{}_", prefix);
        vars.into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&marker)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_lowercase(), value))
            })
            .collect()
    }

    /// Name of the variable holding `key`.
    pub fn var_name(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.to_uppercase())
    }

    /// The value of `key`, if set and valid unicode.
    pub fn var(&self, key: &str) -> Option<String> {
        env::var(self.var_name(key)).ok()
    }

    pub fn var_or(&self, key: &str, default: &str) -> String {
        self.var(key).unwrap_or_else(|| default.to_string())
    }

    /// Load variables from a `.env` file into the process environment.
    ///
    /// Without a path the usual `.env` lookup is used and a missing file is
    /// not an error. Variables already set are left untouched.
    pub fn load_dotenv(path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => dotenvy::from_path(path)
                .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e))),
            None => match dotenvy::dotenv() {
                Ok(_) => Ok(()),
                Err(e) if e.not_found() => Ok(()),
                Err(e) => Err(ConfigError::LoadError(e.to_string())),
            },
        }
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Parse a boolean flag the way the logging variables are parsed.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
