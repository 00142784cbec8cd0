//! Typed Testbed settings.
//!
//! Sources are layered, later ones winning:
//!
//! 1. built-in defaults,
//! 2. a JSON or TOML settings file,
//! 3. `TESTBED_*` environment variables (after an optional `.env` file has
//!    been loaded into the environment).

use crate::env::{EnvLoader, parse_flag};
use crate::loader::ConfigLoader;
use crate::validation::{self, Validate};
use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use testbed_core::{ContextOptions, TestContext};
use testbed_log::{Level, debug};

/// Cookie carrying the test identity when none is configured.
pub const DEFAULT_CORRELATION_COOKIE: &str = "testbed-test-id";

/// Variable naming a settings file, read when no file is given explicitly.
pub const SETTINGS_FILE_VAR: &str = "TESTBED_CONFIG";

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "warning", "error", "off"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Fail environments that bind no lifecycle listener.
    pub strict_listener: bool,
    /// Cookie name used to correlate requests with the test that sent them.
    pub correlation_cookie: String,
    /// Minimum level of Testbed's own log output.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            strict_listener: false,
            correlation_cookie: DEFAULT_CORRELATION_COOKIE.to_string(),
            log_level: "warn".to_string(),
        }
    }
}

impl Settings {
    /// Load from the default sources: `.env`, the file named by
    /// `TESTBED_CONFIG` if set, and `TESTBED_*` variables.
    pub fn load() -> Result<Self> {
        SettingsLoader::new().dotenv(None).load()
    }

    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            strict_listener: self.strict_listener,
        }
    }

    pub fn level(&self) -> Level {
        Level::parse(&self.log_level).unwrap_or(Level::Warn)
    }

    /// Apply the configured log level to Testbed's logger.
    pub fn apply_logging(&self) {
        testbed_log::set_level(self.level());
    }

    /// A context configured by these settings.
    pub fn build_context(&self) -> TestContext {
        TestContext::with_options(self.context_options())
    }

    /// Create the process-wide context from these settings.
    pub fn install_global(&self) -> Result<&'static TestContext> {
        self.apply_logging();
        Ok(TestContext::init_global(self.context_options())?)
    }
}

impl Validate for Settings {
    fn validate(&self) -> Result<()> {
        validation::cookie_name(&self.correlation_cookie, "correlation_cookie")?;
        validation::one_of(&self.log_level, LEVELS, "log_level")?;
        Ok(())
    }
}

impl From<&Settings> for ContextOptions {
    fn from(settings: &Settings) -> Self {
        settings.context_options()
    }
}

/// Builder for layered settings loading.
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    env: EnvLoader,
    file: Option<PathBuf>,
    dotenv: Option<Option<PathBuf>>,
    use_env: bool,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            env: EnvLoader::default(),
            file: None,
            dotenv: None,
            use_env: true,
        }
    }

    /// Read variables with a different prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env = EnvLoader::new(prefix);
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Load a `.env` file first; `None` uses the usual lookup.
    pub fn dotenv(mut self, path: Option<&Path>) -> Self {
        self.dotenv = Some(path.map(Path::to_path_buf));
        self
    }

    /// Skip environment variables entirely.
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    pub fn load(&self) -> Result<Settings> {
        if let Some(path) = &self.dotenv {
            EnvLoader::load_dotenv(path.as_deref())?;
        }

        let vars = if self.use_env {
            self.env.load()
        } else {
            HashMap::new()
        };

        let file = self
            .file
            .clone()
            .or_else(|| vars.get("config").map(PathBuf::from));
        let file_layer = match file {
            Some(path) => {
                debug!(target: "testbed::config", "Reading settings from {}", path.display());
                Some(ConfigLoader::auto(&path)?.load_file(&path)?)
            }
            None => None,
        };

        Self::assemble(file_layer, &vars)
    }

    /// Layer a parsed file and environment values over the defaults.
    fn assemble(file: Option<Value>, vars: &HashMap<String, String>) -> Result<Settings> {
        let defaults = serde_json::to_value(Settings::default())
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        let Value::Object(mut merged) = defaults else {
            return Err(ConfigError::LoadError("defaults are not a table".to_string()));
        };

        if let Some(Value::Object(table)) = file {
            for (key, value) in table {
                if merged.contains_key(&key) {
                    merged.insert(key, value);
                } else {
                    debug!(target: "testbed::config", "Ignoring unknown setting {}", key);
                }
            }
        }

        for (key, raw) in vars {
            if let Some(value) = Self::coerce(&merged, key, raw)? {
                merged.insert(key.clone(), value);
            }
        }

        let settings: Settings = serde_json::from_value(Value::Object(merged))
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Convert an environment string to the JSON type of the setting it
    /// overrides. Variables naming no setting are skipped.
    fn coerce(current: &Map<String, Value>, key: &str, raw: &str) -> Result<Option<Value>> {
        match current.get(key) {
            Some(Value::Bool(_)) => match parse_flag(raw) {
                Some(flag) => Ok(Some(Value::Bool(flag))),
                None => Err(ConfigError::Invalid {
                    field: "environment",
                    reason: format!("{} expects a boolean, got {:?}", key, raw),
                }),
            },
            Some(_) => Ok(Some(Value::String(raw.to_string()))),
            None => Ok(None),
        }
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}
