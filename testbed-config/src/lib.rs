// Settings loading for Testbed
//
// Settings come from built-in defaults, an optional JSON/TOML file and
// `TESTBED_*` environment variables (optionally seeded from a `.env` file),
// and are turned into the options a `TestContext` is created with.

pub mod env;
pub mod error;
pub mod loader;
pub mod settings;
pub mod validation;

pub use env::{DEFAULT_PREFIX, EnvLoader};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use settings::{DEFAULT_CORRELATION_COOKIE, SETTINGS_FILE_VAR, Settings, SettingsLoader};
pub use validation::Validate;
