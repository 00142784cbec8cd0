//! Testbed Logging
//!
//! Structured logging for the Testbed crates, controlled through the
//! `TESTBED_DEBUG` family of environment variables.
//!
//! Every log line can carry the display name of the test that is current on
//! the emitting thread. The core crate publishes that name whenever it makes
//! a test current, so container construction, scope resolution and teardown
//! messages can be attributed to the test that caused them.
//!
//! # Usage
//!
//! ```rust
//! use testbed_log::{debug, info, warn};
//!
//! debug!("Resolving environment");
//! info!("Container built in {}ms", 12);
//! warn!(target: "testbed::teardown", "Teardown action failed: {}", "boom");
//! ```
//!
//! # Variables
//!
//! - `TESTBED_DEBUG=1` turns on debug output
//! - `TESTBED_LOG_LEVEL=trace|debug|info|warn|error|off`
//! - `TESTBED_LOG_FORMAT=pretty|compact|json|facade`
//! - `TESTBED_LOG_COLOR=1|0`
//! - `TESTBED_LOG_TIMESTAMPS=1|0`

use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Severity of a log line. `Off` filters everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Off = 5,
}

const LEVELS: [Level; 6] = [
    Level::Trace,
    Level::Debug,
    Level::Info,
    Level::Warn,
    Level::Error,
    Level::Off,
];

const LEVEL_ALIASES: &[(&str, Level)] = &[
    ("trace", Level::Trace),
    ("debug", Level::Debug),
    ("info", Level::Info),
    ("warn", Level::Warn),
    ("warning", Level::Warn),
    ("error", Level::Error),
    ("off", Level::Off),
    ("none", Level::Off),
];

impl Level {
    /// Look up a level by name, ignoring case and surrounding whitespace.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        LEVEL_ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map(|&(_, level)| level)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    fn from_index(index: u8) -> Self {
        LEVELS.get(index as usize).copied().unwrap_or(Level::Off)
    }

    fn facade(self) -> Option<log::Level> {
        Some(match self {
            Level::Trace => log::Level::Trace,
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
            Level::Off => return None,
        })
    }

    fn label(self, color: bool) -> String {
        #[cfg(feature = "color")]
        if color {
            use colored::{Color, Colorize};
            let tint = match self {
                Level::Trace => Color::Magenta,
                Level::Debug => Color::Blue,
                Level::Info => Color::Green,
                Level::Warn => Color::Yellow,
                Level::Error | Level::Off => Color::Red,
            };
            return format!("{:5}", self.as_str().color(tint));
        }
        #[cfg(not(feature = "color"))]
        let _ = color;
        format!("{:5}", self.as_str())
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Date, padded level, target and test
    Pretty,
    /// Time and the first letter of the level
    Compact,
    /// One JSON object per line
    Json,
    /// Handed to the `log` facade; the host test harness decides
    Facade,
}

impl Format {
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        [
            ("pretty", Format::Pretty),
            ("compact", Format::Compact),
            ("json", Format::Json),
            ("facade", Format::Facade),
            ("log", Format::Facade),
        ]
        .into_iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
        .map(|(_, format)| format)
    }
}

/// Runtime filter. Seeded from the environment, adjustable afterwards.
struct Filter {
    level: AtomicU8,
    debug: AtomicBool,
}

static FILTER: Filter = Filter {
    level: AtomicU8::new(Level::Warn as u8),
    debug: AtomicBool::new(false),
};

static CONFIG: Lazy<LogConfig> = Lazy::new(|| {
    let config = LogConfig::from_env();
    FILTER.level.store(config.level as u8, Ordering::SeqCst);
    FILTER.debug.store(config.debug, Ordering::SeqCst);
    config
});

thread_local! {
    static TEST_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Settings read from `TESTBED_*` variables on first use.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub debug: bool,
    pub level: Level,
    pub format: Format,
    pub color: bool,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            // Test output is noisy enough; only problems by default.
            level: Level::Warn,
            format: Format::Compact,
            color: false,
            timestamps: true,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok();
        let flag = |name: &str| var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        let defaults = Self::default();
        let debug = flag("TESTBED_DEBUG").unwrap_or(defaults.debug);
        let fallback_level = if debug { Level::Debug } else { defaults.level };

        Self {
            debug,
            level: var("TESTBED_LOG_LEVEL")
                .and_then(|s| Level::parse(&s))
                .unwrap_or(fallback_level),
            format: var("TESTBED_LOG_FORMAT")
                .and_then(|s| Format::parse(&s))
                .unwrap_or(defaults.format),
            color: flag("TESTBED_LOG_COLOR")
                .unwrap_or_else(|| var("NO_COLOR").is_none() && var("TERM").is_some()),
            timestamps: flag("TESTBED_LOG_TIMESTAMPS").unwrap_or(defaults.timestamps),
        }
    }
}

/// Read the environment now instead of on the first log statement.
pub fn init() {
    Lazy::force(&CONFIG);
}

pub fn config() -> &'static LogConfig {
    &CONFIG
}

#[inline]
pub fn is_debug_enabled() -> bool {
    Lazy::force(&CONFIG);
    FILTER.debug.load(Ordering::Relaxed)
}

#[inline]
pub fn is_level_enabled(level: Level) -> bool {
    level != Level::Off && level >= current_level()
}

pub fn current_level() -> Level {
    Lazy::force(&CONFIG);
    Level::from_index(FILTER.level.load(Ordering::Relaxed))
}

pub fn set_level(level: Level) {
    Lazy::force(&CONFIG);
    FILTER.level.store(level as u8, Ordering::SeqCst);
}

/// Debug mode also lowers the level to `Debug` if it is above it.
pub fn set_debug(enabled: bool) {
    Lazy::force(&CONFIG);
    FILTER.debug.store(enabled, Ordering::SeqCst);
    if enabled {
        FILTER
            .level
            .fetch_min(Level::Debug as u8, Ordering::SeqCst);
    }
}

/// Attach a test name to every message logged from this thread.
pub fn set_test_context(test: Option<String>) {
    TEST_NAME.with(|slot| *slot.borrow_mut() = test);
}

pub fn test_context() -> Option<String> {
    TEST_NAME.with(|slot| slot.borrow().clone())
}

/// One log line before formatting.
#[cfg_attr(feature = "json", derive(serde::Serialize))]
struct Record<'a> {
    #[cfg_attr(feature = "json", serde(skip))]
    level: Level,
    #[cfg_attr(feature = "json", serde(rename = "level"))]
    level_name: &'static str,
    target: &'a str,
    #[cfg_attr(feature = "json", serde(skip_serializing_if = "Option::is_none"))]
    test: Option<&'a str>,
    message: &'a str,
}

impl Record<'_> {
    fn render(&self, config: &LogConfig) -> String {
        let mut line = String::new();
        match config.format {
            Format::Pretty => {
                if config.timestamps {
                    line.push_str(&format!("{} ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")));
                }
                line.push_str(&self.level.label(config.color));
                line.push(' ');
                if !self.target.is_empty() {
                    line.push_str(&format!("[{}] ", self.target));
                }
            }
            Format::Compact | Format::Facade => {
                if config.timestamps && config.format == Format::Compact {
                    line.push_str(&format!("{} ", chrono::Local::now().format("%H:%M:%S")));
                }
                if config.format == Format::Compact {
                    let initial = self.level_name.chars().next().unwrap_or('?');
                    line.push_str(&format!("{} {}: ", initial, self.target));
                }
            }
            Format::Json => return self.render_json(),
        }
        if let Some(test) = self.test {
            line.push_str(&format!("<{}> ", test));
        }
        line.push_str(self.message);
        line
    }

    #[cfg(feature = "json")]
    fn render_json(&self) -> String {
        #[derive(serde::Serialize)]
        struct Stamped<'a, 'r> {
            timestamp: String,
            #[serde(flatten)]
            record: &'r Record<'a>,
        }
        let stamped = Stamped {
            timestamp: chrono::Utc::now().to_rfc3339(),
            record: self,
        };
        serde_json::to_string(&stamped).unwrap_or_else(|_| self.message.to_string())
    }

    #[cfg(not(feature = "json"))]
    fn render_json(&self) -> String {
        format!(
            r#"{{"timestamp":"{}","level":"{}","target":{:?},"test":{:?},"message":{:?}}}"#,
            chrono::Utc::now().to_rfc3339(),
            self.level_name,
            self.target,
            self.test.unwrap_or_default(),
            self.message
        )
    }
}

#[doc(hidden)]
pub fn log(level: Level, target: &str, message: &str) {
    if !is_level_enabled(level) && !(level == Level::Debug && is_debug_enabled()) {
        return;
    }

    let test = test_context();
    let record = Record {
        level,
        level_name: level.as_str(),
        target,
        test: test.as_deref(),
        message,
    };
    let config = config();

    if config.format == Format::Facade {
        if let Some(facade) = level.facade() {
            log::log!(target: target, facade, "{}", record.render(config));
        }
        return;
    }
    eprintln!("{}", record.render(config));
}

#[doc(hidden)]
#[macro_export]
macro_rules! __emit {
    ($enabled:expr, $level:ident, target: $target:expr, $($arg:tt)+) => {
        if $enabled {
            $crate::log($crate::Level::$level, $target, &format!($($arg)+));
        }
    };
    ($enabled:expr, $level:ident, $($arg:tt)+) => {
        $crate::__emit!($enabled, $level, target: module_path!(), $($arg)+)
    };
}

/// Log a trace message.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => {
        $crate::__emit!($crate::is_level_enabled($crate::Level::Trace), Trace, $($arg)+)
    };
}

/// Log a debug message.
///
/// Enabled by `TESTBED_DEBUG=1` or `TESTBED_LOG_LEVEL=debug`.
///
/// ```rust
/// use testbed_log::debug;
///
/// let environment = "PaymentsEnvironment";
/// debug!("Constructing container for {}", environment);
/// ```
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        $crate::__emit!(
            $crate::is_debug_enabled() || $crate::is_level_enabled($crate::Level::Debug),
            Debug,
            $($arg)+
        )
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {
        $crate::__emit!($crate::is_level_enabled($crate::Level::Info), Info, $($arg)+)
    };
}

/// Log a warning. Teardown failures that are reported elsewhere land here.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        $crate::__emit!($crate::is_level_enabled($crate::Level::Warn), Warn, $($arg)+)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {
        $crate::__emit!($crate::is_level_enabled($crate::Level::Error), Error, $($arg)+)
    };
}

#[cfg(feature = "tracing")]
pub mod tracing_compat {
    //! A `tracing` subscriber honouring the `TESTBED_*` level settings.

    use super::{config, current_level};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::{EnvFilter, fmt};

    /// Subscriber writing through the test harness' captured output.
    /// `RUST_LOG` wins over `TESTBED_LOG_LEVEL` when set.
    pub fn subscriber() -> impl tracing::Subscriber + Send + Sync {
        let directive = current_level().as_str().to_lowercase();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(config().color).with_test_writer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(format: Format) -> LogConfig {
        LogConfig {
            format,
            timestamps: false,
            color: false,
            ..LogConfig::default()
        }
    }

    fn record<'a>(test: Option<&'a str>) -> Record<'a> {
        Record {
            level: Level::Warn,
            level_name: Level::Warn.as_str(),
            target: "testbed::teardown",
            test,
            message: "cleanup failed",
        }
    }

    #[test]
    fn test_levels_are_ordered_by_severity() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Off);
        assert_eq!(Level::from_index(3), Level::Warn);
        assert_eq!(Level::from_index(42), Level::Off);
    }

    #[test]
    fn test_level_names() {
        assert_eq!(Level::parse("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::parse(" warning "), Some(Level::Warn));
        assert_eq!(Level::parse("none"), Some(Level::Off));
        assert_eq!(Level::parse("verbose"), None);
        assert_eq!(Level::Info.to_string(), "INFO");
    }

    #[test]
    fn test_format_names() {
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("log"), Some(Format::Facade));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn test_off_is_never_enabled() {
        assert!(!is_level_enabled(Level::Off));
    }

    #[test]
    fn test_compact_line_names_the_test() {
        let line = record(Some("checkout_flow")).render(&plain(Format::Compact));
        assert_eq!(line, "W testbed::teardown: <checkout_flow> cleanup failed");
    }

    #[test]
    fn test_pretty_line_without_test() {
        let line = record(None).render(&plain(Format::Pretty));
        assert_eq!(line, "WARN  [testbed::teardown] cleanup failed");
    }

    #[test]
    fn test_json_line_is_an_object() {
        let line = record(Some("checkout_flow")).render(&plain(Format::Json));
        assert!(line.starts_with('{') && line.ends_with('}'));
        assert!(line.contains("\"level\":\"WARN\""));
        assert!(line.contains("checkout_flow"));
    }

    #[test]
    fn test_test_context_is_per_thread() {
        set_test_context(Some("checkout_flow".to_string()));
        assert_eq!(test_context().as_deref(), Some("checkout_flow"));

        let other = std::thread::spawn(test_context).join().unwrap();
        assert_eq!(other, None);

        set_test_context(None);
        assert_eq!(test_context(), None);
    }

    #[test]
    fn test_macros_expand() {
        trace!("trace message");
        debug!("debug {}", 1);
        info!(target: "testbed::test", "info");
        warn!("warn");
        error!(target: "testbed::test", "error {}", "x");
    }
}
