// Settings file loading

use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Formats a settings file may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileFormat::Json => "JSON",
            FileFormat::Toml => "TOML",
        }
    }
}

/// Reads a settings file into a JSON object.
#[derive(Debug, Clone, Copy)]
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Pick the format from the file extension.
    pub fn auto(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::LoadError(format!("{} has no extension", path.display())))?;

        let format = FileFormat::from_extension(ext).ok_or_else(|| {
            ConfigError::LoadError(format!("unsupported settings format: .{}", ext))
        })?;

        Ok(Self::new(format))
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn load_file(&self, path: &Path) -> Result<Value> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        self.parse(&content)
    }

    /// Parse `content`; the top level must be a table/object.
    pub fn parse(&self, content: &str) -> Result<Value> {
        let value = match self.format {
            FileFormat::Json => serde_json::from_str(content).map_err(|e| self.parse_error(e))?,
            FileFormat::Toml => {
                let table: toml::Table = toml::from_str(content).map_err(|e| self.parse_error(e))?;
                serde_json::to_value(table).map_err(|e| self.parse_error(e))?
            }
        };

        match value {
            Value::Object(_) => Ok(value),
            other => Err(ConfigError::ParseError {
                format: self.format.name(),
                message: format!("expected a table at the top level, found {}", other),
            }),
        }
    }

    fn parse_error(&self, e: impl std::fmt::Display) -> ConfigError {
        ConfigError::ParseError {
            format: self.format.name(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json() {
        let loader = ConfigLoader::new(FileFormat::Json);
        let value = loader.parse(r#"{"strict_listener": true}"#).unwrap();
        assert_eq!(value["strict_listener"], Value::Bool(true));
    }

    #[test]
    fn test_parse_toml() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let value = loader
            .parse(
                r#"
                strict_listener = true
                correlation_cookie = "suite-id"
            "#,
            )
            .unwrap();
        assert_eq!(value["correlation_cookie"], "suite-id");
    }

    #[test]
    fn test_non_table_is_rejected() {
        let loader = ConfigLoader::new(FileFormat::Json);
        let error = loader.parse("[1, 2]").unwrap_err();
        assert!(matches!(error, ConfigError::ParseError { format: "JSON", .. }));
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ConfigLoader::auto(Path::new("testbed.toml")).unwrap().format(),
            FileFormat::Toml
        );
        assert_eq!(FileFormat::from_extension("JSON"), Some(FileFormat::Json));
        assert!(ConfigLoader::auto(Path::new("testbed.yaml")).is_err());
        assert!(ConfigLoader::auto(Path::new("testbed")).is_err());
    }

    #[test]
    fn test_missing_file() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let error = loader.load_file(Path::new("/nonexistent/testbed.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::FileNotFound(_)));
    }
}
