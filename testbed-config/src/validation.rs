// Settings validation

use crate::{ConfigError, Result};

/// Implemented by settings that can check themselves after loading.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// A cookie name must be a non-empty HTTP token.
pub fn cookie_name(value: &str, field: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "cannot be empty"));
    }
    let separators = "()<>@,;:\\\"/[]?={} \t";
    if let Some(bad) = value
        .chars()
        .find(|c| !c.is_ascii() || c.is_ascii_control() || separators.contains(*c))
    {
        return Err(ConfigError::invalid(
            field,
            format!("{:?} is not allowed in a cookie name", bad),
        ));
    }
    Ok(())
}

/// `value` must be one of `allowed`, compared case-insensitively.
pub fn one_of(value: &str, allowed: &[&str], field: &'static str) -> Result<()> {
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{:?} is not one of {}", value, allowed.join(", ")),
        ))
    }
}
