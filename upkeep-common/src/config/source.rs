//! Source tracking for configuration values.
//!
//! Every value produced by [`EnvParser`](super::EnvParser) or the global
//! configuration loader remembers where it came from, which makes
//! `upkeep-wkr --verbose` output explain surprising settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a configuration value originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// A TOML configuration file.
    File(PathBuf),
    /// An `UPKEEP_*` environment variable.
    Environment,
    /// A command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File(path) => write!(f, "file ({})", path.display()),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A value paired with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// The environment variable that supplied the value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var.into()),
        }
    }

    pub fn from_file(value: T, path: impl Into<PathBuf>) -> Self {
        Self {
            value,
            source: ConfigSource::File(path.into()),
            env_var: None,
        }
    }

    /// True when the value was explicitly set rather than defaulted.
    pub fn is_overridden(&self) -> bool {
        self.source != ConfigSource::Default
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sourced_default_is_not_overridden() {
        let v = Sourced::default_value(5u32);
        assert_eq!(v.source, ConfigSource::Default);
        assert!(!v.is_overridden());
        assert!(v.env_var.is_none());
    }

    #[test]
    fn test_sourced_env_records_var() {
        let v = Sourced::from_env(true, "UPKEEP_DRY_RUN");
        assert!(v.is_overridden());
        assert_eq!(v.env_var.as_deref(), Some("UPKEEP_DRY_RUN"));
        assert!(v.into_inner());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Default.to_string(), "default");
        assert_eq!(
            ConfigSource::File(PathBuf::from("/etc/upkeep.toml")).to_string(),
            "file (/etc/upkeep.toml)"
        );
    }
}
