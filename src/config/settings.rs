//! Key/value settings source.
//!
//! Settings come from an optional TOML file, overlaid by environment
//! variables. Nested tables flatten into dotted keys, so
//!
//! ```toml
//! [ce]
//! worker_count = 2
//! ```
//!
//! is read as `ce.worker_count`, and can be overridden by `CE_WORKER_COUNT`.

use crate::error::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
    env_overrides: bool,
}

impl Settings {
    /// Empty settings, no environment overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = content.parse()?;
        let mut values = HashMap::new();
        flatten("", &table, &mut values);
        Ok(Self {
            values,
            env_overrides: false,
        })
    }

    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Let environment variables take precedence over file values.
    pub fn with_env_overrides(mut self) -> Self {
        self.env_overrides = true;
        self
    }

    /// Set a value directly.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Raw string value for a key.
    pub fn get(&self, key: &str) -> Option<String> {
        if self.env_overrides {
            if let Ok(value) = std::env::var(env_var_name(key)) {
                return Some(value);
            }
        }
        self.values.get(key).cloned()
    }

    /// Integer value for a key. Malformed values are logged and treated as absent.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.parse(key)
    }

    /// Unsigned integer value for a key. Malformed values are logged and treated as absent.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.parse(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T>
    where
        T::Err: std::fmt::Display,
    {
        let raw = self.get(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, value = %raw, "ignoring malformed numeric setting: {e}");
                None
            }
        }
    }
}

/// Environment variable consulted for a settings key: `ce.worker_count` -> `CE_WORKER_COUNT`.
pub fn env_var_name(key: &str) -> String {
    key.replace('.', "_").to_uppercase()
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut HashMap<String, String>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Table(nested) => flatten(&key, nested, out),
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}
