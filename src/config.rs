//! Configuration management.
//!
//! Devices are configured with an ordered set of `key=value` string pairs. The same
//! key may appear more than once; lookups scan the set in order and the last
//! occurrence wins. Each driver derives its own typed configuration from a
//! [`ConfigSet`] (see `EbneuroConfig`, `OpenBciConfig`, `DummyConfig`).
//!
//! Keys understood by every driver:
//!
//! | Key | Effect |
//! |---|---|
//! | `verbosity` | log level handed to [`crate::logging`] (0 = warn .. 3 = trace) |

use crate::error::{AppResult, EegError};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

/// Key recognised by all drivers to select the log level.
pub const VERBOSITY_KEY: &str = "verbosity";

/// Ordered key/value configuration handed to the device factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSet {
    entries: Vec<(String, String)>,
}

impl ConfigSet {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `(key, value)` pairs, preserving order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse `key=value` arguments as given on a command line.
    ///
    /// A pair without `=` is stored with an empty value.
    pub fn parse_pairs<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some((key, value)) => set.push(key, value),
                None => set.push(arg, ""),
            }
        }
        set
    }

    /// Load a flat TOML table; scalar values are converted to strings.
    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        let table: toml::Table = source
            .parse()
            .map_err(|e: toml::de::Error| EegError::Configuration(e.to_string()))?;

        let mut set = Self::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(EegError::Configuration(format!(
                        "option '{key}' must be a scalar, got {}",
                        other.type_str()
                    )))
                }
            };
            set.push(key, value);
        }
        Ok(set)
    }

    /// Load a flat TOML table from a file.
    pub fn from_toml_file(path: &Path) -> AppResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Append a pair. Later pairs shadow earlier ones with the same key.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Append all pairs of `other` after the pairs of `self`.
    pub fn extend(&mut self, other: ConfigSet) {
        self.entries.extend(other.entries);
    }

    /// Look up the last value given for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a value that must be present.
    pub fn require(&self, key: &str) -> AppResult<&str> {
        self.get(key)
            .ok_or_else(|| EegError::Configuration(format!("missing required option '{key}'")))
    }

    /// Parse the value for `key`, if present.
    pub fn parse<T>(&self, key: &str) -> AppResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| EegError::invalid_option(key, value, e)),
            None => Ok(None),
        }
    }

    /// Parse the value for `key`, falling back to `default` when absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Number of stored pairs, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no pairs are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// Validates if a given string is a valid IP address.
pub fn is_valid_ip(ip: &str) -> Result<(), &'static str> {
    ip.parse::<IpAddr>().map(|_| ()).map_err(|_| "Invalid IP address")
}

/// Validates that a device path is usable.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("Device path cannot be empty");
    }
    if path.contains('\0') {
        return Err("Device path cannot contain null bytes");
    }
    Ok(())
}
