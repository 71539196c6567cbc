//! Application configuration shared across the service group.
//!
//! `AppConfig` is constructed once by the host application and is immutable
//! afterwards. Besides the required `ns`/`name` identity it carries arbitrary
//! extension sections (flattened JSON) that individual services read through
//! the typed [`AppConfig::extension`] loader. Parsing configuration files is
//! the host's concern, not this crate's.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Configuration error for typed extension access.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid config section '{key}': {source}")]
    InvalidSection {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Application-wide configuration.
///
/// `ns` and `name` together identify the application; the gRPC module uses
/// `{ns}.{name}` to locate its service descriptor. Unknown fields are kept in
/// `extra` so services can carry their own sections without this crate
/// knowing about them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Namespace of the service (protocol package name).
    pub ns: String,
    /// Name of the application.
    pub name: String,
    /// Listening host, if the application hosts anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Listening port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Extension sections for individual services.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AppConfig {
    pub fn new(ns: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            name: name.into(),
            host: None,
            port: None,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Attach an extension section under `key`.
    #[must_use]
    pub fn with_section(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Fully qualified application identity, `{ns}.{name}`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.ns, self.name)
    }

    /// Deserialize the extension section under `key`, if present.
    ///
    /// Missing sections are not an error (`Ok(None)`); a present but invalid
    /// section is.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidSection`] when the section exists but
    /// cannot be deserialized into `T`.
    pub fn extension<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let Some(section) = self.extra.get(key) else {
            return Ok(None);
        };
        let value: T =
            serde_json::from_value(section.clone()).map_err(|e| ConfigError::InvalidSection {
                key: key.to_owned(),
                source: e,
            })?;
        Ok(Some(value))
    }
}
