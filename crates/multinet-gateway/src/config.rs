//! Multinet configuration
//!
//! Loaded from TOML. Every section is optional; missing keys take the
//! defaults below.
//!
//! ```toml
//! [routing]
//! default_backend = "ado"
//!
//! [routing.routes]
//! "simple.cdev" = "cdev"
//! "web.status" = "http"
//!
//! [requests]
//! default_ppm_user = 1
//! timestamp = true
//! grouping = "individual"
//! immediate = false
//!
//! [dispatch]
//! thread_name = "multinet-dispatch"
//! failure_channel_capacity = 64
//! ```

use std::collections::HashMap;
use std::path::Path;

use multinet_core::{BackendRef, MultinetError, PpmUser, Result, StaticDirectory};
use serde::{Deserialize, Serialize};

use crate::subscription::Grouping;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultinetConfig {
    /// Device → backend routing table
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Defaults applied to requests that leave an option unset
    #[serde(default)]
    pub requests: RequestDefaults,
    /// Dispatch loop settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Explicit device id → backend name routes
    #[serde(default)]
    pub routes: HashMap<String, BackendRef>,
    /// Backend for devices without an explicit route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<BackendRef>,
}

impl RoutingConfig {
    /// Directory answering lookups from this table
    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::from_routes(self.routes.clone(), self.default_backend.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDefaults {
    /// PPM user used when a request does not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ppm_user: Option<i64>,
    #[serde(default = "default_true")]
    pub timestamp: bool,
    #[serde(default)]
    pub grouping: Grouping,
    #[serde(default)]
    pub immediate: bool,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            default_ppm_user: None,
            timestamp: true,
            grouping: Grouping::default(),
            immediate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Name of the OS thread running user callbacks
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Buffered callback failure reports per receiver
    #[serde(default = "default_failure_capacity")]
    pub failure_channel_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            failure_channel_capacity: default_failure_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_thread_name() -> String {
    "multinet-dispatch".to_string()
}

fn default_failure_capacity() -> usize {
    64
}

impl MultinetConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MultinetError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MultinetError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.requests.default_ppm_user {
            PpmUser::new(n).map_err(|e| {
                MultinetError::Config(format!("requests.default_ppm_user: {}", e))
            })?;
        }
        for (device, backend) in &self.routing.routes {
            if device.trim().is_empty() {
                return Err(MultinetError::Config(
                    "routing.routes contains an empty device id".to_string(),
                ));
            }
            if backend.as_str().trim().is_empty() {
                return Err(MultinetError::Config(format!(
                    "routing.routes.{} names an empty backend",
                    device
                )));
            }
        }
        if self.dispatch.thread_name.trim().is_empty() {
            return Err(MultinetError::Config(
                "dispatch.thread_name must not be empty".to_string(),
            ));
        }
        if self.dispatch.failure_channel_capacity == 0 {
            return Err(MultinetError::Config(
                "dispatch.failure_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Validated default PPM user, if one is configured
    pub fn default_ppm_user(&self) -> Result<Option<PpmUser>> {
        self.requests.default_ppm_user.map(PpmUser::new).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = MultinetConfig::from_toml_str("").unwrap();
        assert!(config.routing.routes.is_empty());
        assert!(config.requests.timestamp);
        assert!(!config.requests.immediate);
        assert_eq!(config.requests.grouping, Grouping::Individual);
        assert_eq!(config.dispatch.thread_name, "multinet-dispatch");
        assert_eq!(config.dispatch.failure_channel_capacity, 64);
    }

    #[test]
    fn full_document() {
        let config = MultinetConfig::from_toml_str(
            r#"
            [routing]
            default_backend = "ado"

            [routing.routes]
            "simple.cdev" = "cdev"

            [requests]
            default_ppm_user = 2
            timestamp = false
            grouping = "parameter"
            immediate = true
            "#,
        )
        .unwrap();
        assert_eq!(
            config.routing.routes.get("simple.cdev"),
            Some(&BackendRef::new("cdev"))
        );
        assert_eq!(config.routing.default_backend, Some(BackendRef::new("ado")));
        assert_eq!(config.default_ppm_user().unwrap().map(PpmUser::get), Some(2));
        assert_eq!(config.requests.grouping, Grouping::Parameter);
        assert!(config.requests.immediate);
        assert!(!config.requests.timestamp);
    }

    #[test]
    fn out_of_range_ppm_user_is_rejected() {
        let err = MultinetConfig::from_toml_str("[requests]\ndefault_ppm_user = 9").unwrap_err();
        assert!(matches!(err, MultinetError::Config(_)));
    }

    #[test]
    fn unknown_grouping_is_rejected() {
        let err = MultinetConfig::from_toml_str("[requests]\ngrouping = \"device\"").unwrap_err();
        assert!(matches!(err, MultinetError::Config(_)));
    }

    #[test]
    fn zero_failure_capacity_is_rejected() {
        let err = MultinetConfig::from_toml_str("[dispatch]\nfailure_channel_capacity = 0")
            .unwrap_err();
        assert!(matches!(err, MultinetError::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[routing]\ndefault_backend = \"http\"").unwrap();
        let config = MultinetConfig::load(file.path()).unwrap();
        assert_eq!(config.routing.default_backend, Some(BackendRef::new("http")));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = MultinetConfig::load("/nonexistent/multinet.toml").unwrap_err();
        assert!(matches!(err, MultinetError::Config(_)));
    }
}
