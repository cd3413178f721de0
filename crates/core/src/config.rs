//! Harness configuration
//!
//! Resolution order: built-in defaults, then an optional TOML file named by
//! `BCICHECK_CONFIG`, then individual environment overrides. The result is
//! validated before use.
//!
//! ```toml
//! runtime = "podman"
//! exec_timeout_secs = 600
//! stop_timeout_secs = 5
//! registry = "registry.suse.com/bci"
//! keep_images = false
//! ```

use crate::docker::CliRuntime;
use crate::errors::{ConfigError, Result};
use crate::runtime::{RuntimeFactory, RuntimeKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

/// Environment variable naming a TOML config file
pub const CONFIG_ENV: &str = "BCICHECK_CONFIG";

/// Default registry prefix for base images
pub const DEFAULT_REGISTRY: &str = "registry.suse.com/bci";

/// Default grace period passed to the runtime's stop
pub const DEFAULT_STOP_TIMEOUT_SECS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Container runtime; falls back to `BCICHECK_RUNTIME`, then docker
    pub runtime: Option<RuntimeKind>,
    /// Custom path of the runtime binary
    pub runtime_path: Option<String>,
    /// Default timeout for container commands; `None` waits indefinitely
    pub exec_timeout_secs: Option<u64>,
    /// Grace period before the runtime kills a stopping container
    pub stop_timeout_secs: u32,
    /// Registry prefix that image names are resolved against
    pub registry: String,
    /// Keep derived images after the suite finishes
    pub keep_images: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            runtime_path: None,
            exec_timeout_secs: None,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            registry: DEFAULT_REGISTRY.to_string(),
            keep_images: false,
        }
    }
}

impl HarnessConfig {
    /// Load defaults, the `BCICHECK_CONFIG` file if set, and env overrides
    #[instrument]
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        debug!("Resolved harness configuration: {:?}", config);
        Ok(config)
    }

    /// Read a TOML config file (no env overrides, no validation)
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            debug!("Failed to read configuration file: {}", e);
            ConfigError::Io(e)
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ConfigError::Parsing {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Apply `BCICHECK_*` environment variables on top of the current values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_value("BCICHECK_RUNTIME") {
            let kind = value.parse::<RuntimeKind>().map_err(|e| ConfigError::Validation {
                message: format!("BCICHECK_RUNTIME: {}", e),
            })?;
            self.runtime = Some(kind);
        }
        if let Some(value) = env_value("BCICHECK_RUNTIME_PATH") {
            self.runtime_path = Some(value);
        }
        if let Some(value) = env_value("BCICHECK_EXEC_TIMEOUT_SECS") {
            self.exec_timeout_secs = Some(parse_number("BCICHECK_EXEC_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = env_value("BCICHECK_STOP_TIMEOUT_SECS") {
            self.stop_timeout_secs = parse_number("BCICHECK_STOP_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = env_value("BCICHECK_REGISTRY") {
            self.registry = value;
        }
        if let Some(value) = env_value("BCICHECK_KEEP_IMAGES") {
            self.keep_images = parse_bool("BCICHECK_KEEP_IMAGES", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> Result<()> {
            Err(ConfigError::Validation {
                message: message.to_string(),
            }
            .into())
        };

        if self.registry.trim().trim_end_matches('/').is_empty() {
            return invalid("registry cannot be empty");
        }
        if self.exec_timeout_secs == Some(0) {
            return invalid("exec_timeout_secs must be greater than 0");
        }
        if self.stop_timeout_secs == 0 {
            return invalid("stop_timeout_secs must be greater than 0");
        }
        if matches!(self.runtime_path.as_deref(), Some(path) if path.trim().is_empty()) {
            return invalid("runtime_path cannot be empty");
        }
        Ok(())
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout_secs.map(Duration::from_secs)
    }

    /// Registry prefix without a trailing slash
    pub fn registry(&self) -> &str {
        self.registry.trim().trim_end_matches('/')
    }

    /// Effective runtime kind
    pub fn runtime_kind(&self) -> RuntimeKind {
        RuntimeFactory::detect_runtime(self.runtime)
    }

    /// CLI runtime described by this configuration
    pub fn create_runtime(&self) -> CliRuntime {
        RuntimeFactory::create_runtime(self.runtime_kind(), self.runtime_path.as_deref())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        ConfigError::Validation {
            message: format!("{} must be a non-negative integer, got '{}'", name, value),
        }
        .into()
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Validation {
            message: format!("{} must be a boolean, got '{}'", name, value),
        }
        .into()),
    }
}
