//! Engine configuration
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (rules.toml)
//! - Environment variables (RULES__*)
//!
//! ## Example config file (rules.toml):
//! ```toml
//! [limits]
//! stage_timeout_ms = 2000
//! max_content_bytes = 8388608
//! max_reference_depth = 16
//! max_nesting_depth = 96
//! ```
//!
//! Rule levels are *not* part of this file: they are supplied per request as
//! a [`crate::rules::RuleSettingsSource`].

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the rule engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Resource limits applied to every request
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Per-request resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Deadline for each stage; unset means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_ms: Option<u64>,

    /// Content larger than this is refused before parsing
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,

    /// Maximum hops followed when resolving transitive references
    #[serde(default = "default_max_reference_depth")]
    pub max_reference_depth: usize,

    /// Maximum structural nesting walked by validators and checkers
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
}

fn default_max_content_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_reference_depth() -> usize {
    16
}

fn default_max_nesting_depth() -> usize {
    96
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: None,
            max_content_bytes: default_max_content_bytes(),
            max_reference_depth: default_max_reference_depth(),
            max_nesting_depth: default_max_nesting_depth(),
        }
    }
}

impl LimitsConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }
}

impl EngineConfig {
    /// Builder-style stage deadline
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.limits.stage_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_content_bytes(mut self, max: usize) -> Self {
        self.limits.max_content_bytes = max;
        self
    }

    pub fn with_max_nesting_depth(mut self, max: usize) -> Self {
        self.limits.max_nesting_depth = max;
        self
    }

    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = [
            "rules.toml",
            ".rules.toml",
            "config/rules.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "registry-rules") {
            let xdg_config = config_dir.config_dir().join("rules.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // RULES__LIMITS__STAGE_TIMEOUT_MS=500
        builder = builder.add_source(
            Environment::with_prefix("RULES")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}
