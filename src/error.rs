//! Error types for the rule engine
//!
//! Rule violations are not errors. A request whose content fails validity or
//! compatibility returns [`crate::Verdict::Rejected`]; the variants here mean
//! the request could not be evaluated at all.

use thiserror::Error;

use crate::executor::Stage;

/// Result type for rule engine operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule engine errors
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource exhausted during {stage}: {reason}")]
    ResourceExhausted { stage: Stage, reason: String },

    #[error("Reference lookup failed for '{coordinate}': {reason}")]
    LookupFailed { coordinate: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Config error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

impl RuleError {
    /// Whether the caller could reasonably retry with relaxed limits
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, RuleError::ResourceExhausted { .. })
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
