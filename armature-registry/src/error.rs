//! Error types for registry operations.

use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry errors.
///
/// All variants are routine, caller-recoverable conditions. None of them
/// indicate a corrupted registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No live application for `(app_id, env)`
    #[error("App not found: {app_id} ({env})")]
    AppNotFound { app_id: String, env: String },

    /// Application exists but the hostname is not registered in it
    #[error("Instance not found: {hostname} in {app_id} ({env})")]
    InstanceNotFound {
        app_id: String,
        env: String,
        hostname: String,
    },

    /// The caller's freshness token is already current
    #[error("Not fresh: since {since} >= latest {latest}")]
    NotFresh { since: i64, latest: i64 },

    /// Status mask matched none of the application's instances
    #[error("No matching instance in {app_id} ({env}) for status mask {status:#x}")]
    NoMatchingInstance {
        app_id: String,
        env: String,
        status: u32,
    },
}

impl RegistryError {
    /// Create an app-not-found error
    pub fn app_not_found(app_id: impl Into<String>, env: impl Into<String>) -> Self {
        Self::AppNotFound {
            app_id: app_id.into(),
            env: env.into(),
        }
    }

    /// Create an instance-not-found error
    pub fn instance_not_found(
        app_id: impl Into<String>,
        env: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self::InstanceNotFound {
            app_id: app_id.into(),
            env: env.into(),
            hostname: hostname.into(),
        }
    }

    /// Check if the referenced application or instance does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AppNotFound { .. } | Self::InstanceNotFound { .. })
    }

    /// Check if this is the "no changes since your last fetch" signal
    pub fn is_not_fresh(&self) -> bool {
        matches!(self, Self::NotFresh { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of its allowed range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// An environment variable could not be parsed
    #[error("Failed to parse {key}: {value}")]
    Parse { key: String, value: String },

    /// JSON deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}
