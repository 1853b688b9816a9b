use std::time::Duration;
use thiserror::Error;

/// Result type for admission-control operations
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Errors that can occur in the admission-control layer
#[derive(Error, Debug)]
pub enum GatekeeperError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatekeeperError {
    /// Whether this error means the shared backend could not answer.
    ///
    /// The admission middleware fails open on exactly these.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            GatekeeperError::Redis(_)
                | GatekeeperError::StoreUnavailable(_)
                | GatekeeperError::StoreTimeout(_)
        )
    }
}
