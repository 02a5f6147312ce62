//! Error types for the WSCD core crate.

use std::path::PathBuf;

/// Errors raised while loading or validating a run configuration.
///
/// Every variant is fatal: configuration is resolved once, before any
/// training state exists.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("'{field}' is required when dataset is {dataset}")]
    MissingField {
        field: &'static str,
        dataset: String,
    },

    #[error("unknown device '{0}', expected 'cpu' or 'cuda:<ordinal>'")]
    UnknownDevice(String),

    #[error("configuration file already exists at {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Convenience result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
