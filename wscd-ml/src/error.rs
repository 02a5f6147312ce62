//! Error types for the wscd-ml crate.
//!
//! Nothing in the training core retries: every variant here aborts the run.

use thiserror::Error;

/// Top-level error type for training operations.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(#[from] wscd_core::ConfigError),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Optimizer error: {0}")]
    Optimizer(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl TrainError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        Self::Contract(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn optimizer(msg: impl Into<String>) -> Self {
        Self::Optimizer(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
