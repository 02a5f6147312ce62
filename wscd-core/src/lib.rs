//! # WSCD Core
//!
//! Configuration, error types and persistence helpers shared by the
//! training library and the command-line front end.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    Backbone, ConfigOverrides, DatasetKind, DeviceSpec, EarlyStopReset, LossKind, LrPolicyKind,
    ModelVariant, OptimizerKind, Refinement, TrainConfig, load_config, write_default_config,
};
pub use error::{ConfigError, Result};
