//! # wscd-ml
//!
//! Training and validation orchestration for weakly supervised cloud
//! segmentation with an auxiliary boundary head.
//!
//! The core ([`training`]) only talks to its collaborators through traits:
//! [`model::SegmentationModel`], [`data::Dataset`] and
//! [`training::MetricsAccumulator`]. Reference implementations of each ship
//! alongside so a run can be started from a configuration file alone.

pub mod context;
pub mod data;
pub mod error;
pub mod model;
pub mod tensor;
pub mod training;

pub use context::RunContext;
pub use error::{Result, TrainError};
pub use model::{ModelMode, ModelOutput, ParamStore, SegmentationModel, build_model};
pub use training::{RunSummary, StopReason, TrainingOrchestrator, TrainingState, ValidationResult};
