//! Training core: loss, learning-rate policy, optimizer, checkpoints,
//! validation, early stopping and the orchestrating state machine.

pub mod checkpoint;
pub mod early_stop;
pub mod loss;
pub mod lr_policy;
pub mod metrics;
pub mod optimizer;
pub mod orchestrator;
pub mod state;
pub mod validator;

pub use checkpoint::{
    Checkpoint, CheckpointEntry, CheckpointTag, Checkpointer, MergeReport, RestoreOutcome,
    merge_weights, read_checkpoint,
};
pub use early_stop::{EARLY_STOP_PATIENCE, EarlyStopping, StopDecision};
pub use loss::{LossAggregator, LossBreakdown};
pub use lr_policy::{LearningRatePolicy, LrPolicy, PolyLr, SchedulerState, StepLr};
pub use metrics::{ConfusionMatrix, MetricsAccumulator, ValidationResult};
pub use optimizer::{Optimizer, OptimizerState};
pub use orchestrator::{
    Phase, RunSummary, StopReason, TrainingOrchestrator, ValidationEvent, validation_interval,
};
pub use state::TrainingState;
pub use validator::{Validator, threshold_predictions};
