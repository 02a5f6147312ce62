//! The training state machine.
//!
//! ```text
//! RESTORE -> EPOCH_START -> BATCH_STEP* -> EPOCH_END -> EPOCH_START ...
//!                             |  PRINT / VALIDATE after each step
//!                             '-> BUDGET_STOP (mid-epoch)
//!                                          EPOCH_END -> EARLY_STOP
//! ```

use super::checkpoint::{self, Checkpoint, CheckpointTag, Checkpointer, MergeReport};
use super::early_stop::{EARLY_STOP_PATIENCE, EarlyStopping, StopDecision};
use super::loss::LossAggregator;
use super::lr_policy::{LearningRatePolicy, LrPolicy};
use super::metrics::{ConfusionMatrix, MetricsAccumulator, ValidationResult};
use super::optimizer::Optimizer;
use super::state::TrainingState;
use super::validator::Validator;
use crate::context::RunContext;
use crate::data::{BatchPlan, DataSources, collate_train, open_datasets};
use crate::error::Result;
use crate::model::{ModelMode, SegmentationModel, build_model};
use rand::rngs::StdRng;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use wscd_core::{ConfigError, TrainConfig};

/// Validation events per pass over the training set.
const VALIDATIONS_PER_EPOCH: usize = 4;

/// `floor(train_len / (batch_size * 4))`; zero is a configuration error.
pub fn validation_interval(train_len: usize, batch_size: usize) -> Result<u64> {
    let per = batch_size.saturating_mul(VALIDATIONS_PER_EPOCH);
    let interval = if per == 0 { 0 } else { train_len / per };
    if interval == 0 {
        return Err(ConfigError::invalid(
            "batch_size",
            format!(
                "{train_len} training samples with batch size {batch_size} give a validation interval of 0"
            ),
        )
        .into());
    }
    Ok(interval as u64)
}

/// Where the state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Restore,
    EpochStart,
    BatchStep,
    Validate,
    EpochEnd,
    Stopped(StopReason),
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The iteration budget was reached.
    Budget,
    /// Too many validations without improvement.
    EarlyStop,
}

/// One VALIDATE transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationEvent {
    pub iteration: u64,
    pub epoch: u64,
    pub result: ValidationResult,
    pub improved: bool,
    pub checkpoint: PathBuf,
}

/// Outcome of [`TrainingOrchestrator::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: TrainingState,
    pub stop_reason: StopReason,
    pub validation_interval: u64,
    pub validations: Vec<ValidationEvent>,
    pub merge_report: Option<MergeReport>,
}

/// Drives epochs, batches, validation cadence and termination.
pub struct TrainingOrchestrator {
    config: TrainConfig,
    model: Box<dyn SegmentationModel>,
    data: DataSources,
    loss: LossAggregator,
    optimizer: Optimizer,
    scheduler: LrPolicy,
    validator: Validator,
    checkpointer: Checkpointer,
    early_stop: EarlyStopping,
    state: TrainingState,
    plan: BatchPlan,
    validation_interval: u64,
    shuffle_rng: StdRng,
    phase: Phase,
    restored: bool,
    merge_report: Option<MergeReport>,
    validations: Vec<ValidationEvent>,
}

impl TrainingOrchestrator {
    /// Wire a run from explicit collaborators.
    pub fn new(
        config: TrainConfig,
        ctx: &RunContext,
        model: Box<dyn SegmentationModel>,
        data: DataSources,
        metrics: Box<dyn MetricsAccumulator>,
    ) -> Result<Self> {
        config.validate()?;
        let validation_interval = validation_interval(data.train.len(), config.batch_size)?;
        let plan = BatchPlan::new(data.train.len(), config.batch_size);
        if plan.batches_per_epoch() == 0 {
            return Err(
                ConfigError::invalid("batch_size", "an epoch would contain no batches").into(),
            );
        }

        let scheduler = LrPolicy::from_config(&config);
        let mut optimizer = Optimizer::from_config(&config, model.parameters())?;
        optimizer.set_learning_rate(scheduler.current_rate());

        tracing::info!(
            model = %config.model,
            dataset = %config.dataset,
            train = data.train.len(),
            val = data.val.len(),
            batches_per_epoch = plan.batches_per_epoch(),
            validation_interval,
            total_itrs = config.total_itrs,
            loss = ?config.loss,
            optimizer = ?config.optimizer,
            lr_policy = ?config.lr_policy,
            "orchestrator ready"
        );

        Ok(Self {
            loss: LossAggregator::from_config(&config),
            validator: Validator::new(metrics, config.batch_size, config.in_channels),
            checkpointer: Checkpointer::from_config(&config),
            early_stop: EarlyStopping::new(EARLY_STOP_PATIENCE, config.early_stop_reset),
            shuffle_rng: ctx.rng("shuffle"),
            config,
            model,
            data,
            optimizer,
            scheduler,
            state: TrainingState::new(),
            plan,
            validation_interval,
            phase: Phase::Restore,
            restored: false,
            merge_report: None,
            validations: Vec::new(),
        })
    }

    /// Build the reference model, datasets and confusion matrix for `config`.
    pub fn from_config(config: TrainConfig, ctx: &RunContext) -> Result<Self> {
        config.validate()?;
        let model = build_model(config.model, config.in_channels, ctx)?;
        let data = open_datasets(&config, ctx.device())?;
        let metrics = Box::new(ConfusionMatrix::new(config.num_classes));
        Self::new(config, ctx, model, data, metrics)
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn validation_interval(&self) -> u64 {
        self.validation_interval
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &LrPolicy {
        &self.scheduler
    }

    pub fn model(&self) -> &dyn SegmentationModel {
        self.model.as_ref()
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    fn transition(&mut self, phase: Phase) {
        tracing::trace!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    /// RESTORE: load the configured checkpoint, or keep fresh weights.
    ///
    /// Runs once; later calls return the first report.
    pub fn restore(&mut self) -> Result<Option<MergeReport>> {
        if self.restored {
            return Ok(self.merge_report.clone());
        }
        self.transition(Phase::Restore);
        self.restored = true;

        let Some(path) = self.config.checkpoint_path().map(PathBuf::from) else {
            tracing::info!("no checkpoint configured, training from fresh weights");
            return Ok(None);
        };

        let resume = if self.config.continue_training {
            Some((&mut self.optimizer, &mut self.scheduler))
        } else {
            None
        };
        let outcome = checkpoint::restore(&path, self.model.parameters(), resume)?;
        if outcome.resumed {
            self.state.best_score = outcome.scores.f_score;
            tracing::info!(
                best_score = self.state.best_score,
                lr = self.optimizer.learning_rate(),
                "continue-training state restored"
            );
        }
        self.merge_report = Some(outcome.report.clone());
        Ok(Some(outcome.report))
    }

    /// Train until the iteration budget or early stop.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.restore()?;
        self.model.set_mode(ModelMode::Train);
        let total_itrs = self.config.total_itrs as u64;
        let print_interval = self.config.print_interval as u64;

        let stop_reason = 'epochs: loop {
            self.transition(Phase::EpochStart);
            let epoch = self.state.begin_epoch();
            let mut epoch_loss = 0.0f64;
            let mut interval_loss = 0.0f64;
            let mut last_print = Instant::now();
            tracing::debug!(epoch, "epoch started");

            let batches = self.plan.shuffled(&mut self.shuffle_rng);
            for indices in &batches {
                self.transition(Phase::BatchStep);
                let loss = self.train_step(indices)?;
                epoch_loss += loss;
                interval_loss += loss;
                let iteration = self.state.record_iteration();

                if iteration % print_interval == 0 {
                    let mean = interval_loss / print_interval as f64;
                    let lr = self.optimizer.learning_rate();
                    self.state.record_print(mean, lr);
                    tracing::info!(
                        epoch,
                        iteration,
                        total_itrs,
                        loss = mean,
                        epoch_loss,
                        best_epoch_loss = ?self.state.best_epoch_loss,
                        lr,
                        elapsed_ms = last_print.elapsed().as_millis() as u64,
                        "training progress"
                    );
                    interval_loss = 0.0;
                    last_print = Instant::now();
                }

                if iteration % self.validation_interval == 0 {
                    self.validate(epoch_loss)?;
                }

                if iteration >= total_itrs {
                    break 'epochs StopReason::Budget;
                }
            }

            self.transition(Phase::EpochEnd);
            self.scheduler.advance();
            self.optimizer.set_learning_rate(self.scheduler.current_rate());
            self.state.finish_epoch(epoch_loss);
            tracing::info!(
                epoch,
                epoch_loss,
                lr = self.optimizer.learning_rate(),
                no_improve = self.state.no_improve_count,
                "epoch finished"
            );
            if self.early_stop.on_epoch_end(&mut self.state) == StopDecision::Stop {
                tracing::warn!(
                    epoch,
                    no_improve = self.state.no_improve_count,
                    patience = self.early_stop.patience(),
                    "early stop"
                );
                break StopReason::EarlyStop;
            }
        };

        self.transition(Phase::Stopped(stop_reason));
        tracing::info!(
            reason = ?stop_reason,
            iterations = self.state.cur_iteration,
            epochs = self.state.cur_epoch,
            best_score = self.state.best_score,
            best_epoch = ?self.state.best_epoch,
            "training stopped"
        );
        Ok(RunSummary {
            state: self.state.clone(),
            stop_reason,
            validation_interval: self.validation_interval,
            validations: self.validations.clone(),
            merge_report: self.merge_report.clone(),
        })
    }

    /// Restore and score once without training or writing anything.
    pub fn evaluate(&mut self) -> Result<ValidationResult> {
        self.restore()?;
        self.transition(Phase::Validate);
        self.model.set_mode(ModelMode::Eval);
        let result = self.validator.run(self.model.as_ref(), self.data.val.as_ref());
        self.model.set_mode(ModelMode::Train);
        let result = result?;
        tracing::info!("{}", self.validator.describe(&result));
        Ok(result)
    }

    /// BATCH_STEP: forward, loss, backward, one optimizer step.
    fn train_step(&mut self, indices: &[usize]) -> Result<f64> {
        let batch = collate_train(self.data.train.as_ref(), indices, self.config.in_channels)?;
        let output = self.model.forward(&batch.images)?;
        let loss = self.loss.compute(
            &output.primary,
            &batch.labels,
            &output.boundary,
            &batch.boundaries,
        )?;
        let mut grads = loss.total.backward()?;
        self.optimizer.step(&mut grads)?;
        let total = loss.total_value()? as f64;
        tracing::trace!(
            total,
            primary = loss.primary,
            boundary = loss.boundary,
            stat = loss.stat,
            "batch loss"
        );
        Ok(total)
    }

    /// VALIDATE: score, update selection state, save best or latest.
    fn validate(&mut self, epoch_loss: f64) -> Result<()> {
        self.transition(Phase::Validate);
        self.model.set_mode(ModelMode::Eval);
        let result = self.validator.run(self.model.as_ref(), self.data.val.as_ref())?;
        self.model.set_mode(ModelMode::Train);
        tracing::info!("{}", self.validator.describe(&result));

        let improved = self.state.record_validation(result.f_score);
        let tag = if improved {
            CheckpointTag::Best
        } else {
            CheckpointTag::Latest
        };
        let record = Checkpoint {
            epoch: self.state.cur_epoch,
            scores: result,
            model_state: self.model.parameters().state_dict()?,
            optimizer_state: self.optimizer.state()?,
            scheduler_state: self.scheduler.state(),
            train_loss: epoch_loss,
        };
        let entry = self.checkpointer.save(tag, &record)?;
        self.validations.push(ValidationEvent {
            iteration: self.state.cur_iteration,
            epoch: self.state.cur_epoch,
            result,
            improved,
            checkpoint: entry.path,
        });
        if !improved {
            tracing::debug!(
                no_improve = self.state.no_improve_count,
                best_score = self.state.best_score,
                "no improvement"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainError;

    #[test]
    fn test_interval_matches_reference_cadence() {
        assert_eq!(validation_interval(100, 4).unwrap(), 6);
        assert_eq!(validation_interval(16, 4).unwrap(), 1);
    }

    #[test]
    fn test_zero_interval_is_config_error() {
        assert!(matches!(
            validation_interval(15, 4),
            Err(TrainError::Config(ConfigError::Invalid { field: "batch_size", .. }))
        ));
        assert!(validation_interval(100, 0).is_err());
    }
}
