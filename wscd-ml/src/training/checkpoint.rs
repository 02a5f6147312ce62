//! Checkpoint artifacts, the per-model manifest, and drift-tolerant restore.

use super::lr_policy::{LearningRatePolicy, LrPolicy, SchedulerState};
use super::metrics::ValidationResult;
use super::optimizer::{Optimizer, OptimizerState};
use crate::error::{Result, TrainError};
use crate::model::ParamStore;
use crate::tensor::TensorRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use wscd_core::persistence::{atomic_write_json, load_json_if_exists, read_json};
use wscd_core::{DatasetKind, ModelVariant, TrainConfig};

const MANIFEST_FILE: &str = "checkpoints.json";

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointTag {
    /// The validation score strictly improved.
    Best,
    Latest,
}

impl CheckpointTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Latest => "latest",
        }
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to resume or fine-tune from a validation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    #[serde(flatten)]
    pub scores: ValidationResult,
    pub model_state: BTreeMap<String, TensorRecord>,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    /// Loss accumulated in the current epoch up to the save.
    pub train_loss: f64,
}

/// One line of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub tag: CheckpointTag,
    pub epoch: u64,
    pub f_score: f64,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// How a checkpoint's weights lined up with the model they were loaded into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// In both; value taken from the checkpoint.
    pub applied: Vec<String>,
    /// Only in the model; freshly initialized value kept.
    pub left_default: Vec<String>,
    /// Only in the checkpoint; ignored.
    pub discarded: Vec<String>,
}

impl MergeReport {
    pub fn is_exact(&self) -> bool {
        self.left_default.is_empty() && self.discarded.is_empty()
    }
}

/// What a restore produced.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub epoch: u64,
    pub scores: ValidationResult,
    pub train_loss: f64,
    pub report: MergeReport,
    /// Optimizer and scheduler progress were adopted.
    pub resumed: bool,
}

/// Writes artifacts under `<save_dir>/<model>/` and keeps the manifest there.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    model: ModelVariant,
    dataset: DatasetKind,
}

impl Checkpointer {
    pub fn new(save_dir: &Path, model: ModelVariant, dataset: DatasetKind) -> Self {
        Self {
            dir: save_dir.join(model.as_str()),
            model,
            dataset,
        }
    }

    pub fn from_config(config: &TrainConfig) -> Self {
        Self::new(&config.save_dir, config.model, config.dataset)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<tag>_epoch<E>_<model>_<dataset>.json`
    pub fn artifact_path(&self, tag: CheckpointTag, epoch: u64) -> PathBuf {
        self.dir.join(format!(
            "{tag}_epoch{epoch}_{}_{}.json",
            self.model.as_str(),
            self.dataset.as_str()
        ))
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Write the artifact and record it in the manifest.
    ///
    /// A second save with the same tag and epoch overwrites the file and
    /// replaces its manifest entry.
    pub fn save(&self, tag: CheckpointTag, checkpoint: &Checkpoint) -> Result<CheckpointEntry> {
        let path = self.artifact_path(tag, checkpoint.epoch);
        atomic_write_json(&path, checkpoint)?;

        let bytes = std::fs::read(&path)?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let entry = CheckpointEntry {
            id: uuid::Uuid::new_v4().to_string(),
            tag,
            epoch: checkpoint.epoch,
            f_score: checkpoint.scores.f_score,
            path: path.clone(),
            sha256,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut entries = self.list()?;
        entries.retain(|e| e.path != path);
        entries.push(entry.clone());
        atomic_write_json(&self.manifest_path(), &entries)?;

        tracing::info!(
            tag = %tag,
            epoch = checkpoint.epoch,
            f_score = checkpoint.scores.f_score,
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(entry)
    }

    /// Manifest entries in write order; empty when nothing was saved yet.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        Ok(load_json_if_exists(&self.manifest_path())?.unwrap_or_default())
    }

    /// The entry with the highest F-score.
    pub fn best(&self) -> Result<Option<CheckpointEntry>> {
        Ok(self.list()?.into_iter().max_by(|a, b| {
            a.f_score
                .partial_cmp(&b.f_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }
}

/// Read a checkpoint record; a missing file is reported as such.
pub fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    read_json(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => {
            TrainError::not_found(format!("checkpoint {}", path.display()))
        }
        io::ErrorKind::InvalidData => TrainError::checkpoint(format!(
            "checkpoint {} is not a valid record: {err}",
            path.display()
        )),
        _ => TrainError::Io(err),
    })
}

/// Copy intersecting weights from `state` into `params`.
///
/// Shapes are checked for every intersecting name before anything is
/// written, so a mismatch leaves the model untouched.
pub fn merge_weights(
    params: &ParamStore,
    state: &BTreeMap<String, TensorRecord>,
) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    let mut updates = Vec::new();
    for (name, var) in params.iter() {
        match state.get(name) {
            Some(record) => {
                let dims = var.as_tensor().dims();
                if record.shape != dims {
                    return Err(TrainError::checkpoint(format!(
                        "checkpoint weight '{name}' has shape {:?}, model expects {dims:?}",
                        record.shape
                    )));
                }
                updates.push((var, record));
                report.applied.push(name.to_string());
            }
            None => report.left_default.push(name.to_string()),
        }
    }
    report.discarded = state
        .keys()
        .filter(|name| !params.contains(name))
        .cloned()
        .collect();

    for (var, record) in updates {
        let tensor = record.to_tensor(var.as_tensor().device())?;
        var.set(&tensor)?;
    }
    Ok(report)
}

/// Load `path` into the model, and into the optimizer and scheduler when
/// `resume` carries them.
pub fn restore(
    path: &Path,
    params: &ParamStore,
    resume: Option<(&mut Optimizer, &mut LrPolicy)>,
) -> Result<RestoreOutcome> {
    let checkpoint = read_checkpoint(path)?;
    let report = merge_weights(params, &checkpoint.model_state)?;

    let resumed = match resume {
        Some((optimizer, scheduler)) => {
            optimizer.load_state(&checkpoint.optimizer_state)?;
            scheduler.restore(&checkpoint.scheduler_state)?;
            optimizer.set_learning_rate(scheduler.current_rate());
            true
        }
        None => false,
    };

    tracing::info!(
        path = %path.display(),
        epoch = checkpoint.epoch,
        f_score = checkpoint.scores.f_score,
        applied = report.applied.len(),
        left_default = report.left_default.len(),
        discarded = report.discarded.len(),
        resumed,
        "checkpoint restored"
    );
    if !report.is_exact() {
        tracing::warn!(
            left_default = ?report.left_default,
            discarded = ?report.discarded,
            "checkpoint only partially matches the model"
        );
    }

    Ok(RestoreOutcome {
        epoch: checkpoint.epoch,
        scores: checkpoint.scores,
        train_loss: checkpoint.train_loss,
        report,
        resumed,
    })
}
