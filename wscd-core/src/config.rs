//! Run configuration for the WSCD trainer.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> CLI overrides. String identities (model, dataset, loss,
//! optimizer, LR policy) are resolved into closed enums at extract time, so
//! an unknown name fails here rather than somewhere inside a training run.

use crate::error::{ConfigError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "wscd.toml";

/// Prefix for environment overrides (`WSCD_BATCH_SIZE`, `WSCD_LR`, ...).
pub const ENV_PREFIX: &str = "WSCD_";

/// Backbone family of a model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backbone {
    ResNet34,
    ResNet50,
    Vgg16,
}

/// Boundary refinement module attached to the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Refinement {
    /// Dual boundary refinement: boundary features are fused back into the mask head.
    Dual,
    /// Single boundary refinement: the boundary head is a side output only.
    Single,
}

/// Segmentation network variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "mResNet34_PHA_DBRM")]
    ResNet34Dbrm,
    #[serde(rename = "mResNet34_PHA_BRM")]
    ResNet34Brm,
    #[serde(rename = "mResNet50_PHA_DBRM")]
    ResNet50Dbrm,
    #[serde(rename = "mResNet50_PHA_BRM")]
    ResNet50Brm,
    #[serde(rename = "VGG16_PHA_DBRM")]
    Vgg16Dbrm,
    #[serde(rename = "VGG16_PHA_BRM")]
    Vgg16Brm,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 6] = [
        ModelVariant::ResNet34Dbrm,
        ModelVariant::ResNet34Brm,
        ModelVariant::ResNet50Dbrm,
        ModelVariant::ResNet50Brm,
        ModelVariant::Vgg16Dbrm,
        ModelVariant::Vgg16Brm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::ResNet34Dbrm => "mResNet34_PHA_DBRM",
            ModelVariant::ResNet34Brm => "mResNet34_PHA_BRM",
            ModelVariant::ResNet50Dbrm => "mResNet50_PHA_DBRM",
            ModelVariant::ResNet50Brm => "mResNet50_PHA_BRM",
            ModelVariant::Vgg16Dbrm => "VGG16_PHA_DBRM",
            ModelVariant::Vgg16Brm => "VGG16_PHA_BRM",
        }
    }

    pub fn backbone(&self) -> Backbone {
        match self {
            ModelVariant::ResNet34Dbrm | ModelVariant::ResNet34Brm => Backbone::ResNet34,
            ModelVariant::ResNet50Dbrm | ModelVariant::ResNet50Brm => Backbone::ResNet50,
            ModelVariant::Vgg16Dbrm | ModelVariant::Vgg16Brm => Backbone::Vgg16,
        }
    }

    pub fn refinement(&self) -> Refinement {
        match self {
            ModelVariant::ResNet34Dbrm | ModelVariant::ResNet50Dbrm | ModelVariant::Vgg16Dbrm => {
                Refinement::Dual
            }
            _ => Refinement::Single,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ModelVariant::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown model variant '{s}'"))
    }
}

/// Dataset identities with a registered provider layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetKind {
    #[serde(rename = "gf1")]
    Gf1,
    #[serde(rename = "landsat")]
    Landsat,
    #[serde(rename = "WDCD", alias = "wdcd")]
    Wdcd,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Gf1 => "gf1",
            DatasetKind::Landsat => "landsat",
            DatasetKind::Wdcd => "WDCD",
        }
    }

    /// Whether validation data lives under a separate root.
    pub fn needs_val_root(&self) -> bool {
        !matches!(self, DatasetKind::Gf1)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gf1" => Ok(DatasetKind::Gf1),
            "landsat" => Ok(DatasetKind::Landsat),
            "wdcd" => Ok(DatasetKind::Wdcd),
            other => Err(format!("unknown dataset '{other}'")),
        }
    }
}

/// Loss combination policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[serde(alias = "PHNet_harLoss")]
    Harmonic,
    #[serde(alias = "PHNet_divLoss")]
    Divergence,
    #[serde(alias = "PHNet_ceLoss")]
    Plain,
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[serde(alias = "Adam")]
    Adam,
    #[serde(alias = "SGD")]
    Sgd,
}

/// Learning-rate policy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrPolicyKind {
    #[serde(alias = "polynomial")]
    Poly,
    Step,
}

/// When the no-improvement counter is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStopReset {
    /// Only a strictly better validation score clears the counter.
    #[default]
    OnImprovement,
    /// The counter is also cleared at every epoch end, so early stop never fires.
    Always,
}

/// Compute device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda(usize),
}

impl TryFrom<String> for DeviceSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl FromStr for DeviceSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "cpu" {
            return Ok(DeviceSpec::Cpu);
        }
        if lower == "cuda" {
            return Ok(DeviceSpec::Cuda(0));
        }
        lower
            .strip_prefix("cuda:")
            .and_then(|ordinal| ordinal.parse().ok())
            .map(DeviceSpec::Cuda)
            .ok_or_else(|| ConfigError::UnknownDevice(s.to_string()))
    }
}

impl From<DeviceSpec> for String {
    fn from(value: DeviceSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Complete configuration of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Root directory for checkpoint artifacts; a per-model subdirectory is created below it.
    pub save_dir: PathBuf,
    pub dataset: DatasetKind,
    pub data_root: PathBuf,
    /// Validation root for datasets whose test split lives elsewhere (landsat, WDCD).
    pub val_data_root: Option<PathBuf>,
    /// Directory of proposal-derived pseudo labels used as training targets.
    pub pseudo_label_root: PathBuf,
    pub model: ModelVariant,
    pub num_classes: usize,
    pub in_channels: usize,
    pub device: DeviceSpec,
    /// Restore and validate once without training.
    pub test_only: bool,
    /// Total iteration budget across the whole run.
    pub total_itrs: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// Floor for the polynomial policy.
    pub min_lr: f64,
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    pub lr_policy: LrPolicyKind,
    /// Epochs between halvings for the step policy.
    pub step_size: usize,
    pub loss: LossKind,
    pub boundary_weight: f64,
    pub divergence_weight: f64,
    /// Checkpoint to restore from; empty or absent means fresh initialization.
    pub ckpt: Option<PathBuf>,
    pub continue_training: bool,
    pub random_seed: u64,
    pub print_interval: usize,
    pub early_stop_reset: EarlyStopReset,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("./checkpoints/"),
            dataset: DatasetKind::Gf1,
            data_root: PathBuf::from("./GF1_datasets/"),
            val_data_root: None,
            pseudo_label_root: PathBuf::from("./GF1_datasets/pseudoMask/RAPL_HOT/"),
            model: ModelVariant::ResNet34Dbrm,
            num_classes: 2,
            in_channels: 4,
            device: DeviceSpec::Cpu,
            test_only: false,
            total_itrs: 200_000,
            batch_size: 4,
            lr: 1e-4,
            min_lr: 1e-6,
            weight_decay: 1e-4,
            optimizer: OptimizerKind::Sgd,
            lr_policy: LrPolicyKind::Poly,
            step_size: 1,
            loss: LossKind::Harmonic,
            boundary_weight: 1.0,
            divergence_weight: 0.1,
            ckpt: None,
            continue_training: false,
            random_seed: 1,
            print_interval: 10,
            early_stop_reset: EarlyStopReset::OnImprovement,
        }
    }
}

impl TrainConfig {
    /// The configured checkpoint, treating an empty path as unset.
    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.ckpt
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    /// Directory holding this model's artifacts.
    pub fn model_save_dir(&self) -> PathBuf {
        self.save_dir.join(self.model.as_str())
    }

    /// Root of the validation split for the configured dataset.
    pub fn validation_root(&self) -> &Path {
        match (&self.val_data_root, self.dataset.needs_val_root()) {
            (Some(root), true) => root,
            _ => &self.data_root,
        }
    }

    /// Check numeric and cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be positive"));
        }
        if self.total_itrs == 0 {
            return Err(ConfigError::invalid("total_itrs", "must be positive"));
        }
        if self.print_interval == 0 {
            return Err(ConfigError::invalid("print_interval", "must be positive"));
        }
        if self.step_size == 0 {
            return Err(ConfigError::invalid("step_size", "must be positive"));
        }
        if self.num_classes < 2 {
            return Err(ConfigError::invalid("num_classes", "must be at least 2"));
        }
        if self.in_channels == 0 {
            return Err(ConfigError::invalid("in_channels", "must be positive"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::invalid("lr", format!("{} is not a positive rate", self.lr)));
        }
        if !(self.min_lr.is_finite() && self.min_lr >= 0.0) {
            return Err(ConfigError::invalid("min_lr", "must be a non-negative number"));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(ConfigError::invalid("weight_decay", "must be a non-negative number"));
        }
        for (field, weight) in [
            ("boundary_weight", self.boundary_weight),
            ("divergence_weight", self.divergence_weight),
        ] {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(ConfigError::invalid(field, "must be a non-negative number"));
            }
        }
        if self.dataset.needs_val_root() && self.val_data_root.is_none() {
            return Err(ConfigError::MissingField {
                field: "val_data_root",
                dataset: self.dataset.to_string(),
            });
        }
        if self.test_only && self.checkpoint_path().is_none() {
            return Err(ConfigError::invalid("ckpt", "test_only requires a checkpoint"));
        }
        Ok(())
    }
}

/// Command-line overrides; only the fields that are `Some` are merged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_data_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pseudo_label_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelVariant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_itrs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ckpt: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_training: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceSpec>,
}

/// Load the run configuration.
///
/// Priority (highest to lowest):
/// 1. Explicit CLI overrides
/// 2. Environment variables (prefixed with `WSCD_`)
/// 3. The explicit config file, or `wscd.toml` in `workdir` when none is given
/// 4. Built-in defaults
///
/// An explicitly named config file that does not exist is an error.
pub fn load_config(
    config_file: Option<&Path>,
    workdir: &Path,
    overrides: &ConfigOverrides,
) -> Result<TrainConfig> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    match config_file {
        Some(path) => {
            if !path.is_file() {
                return Err(ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file {} not found", path.display()),
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            let local = workdir.join(CONFIG_FILE_NAME);
            if local.is_file() {
                figment = figment.merge(Toml::file(&local));
            }
        }
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    figment = figment.merge(Serialized::defaults(overrides));

    let config: TrainConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    tracing::debug!(
        model = %config.model,
        dataset = %config.dataset,
        batch_size = config.batch_size,
        total_itrs = config.total_itrs,
        "configuration loaded"
    );
    Ok(config)
}

/// Write the default configuration to `path`, refusing to overwrite.
pub fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    let rendered = toml::to_string_pretty(&TrainConfig::default())?;
    crate::persistence::atomic_write(path, rendered.as_bytes())?;
    Ok(())
}
