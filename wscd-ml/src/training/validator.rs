//! Inference-mode scoring over the validation set.

use super::metrics::{MetricsAccumulator, ValidationResult};
use crate::data::{BatchPlan, Dataset, ValSample, collate_val};
use crate::error::{Result, TrainError};
use crate::model::SegmentationModel;
use candle_core::Tensor;
use std::time::Instant;

/// Probability at or above which a pixel is predicted positive.
pub const THRESHOLD: f32 = 0.5;

/// Binarize probabilities: 0 iff `value < 0.5`.
pub fn threshold_predictions(values: &[f32]) -> Vec<u32> {
    values
        .iter()
        .map(|&v| if v < THRESHOLD { 0 } else { 1 })
        .collect()
}

/// Drives one validation pass through a metrics accumulator.
pub struct Validator {
    metrics: Box<dyn MetricsAccumulator>,
    batch_size: usize,
    in_channels: usize,
}

impl Validator {
    pub fn new(metrics: Box<dyn MetricsAccumulator>, batch_size: usize, in_channels: usize) -> Self {
        Self {
            metrics,
            batch_size,
            in_channels,
        }
    }

    /// Human-readable summary from the underlying accumulator.
    pub fn describe(&self, result: &ValidationResult) -> String {
        self.metrics.to_str(result)
    }

    /// Score the model over the whole validation set in index order.
    ///
    /// The accumulator is reset once at entry. Gradients are never requested
    /// here, so nothing produced by this pass reaches an optimizer.
    pub fn run(
        &mut self,
        model: &dyn SegmentationModel,
        dataset: &dyn Dataset<Item = ValSample>,
    ) -> Result<ValidationResult> {
        let started = Instant::now();
        self.metrics.reset();
        let plan = BatchPlan::new(dataset.len(), self.batch_size);
        let batches = plan.sequential();
        for indices in &batches {
            let batch = collate_val(dataset, indices, self.in_channels)?;
            let output = model.forward(&batch.images)?;
            let probs = squeeze_primary(&output.primary)?;
            if probs.dims() != batch.labels.dims() {
                return Err(TrainError::contract(format!(
                    "prediction shape {:?} does not match target shape {:?}",
                    probs.dims(),
                    batch.labels.dims()
                )));
            }
            let predictions = threshold_predictions(&probs.flatten_all()?.to_vec1::<f32>()?);
            let targets: Vec<u32> = batch
                .labels
                .flatten_all()?
                .to_vec1::<f32>()?
                .into_iter()
                .map(|v| v.round().max(0.0) as u32)
                .collect();
            self.metrics.update(&targets, &predictions)?;
        }
        let result = self.metrics.results();
        tracing::info!(
            batches = batches.len(),
            f_score = result.f_score,
            precision = result.precision,
            recall = result.recall,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "validation pass finished"
        );
        Ok(result)
    }
}

/// `(B, 1, H, W)` becomes `(B, H, W)`; any other rank is compared as is.
fn squeeze_primary(primary: &Tensor) -> Result<Tensor> {
    match primary.dims() {
        [_, 1, _, _] => Ok(primary.squeeze(1)?),
        _ => Ok(primary.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryDataset;
    use crate::model::{ModelMode, ModelOutput, ParamStore};
    use crate::training::metrics::ConfusionMatrix;
    use candle_core::Device;
    use wscd_core::ModelVariant;

    /// Echoes channel 0 of the input as the probability map.
    struct Echo {
        params: ParamStore,
        out_channels: usize,
    }

    impl SegmentationModel for Echo {
        fn variant(&self) -> ModelVariant {
            ModelVariant::ResNet34Dbrm
        }

        fn forward(&self, images: &Tensor) -> Result<ModelOutput> {
            let primary = images.narrow(1, 0, 1)?;
            let primary = if self.out_channels == 1 {
                primary
            } else {
                primary.repeat((1, self.out_channels, 1, 1))?
            };
            let boundary = images.narrow(1, 0, 1)?.repeat((1, 2, 1, 1))?;
            Ok(ModelOutput { primary, boundary })
        }

        fn parameters(&self) -> &ParamStore {
            &self.params
        }

        fn set_mode(&mut self, _mode: ModelMode) {}

        fn mode(&self) -> ModelMode {
            ModelMode::Eval
        }
    }

    fn sample(probs: [f32; 4], label: [f32; 4]) -> ValSample {
        let dev = Device::Cpu;
        ValSample {
            image: Tensor::from_slice(&probs, (1, 2, 2), &dev).unwrap(),
            label: Tensor::from_slice(&label, (2, 2), &dev).unwrap(),
        }
    }

    fn echo(out_channels: usize) -> Echo {
        Echo {
            params: ParamStore::new(),
            out_channels,
        }
    }

    #[test]
    fn test_threshold_boundary_values() {
        assert_eq!(threshold_predictions(&[0.3, 0.7, 0.49, 0.51]), vec![0, 1, 0, 1]);
        assert_eq!(threshold_predictions(&[0.5]), vec![1]);
    }

    #[test]
    fn test_run_scores_whole_set() {
        let dataset = InMemoryDataset::new(vec![
            sample([0.9, 0.1, 0.8, 0.2], [1.0, 0.0, 1.0, 1.0]),
            sample([0.6, 0.7, 0.1, 0.1], [1.0, 0.0, 0.0, 0.0]),
        ]);
        let mut validator = Validator::new(Box::new(ConfusionMatrix::new(2)), 1, 1);
        let result = validator.run(&echo(1), &dataset).unwrap();
        // TP=3, FP=1, FN=1
        assert!((result.precision - 0.75).abs() < 1e-12);
        assert!((result.recall - 0.75).abs() < 1e-12);
        assert!((result.f_score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_runs_reset_counts() {
        let dataset = InMemoryDataset::new(vec![sample([0.9, 0.1, 0.1, 0.1], [1.0, 0.0, 0.0, 0.0])]);
        let mut validator = Validator::new(Box::new(ConfusionMatrix::new(2)), 1, 1);
        let first = validator.run(&echo(1), &dataset).unwrap();
        let second = validator.run(&echo(1), &dataset).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.f_score, 1.0);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let dataset = InMemoryDataset::new(vec![sample([0.9, 0.1, 0.1, 0.1], [1.0, 0.0, 0.0, 0.0])]);
        let mut validator = Validator::new(Box::new(ConfusionMatrix::new(2)), 1, 1);
        assert!(matches!(
            validator.run(&echo(2), &dataset),
            Err(TrainError::Contract(_))
        ));
    }

    #[test]
    fn test_empty_validation_set_scores_zero() {
        let dataset: InMemoryDataset<ValSample> = InMemoryDataset::new(vec![]);
        let mut validator = Validator::new(Box::new(ConfusionMatrix::new(2)), 4, 1);
        let result = validator.run(&echo(1), &dataset).unwrap();
        assert_eq!(result, ValidationResult::default());
    }
}
