//! Validation metrics: the accumulator seam and a confusion-matrix implementation.

use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};

/// Scores of one validation pass for the positive (cloud) class.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(rename = "F_score")]
    pub f_score: f64,
    #[serde(rename = "Precision")]
    pub precision: f64,
    #[serde(rename = "Recall")]
    pub recall: f64,
}

impl ValidationResult {
    /// Build from precision and recall, deriving their harmonic mean.
    pub fn from_precision_recall(precision: f64, recall: f64) -> Self {
        Self {
            f_score: f_score(precision, recall),
            precision,
            recall,
        }
    }
}

/// Harmonic mean of precision and recall; 0 when both are 0.
pub fn f_score(precision: f64, recall: f64) -> f64 {
    let denom = precision + recall;
    if denom > 0.0 {
        2.0 * precision * recall / denom
    } else {
        0.0
    }
}

/// Running tally fed with flattened (target, prediction) label pairs.
pub trait MetricsAccumulator: Send {
    fn reset(&mut self);

    fn update(&mut self, targets: &[u32], predictions: &[u32]) -> Result<()>;

    fn results(&self) -> ValidationResult;

    fn to_str(&self, result: &ValidationResult) -> String {
        format!(
            "F_score: {:.6}\nPrecision: {:.6}\nRecall: {:.6}",
            result.f_score, result.precision, result.recall
        )
    }
}

/// Dense `num_classes x num_classes` confusion matrix, rows = target.
///
/// Class 1 is the positive class. Targets outside `[0, num_classes)` are
/// ignored (void pixels).
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    pub fn count(&self, target: usize, prediction: usize) -> u64 {
        self.counts[target * self.num_classes + prediction]
    }

    pub fn true_positives(&self) -> u64 {
        self.count(1, 1)
    }

    pub fn false_positives(&self) -> u64 {
        (0..self.num_classes)
            .filter(|&t| t != 1)
            .map(|t| self.count(t, 1))
            .sum()
    }

    pub fn false_negatives(&self) -> u64 {
        (0..self.num_classes)
            .filter(|&p| p != 1)
            .map(|p| self.count(1, p))
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let correct: u64 = (0..self.num_classes).map(|c| self.count(c, c)).sum();
        correct as f64 / total as f64
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

impl MetricsAccumulator for ConfusionMatrix {
    fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    fn update(&mut self, targets: &[u32], predictions: &[u32]) -> Result<()> {
        if targets.len() != predictions.len() {
            return Err(TrainError::contract(format!(
                "confusion update with {} targets and {} predictions",
                targets.len(),
                predictions.len()
            )));
        }
        for (&target, &prediction) in targets.iter().zip(predictions) {
            let (t, p) = (target as usize, prediction as usize);
            if t >= self.num_classes {
                continue;
            }
            if p >= self.num_classes {
                return Err(TrainError::contract(format!(
                    "prediction {p} outside {} classes",
                    self.num_classes
                )));
            }
            self.counts[t * self.num_classes + p] += 1;
        }
        Ok(())
    }

    fn results(&self) -> ValidationResult {
        let tp = self.true_positives();
        let precision = ratio(tp, tp + self.false_positives());
        let recall = ratio(tp, tp + self.false_negatives());
        ValidationResult::from_precision_recall(precision, recall)
    }

    fn to_str(&self, result: &ValidationResult) -> String {
        format!(
            "F_score: {:.6}\nPrecision: {:.6}\nRecall: {:.6}\nOverall Acc: {:.6}\nTP/FP/FN: {}/{}/{}",
            result.f_score,
            result.precision,
            result.recall,
            self.accuracy(),
            self.true_positives(),
            self.false_positives(),
            self.false_negatives(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_scores() {
        let mut cm = ConfusionMatrix::new(2);
        // TP=2, FP=1, FN=1, TN=1
        cm.update(&[1, 1, 0, 1, 0], &[1, 1, 1, 0, 0]).unwrap();
        let r = cm.results();
        assert!((r.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((r.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((r.f_score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_all_zero_scores() {
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&[0, 0], &[0, 0]).unwrap();
        assert_eq!(cm.results(), ValidationResult::default());
    }

    #[test]
    fn test_void_targets_are_ignored() {
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&[255, 1], &[1, 1]).unwrap();
        assert_eq!(cm.total(), 1);
        assert_eq!(cm.true_positives(), 1);
    }

    #[test]
    fn test_length_mismatch_is_contract_violation() {
        let mut cm = ConfusionMatrix::new(2);
        assert!(matches!(
            cm.update(&[1, 0], &[1]),
            Err(TrainError::Contract(_))
        ));
    }

    #[test]
    fn test_reset_clears_counts() {
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&[1], &[1]).unwrap();
        cm.reset();
        assert_eq!(cm.total(), 0);
    }

    #[test]
    fn test_result_serializes_with_reference_keys() {
        let json = serde_json::to_value(ValidationResult::from_precision_recall(0.5, 1.0)).unwrap();
        assert!(json.get("F_score").is_some());
        assert!(json.get("Precision").is_some());
        assert!(json.get("Recall").is_some());
    }

    #[test]
    fn test_to_str_mentions_all_scores() {
        let cm = ConfusionMatrix::new(2);
        let text = cm.to_str(&ValidationResult::from_precision_recall(0.5, 0.5));
        assert!(text.contains("F_score: 0.500000"));
        assert!(text.contains("Recall"));
    }
}
