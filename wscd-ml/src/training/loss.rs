//! Loss aggregation for the mask and boundary heads.
//!
//! Three policies share one entry point. Each returns a differentiable
//! `total` plus scalar diagnostics; the diagnostics are read off the graph
//! and never participate in backward, so a NaN `stat` cannot block a step.

use crate::error::{Result, TrainError};
use candle_core::Tensor;
use wscd_core::{LossKind, TrainConfig};

const PROB_EPS: f32 = 1e-7;
const HARMONIC_EPS: f64 = 1e-8;
const LABEL_SMOOTHING: f64 = 0.1;

/// Per-batch loss with its diagnostic terms.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Scalar that feeds the gradient.
    pub total: Tensor,
    pub primary: f32,
    pub boundary: f32,
    /// Spread of the per-pixel primary (or divergence) term.
    pub stat: f32,
}

impl LossBreakdown {
    pub fn total_value(&self) -> Result<f32> {
        Ok(self.total.to_scalar::<f32>()?)
    }
}

/// Combines the supervised mask term with the boundary term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossAggregator {
    kind: LossKind,
    boundary_weight: f64,
    divergence_weight: f64,
}

impl LossAggregator {
    pub fn new(kind: LossKind, boundary_weight: f64, divergence_weight: f64) -> Self {
        Self {
            kind,
            boundary_weight,
            divergence_weight,
        }
    }

    pub fn from_config(config: &TrainConfig) -> Self {
        Self::new(config.loss, config.boundary_weight, config.divergence_weight)
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// Score one batch.
    ///
    /// * `primary_output`: `(B, 1, H, W)` probabilities
    /// * `primary_target`: `(B, H, W)` pseudo mask
    /// * `boundary_output`: `(B, 2, H, W)` logits
    /// * `boundary_target`: `(B, H, W)` boundary map
    pub fn compute(
        &self,
        primary_output: &Tensor,
        primary_target: &Tensor,
        boundary_output: &Tensor,
        boundary_target: &Tensor,
    ) -> Result<LossBreakdown> {
        let probs = squeeze_channel(primary_output, "primary output")?;
        expect_same_shape(&probs, primary_target, "primary output", "primary target")?;
        let (batch, classes, height, width) = boundary_output.dims4().map_err(|_| {
            TrainError::contract(format!(
                "boundary output must be (B, 2, H, W), got {:?}",
                boundary_output.dims()
            ))
        })?;
        if classes != 2 || boundary_target.dims() != [batch, height, width] {
            return Err(TrainError::contract(format!(
                "boundary output {:?} does not match boundary target {:?}",
                boundary_output.dims(),
                boundary_target.dims()
            )));
        }

        let probs = probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
        let bce_map = binary_cross_entropy(&probs, primary_target)?;
        let primary = bce_map.mean_all()?;
        let boundary = balanced_boundary_loss(boundary_output, boundary_target)?;

        let (total, stat) = match self.kind {
            LossKind::Harmonic => {
                let num = primary.mul(&boundary)?.affine(2.0, 0.0)?;
                let den = primary.add(&boundary)?.affine(1.0, HARMONIC_EPS)?;
                (num.div(&den)?, std_dev(&bce_map)?)
            }
            LossKind::Divergence => {
                let kl_map = smoothed_kl(&probs, primary_target)?;
                let total = primary
                    .add(&boundary.affine(self.boundary_weight, 0.0)?)?
                    .add(&kl_map.mean_all()?.affine(self.divergence_weight, 0.0)?)?;
                (total, std_dev(&kl_map)?)
            }
            LossKind::Plain => {
                let total = primary.add(&boundary.affine(self.boundary_weight, 0.0)?)?;
                (total, std_dev(&bce_map)?)
            }
        };

        Ok(LossBreakdown {
            total,
            primary: primary.to_scalar::<f32>()?,
            boundary: boundary.to_scalar::<f32>()?,
            stat,
        })
    }
}

/// Drop the singleton channel of a `(B, 1, H, W)` map.
pub(crate) fn squeeze_channel(map: &Tensor, what: &str) -> Result<Tensor> {
    match map.dims() {
        [_, 1, _, _] => Ok(map.squeeze(1)?),
        [_, _, _] => Ok(map.clone()),
        dims => Err(TrainError::contract(format!(
            "{what} must be (B, 1, H, W), got {dims:?}"
        ))),
    }
}

fn expect_same_shape(a: &Tensor, b: &Tensor, a_name: &str, b_name: &str) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(TrainError::contract(format!(
            "{a_name} {:?} does not match {b_name} {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}

/// Per-pixel `-(t ln p + (1 - t) ln(1 - p))`.
fn binary_cross_entropy(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let log_p = probs.log()?;
    let log_not_p = probs.affine(-1.0, 1.0)?.log()?;
    let not_t = target.affine(-1.0, 1.0)?;
    Ok(target.mul(&log_p)?.add(&not_t.mul(&log_not_p)?)?.neg()?)
}

/// Class-balanced cross-entropy on the boundary logits.
///
/// Edge pixels are rare, so each class is weighted by the other's frequency.
/// A map with a single class falls back to equal weights.
fn balanced_boundary_loss(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, 1)?;
    let log_bg = log_probs.narrow(1, 0, 1)?.squeeze(1)?;
    let log_edge = log_probs.narrow(1, 1, 1)?.squeeze(1)?;

    let total = target.elem_count() as f64;
    let positives = target.sum_all()?.to_scalar::<f32>()? as f64;
    let negatives = total - positives;
    let (w_edge, w_bg) = if positives <= 0.0 || negatives <= 0.0 {
        (0.5, 0.5)
    } else {
        (negatives / total, positives / total)
    };

    let edge_term = target.mul(&log_edge)?.affine(w_edge, 0.0)?;
    let bg_term = target
        .affine(-1.0, 1.0)?
        .mul(&log_bg)?
        .affine(w_bg, 0.0)?;
    Ok(edge_term.add(&bg_term)?.neg()?.mean_all()?)
}

/// Per-pixel binary KL from the label-smoothed target to the prediction.
fn smoothed_kl(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let smooth = target.affine(1.0 - LABEL_SMOOTHING, LABEL_SMOOTHING / 2.0)?;
    let not_smooth = smooth.affine(-1.0, 1.0)?;
    let pos = smooth.mul(&smooth.log()?.sub(&probs.log()?)?)?;
    let neg = not_smooth.mul(&not_smooth.log()?.sub(&probs.affine(-1.0, 1.0)?.log()?)?)?;
    Ok(pos.add(&neg)?)
}

/// Population standard deviation of every element, read off the graph.
fn std_dev(map: &Tensor) -> Result<f32> {
    let values = map.flatten_all()?.to_vec1::<f32>()?;
    if values.is_empty() {
        return Ok(f32::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    Ok(var.sqrt() as f32)
}
