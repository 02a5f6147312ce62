//! Adam and momentum SGD over named parameters with checkpointable state.

use crate::error::{Result, TrainError};
use crate::model::ParamStore;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wscd_core::{OptimizerKind, TrainConfig};

pub const SGD_MOMENTUM: f64 = 0.9;
pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.999;
pub const ADAM_EPSILON: f64 = 1e-8;

/// Serialized optimizer progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: u64,
    pub learning_rate: f64,
    pub slots: BTreeMap<String, SlotState>,
}

/// Moment buffers of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    pub shape: Vec<usize>,
    /// Momentum buffer (SGD) or first moment (Adam).
    pub first_moment: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_moment: Option<Vec<f32>>,
}

#[derive(Debug)]
struct Slot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

/// Updates the model's variables in place from a gradient store.
#[derive(Debug)]
pub struct Optimizer {
    kind: OptimizerKind,
    learning_rate: f64,
    weight_decay: f64,
    step: u64,
    slots: Vec<Slot>,
}

impl Optimizer {
    pub fn new(
        kind: OptimizerKind,
        params: &ParamStore,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        if params.is_empty() {
            return Err(TrainError::optimizer("optimizer requires at least one parameter"));
        }
        let mut slots = Vec::with_capacity(params.len());
        for (name, var) in params.iter() {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainError::optimizer(format!(
                    "parameter '{name}' is {:?}, expected f32",
                    tensor.dtype()
                )));
            }
            slots.push(Slot {
                name: name.to_string(),
                param: var.clone(),
                first_moment: tensor.zeros_like()?,
                second_moment: tensor.zeros_like()?,
            });
        }
        Ok(Self {
            kind,
            learning_rate,
            weight_decay,
            step: 0,
            slots,
        })
    }

    pub fn from_config(config: &TrainConfig, params: &ParamStore) -> Result<Self> {
        Self::new(config.optimizer, params, config.lr, config.weight_decay)
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Apply one update from `grads`; parameters without a gradient are left alone.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        self.step += 1;
        let bias1 = 1.0 - ADAM_BETA1.powi(self.step.min(i32::MAX as u64) as i32);
        let bias2 = 1.0 - ADAM_BETA2.powi(self.step.min(i32::MAX as u64) as i32);

        for slot in &mut self.slots {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            // Buffers must not hold on to this step's graph.
            let grad = grad.detach();
            let param = slot.param.as_tensor().detach();
            let grad = if self.weight_decay != 0.0 {
                grad.add(&param.affine(self.weight_decay, 0.0)?)?
            } else {
                grad
            };

            let next = match self.kind {
                OptimizerKind::Sgd => {
                    let buf = slot.first_moment.affine(SGD_MOMENTUM, 0.0)?.add(&grad)?;
                    let next = param.sub(&buf.affine(self.learning_rate, 0.0)?)?;
                    slot.first_moment = buf.detach();
                    next
                }
                OptimizerKind::Adam => {
                    let m = slot
                        .first_moment
                        .affine(ADAM_BETA1, 0.0)?
                        .add(&grad.affine(1.0 - ADAM_BETA1, 0.0)?)?;
                    let v = slot
                        .second_moment
                        .affine(ADAM_BETA2, 0.0)?
                        .add(&grad.sqr()?.affine(1.0 - ADAM_BETA2, 0.0)?)?;
                    let m_hat = m.affine(1.0 / bias1, 0.0)?;
                    let denom = v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, ADAM_EPSILON)?;
                    let update = m_hat.div(&denom)?.affine(self.learning_rate, 0.0)?;
                    let next = param.sub(&update)?;
                    slot.first_moment = m.detach();
                    slot.second_moment = v.detach();
                    next
                }
            };
            slot.param.set(&next)?;
        }
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState> {
        let mut slots = BTreeMap::new();
        for slot in &self.slots {
            let second_moment = match self.kind {
                OptimizerKind::Adam => Some(slot.second_moment.flatten_all()?.to_vec1::<f32>()?),
                OptimizerKind::Sgd => None,
            };
            slots.insert(
                slot.name.clone(),
                SlotState {
                    shape: slot.param.as_tensor().dims().to_vec(),
                    first_moment: slot.first_moment.flatten_all()?.to_vec1::<f32>()?,
                    second_moment,
                },
            );
        }
        Ok(OptimizerState {
            kind: self.kind,
            step: self.step,
            learning_rate: self.learning_rate,
            slots,
        })
    }

    /// Adopt saved moment buffers by parameter name.
    ///
    /// Parameters without saved state keep zeroed buffers and saved entries
    /// for unknown parameters are skipped, matching the weight merge. The
    /// learning rate is not restored; the scheduler owns it.
    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        if state.kind != self.kind {
            return Err(TrainError::checkpoint(format!(
                "optimizer state is for {:?}, run is configured with {:?}",
                state.kind, self.kind
            )));
        }
        let mut restored = 0usize;
        for slot in &mut self.slots {
            let Some(saved) = state.slots.get(&slot.name) else {
                continue;
            };
            let dims = slot.param.as_tensor().dims().to_vec();
            if saved.shape != dims {
                return Err(TrainError::checkpoint(format!(
                    "optimizer state for '{}' has shape {:?}, parameter is {:?}",
                    slot.name, saved.shape, dims
                )));
            }
            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_slice(&saved.first_moment, dims.as_slice(), &device)?;
            if let Some(second) = &saved.second_moment {
                slot.second_moment = Tensor::from_slice(second, dims.as_slice(), &device)?;
            }
            restored += 1;
        }
        self.step = state.step;
        tracing::debug!(
            restored,
            saved = state.slots.len(),
            step = self.step,
            "optimizer state loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn store(value: f32) -> ParamStore {
        let mut store = ParamStore::new();
        store
            .insert("w", Var::from_slice(&[value], 1, &Device::Cpu).unwrap())
            .unwrap();
        store
    }

    fn value(store: &ParamStore) -> f32 {
        store.get("w").unwrap().as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    /// One step on `loss = w^2`.
    fn step(opt: &mut Optimizer, store: &ParamStore) {
        let loss = store.get("w").unwrap().as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        opt.step(&mut grads).unwrap();
    }

    #[test]
    fn test_sgd_momentum_updates() {
        let params = store(1.0);
        let mut opt = Optimizer::new(OptimizerKind::Sgd, &params, 0.1, 0.0).unwrap();
        step(&mut opt, &params);
        assert!((value(&params) - 0.8).abs() < 1e-6);
        step(&mut opt, &params);
        // buf = 0.9 * 2.0 + 1.6
        assert!((value(&params) - 0.46).abs() < 1e-6);
        assert_eq!(opt.steps(), 2);
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let params = store(1.0);
        let mut opt = Optimizer::new(OptimizerKind::Adam, &params, 0.1, 0.0).unwrap();
        step(&mut opt, &params);
        assert!((value(&params) - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_weight_decay_adds_to_gradient() {
        let params = store(1.0);
        let mut opt = Optimizer::new(OptimizerKind::Sgd, &params, 0.1, 0.5).unwrap();
        step(&mut opt, &params);
        // grad = 2.0 + 0.5 * 1.0
        assert!((value(&params) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_state_round_trip_continues_identically() {
        let a = store(1.0);
        let mut opt_a = Optimizer::new(OptimizerKind::Adam, &a, 0.1, 0.0).unwrap();
        step(&mut opt_a, &a);
        let state = opt_a.state().unwrap();

        let b = store(value(&a));
        let mut opt_b = Optimizer::new(OptimizerKind::Adam, &b, 0.1, 0.0).unwrap();
        opt_b.load_state(&state).unwrap();
        assert_eq!(opt_b.steps(), 1);

        step(&mut opt_a, &a);
        step(&mut opt_b, &b);
        assert!((value(&a) - value(&b)).abs() < 1e-7);
    }

    #[test]
    fn test_load_state_rejects_other_family() {
        let params = store(1.0);
        let sgd = Optimizer::new(OptimizerKind::Sgd, &params, 0.1, 0.0).unwrap();
        let mut adam = Optimizer::new(OptimizerKind::Adam, &params, 0.1, 0.0).unwrap();
        assert!(matches!(
            adam.load_state(&sgd.state().unwrap()),
            Err(TrainError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_load_state_skips_unknown_slots() {
        let params = store(1.0);
        let mut opt = Optimizer::new(OptimizerKind::Sgd, &params, 0.1, 0.0).unwrap();
        let mut state = opt.state().unwrap();
        state.slots.insert(
            "gone".into(),
            SlotState {
                shape: vec![3],
                first_moment: vec![0.0; 3],
                second_moment: None,
            },
        );
        state.step = 7;
        opt.load_state(&state).unwrap();
        assert_eq!(opt.steps(), 7);
    }

    #[test]
    fn test_moment_buffers_are_detached_from_graph() {
        for (kind, weight_decay) in [
            (OptimizerKind::Sgd, 0.0),
            (OptimizerKind::Sgd, 1e-4),
            (OptimizerKind::Adam, 0.0),
            (OptimizerKind::Adam, 1e-4),
        ] {
            let params = store(1.0);
            let mut opt = Optimizer::new(kind, &params, 0.01, weight_decay).unwrap();
            for _ in 0..5 {
                step(&mut opt, &params);
            }
            let w = params.get("w").unwrap().as_tensor();
            for buffer in [&opt.slots[0].first_moment, &opt.slots[0].second_moment] {
                let grads = buffer.sum_all().unwrap().backward().unwrap();
                assert!(grads.get(w).is_none(), "{kind:?} wd={weight_decay}");
            }
        }
    }

    #[test]
    fn test_empty_store_is_rejected() {
        assert!(Optimizer::new(OptimizerKind::Sgd, &ParamStore::new(), 0.1, 0.0).is_err());
    }
}
