//! Model seam: the trait the training core drives, plus the parameter store
//! checkpoints read from and merge into.

pub mod phanet;

use crate::context::RunContext;
use crate::error::{Result, TrainError};
use crate::tensor::TensorRecord;
use candle_core::{Tensor, Var};
use std::collections::BTreeMap;
use wscd_core::ModelVariant;

pub use phanet::PhaNet;

/// Whether the model is being optimized or evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

/// The two heads of a boundary-refined segmentation network.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Mask probabilities, `(B, 1, H, W)`.
    pub primary: Tensor,
    /// Boundary logits, `(B, 2, H, W)`.
    pub boundary: Tensor,
}

/// A segmentation network with an auxiliary boundary head.
pub trait SegmentationModel: Send {
    fn variant(&self) -> ModelVariant;

    fn forward(&self, images: &Tensor) -> Result<ModelOutput>;

    /// Named trainable parameters. Setting a `Var` updates the model in place.
    fn parameters(&self) -> &ParamStore;

    fn set_mode(&mut self, mode: ModelMode);

    fn mode(&self) -> ModelMode;
}

/// Build the reference network for a variant.
pub fn build_model(
    variant: ModelVariant,
    in_channels: usize,
    ctx: &RunContext,
) -> Result<Box<dyn SegmentationModel>> {
    let model = PhaNet::new(variant, in_channels, ctx)?;
    tracing::info!(
        model = %variant,
        in_channels,
        parameters = model.parameters().len(),
        scalars = model.parameters().scalar_count(),
        "model constructed"
    );
    Ok(Box::new(model))
}

/// Name-ordered collection of trainable variables.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    vars: BTreeMap<String, Var>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variable; duplicate names are a construction bug.
    pub fn insert(&mut self, name: impl Into<String>, var: Var) -> Result<()> {
        let name = name.into();
        if self.vars.contains_key(&name) {
            return Err(TrainError::model(format!("duplicate parameter '{name}'")));
        }
        self.vars.insert(name, var);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.vars.iter().map(|(name, var)| (name.as_str(), var))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total number of scalar weights.
    pub fn scalar_count(&self) -> usize {
        self.vars.values().map(|v| v.as_tensor().elem_count()).sum()
    }

    /// Snapshot every parameter.
    pub fn state_dict(&self) -> Result<BTreeMap<String, TensorRecord>> {
        self.vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), TensorRecord::from_tensor(var.as_tensor())?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_param_store_rejects_duplicates() {
        let mut store = ParamStore::new();
        store.insert("head.weight", var(&[1.0])).unwrap();
        assert!(store.insert("head.weight", var(&[2.0])).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_state_dict_is_name_ordered() {
        let mut store = ParamStore::new();
        store.insert("b", var(&[1.0, 2.0])).unwrap();
        store.insert("a", var(&[3.0])).unwrap();
        let state = store.state_dict().unwrap();
        let names: Vec<_> = state.keys().cloned().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(state["b"].data, vec![1.0, 2.0]);
        assert_eq!(store.scalar_count(), 3);
    }
}
