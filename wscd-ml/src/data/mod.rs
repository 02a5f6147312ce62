//! Dataset seam and batching.
//!
//! Datasets hand out single samples; [`loader`] turns them into batches in
//! a shuffled (training) or fixed (validation) order, dropping the last
//! incomplete batch.

pub mod folder;
pub mod loader;

use crate::error::Result;
use candle_core::{Device, Tensor};
use wscd_core::{DatasetKind, TrainConfig};

pub use folder::{TrainFolder, ValFolder};
pub use loader::{BatchPlan, TrainBatch, ValBatch, collate_train, collate_val};

/// One pseudo-labelled training sample.
#[derive(Debug, Clone)]
pub struct TrainSample {
    /// `(C, H, W)` image.
    pub image: Tensor,
    /// `(H, W)` pseudo mask in {0, 1}.
    pub label: Tensor,
    /// `(H, W)` boundary map in {0, 1}.
    pub boundary: Tensor,
}

/// One validation sample with exact ground truth.
#[derive(Debug, Clone)]
pub struct ValSample {
    pub image: Tensor,
    pub label: Tensor,
}

/// Random-access sample source.
pub trait Dataset: Send {
    type Item;

    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Self::Item>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset<T> {
    items: Vec<T>,
}

impl<T> InMemoryDataset<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T: Clone + Send> Dataset for InMemoryDataset<T> {
    type Item = T;

    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize) -> Result<T> {
        self.items.get(index).cloned().ok_or_else(|| {
            crate::error::TrainError::dataset(format!(
                "index {index} out of range for {} samples",
                self.items.len()
            ))
        })
    }
}

/// The training and validation sources of one run.
pub struct DataSources {
    pub train: Box<dyn Dataset<Item = TrainSample>>,
    pub val: Box<dyn Dataset<Item = ValSample>>,
}

/// Open the registered on-disk layout for the configured dataset.
pub fn open_datasets(config: &TrainConfig, device: &Device) -> Result<DataSources> {
    let train_dir = config.data_root.join("train");
    let val_dir = config.validation_root().join("trainval");
    let train = TrainFolder::open(&train_dir, &config.pseudo_label_root, device)?;
    let val = ValFolder::open(&val_dir, device)?;
    tracing::info!(
        dataset = %config.dataset,
        train = train.len(),
        val = val.len(),
        separate_val_root = matches!(config.dataset, DatasetKind::Landsat | DatasetKind::Wdcd),
        "datasets opened"
    );
    Ok(DataSources {
        train: Box::new(train),
        val: Box::new(val),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_dataset_bounds() {
        let dataset = InMemoryDataset::new(vec![1u8, 2, 3]);
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get(2).unwrap(), 3);
        assert!(dataset.get(3).is_err());
        assert!(InMemoryDataset::<u8>::new(vec![]).is_empty());
    }
}
