//! Batch ordering and collation.

use super::{Dataset, TrainSample, ValSample};
use crate::error::{Result, TrainError};
use candle_core::{DType, Tensor};
use rand::Rng;
use rand::seq::SliceRandom;

/// A stacked training batch.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    /// `(B, C, H, W)`
    pub images: Tensor,
    /// `(B, H, W)`
    pub labels: Tensor,
    /// `(B, H, W)`
    pub boundaries: Tensor,
}

/// A stacked validation batch.
#[derive(Debug, Clone)]
pub struct ValBatch {
    pub images: Tensor,
    pub labels: Tensor,
}

/// Index layout of one pass over a dataset with `drop_last` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    len: usize,
    batch_size: usize,
}

impl BatchPlan {
    pub fn new(len: usize, batch_size: usize) -> Self {
        Self { len, batch_size }
    }

    /// Full batches per pass; the remainder is dropped.
    pub fn batches_per_epoch(&self) -> usize {
        if self.batch_size == 0 {
            0
        } else {
            self.len / self.batch_size
        }
    }

    /// Fixed order `[0, 1, 2, ...]` split into batches.
    pub fn sequential(&self) -> Vec<Vec<usize>> {
        let order: Vec<usize> = (0..self.len).collect();
        self.chunk(&order)
    }

    /// A fresh permutation split into batches.
    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len).collect();
        order.shuffle(rng);
        self.chunk(&order)
    }

    fn chunk(&self, order: &[usize]) -> Vec<Vec<usize>> {
        if self.batch_size == 0 {
            return Vec::new();
        }
        order
            .chunks_exact(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}

fn check_image(image: &Tensor, in_channels: usize, index: usize) -> Result<(usize, usize)> {
    let (channels, height, width) = image.dims3().map_err(|_| {
        TrainError::contract(format!(
            "sample {index}: image must be (C, H, W), got {:?}",
            image.dims()
        ))
    })?;
    if channels != in_channels {
        return Err(TrainError::contract(format!(
            "sample {index}: image has {channels} channels, configured in_channels is {in_channels}"
        )));
    }
    Ok((height, width))
}

fn check_map(map: &Tensor, what: &str, hw: (usize, usize), index: usize) -> Result<()> {
    if map.dims() != [hw.0, hw.1] {
        return Err(TrainError::contract(format!(
            "sample {index}: {what} shape {:?} does not match image size {hw:?}",
            map.dims()
        )));
    }
    Ok(())
}

/// Load and stack the training samples at `indices`.
pub fn collate_train(
    dataset: &dyn Dataset<Item = TrainSample>,
    indices: &[usize],
    in_channels: usize,
) -> Result<TrainBatch> {
    let mut images = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    let mut boundaries = Vec::with_capacity(indices.len());
    for &index in indices {
        let sample = dataset.get(index)?;
        let hw = check_image(&sample.image, in_channels, index)?;
        check_map(&sample.label, "label", hw, index)?;
        check_map(&sample.boundary, "boundary", hw, index)?;
        images.push(sample.image.to_dtype(DType::F32)?);
        labels.push(sample.label.to_dtype(DType::F32)?);
        boundaries.push(sample.boundary.to_dtype(DType::F32)?);
    }
    Ok(TrainBatch {
        images: Tensor::stack(&images, 0)?,
        labels: Tensor::stack(&labels, 0)?,
        boundaries: Tensor::stack(&boundaries, 0)?,
    })
}

/// Load and stack the validation samples at `indices`.
pub fn collate_val(
    dataset: &dyn Dataset<Item = ValSample>,
    indices: &[usize],
    in_channels: usize,
) -> Result<ValBatch> {
    let mut images = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for &index in indices {
        let sample = dataset.get(index)?;
        let hw = check_image(&sample.image, in_channels, index)?;
        check_map(&sample.label, "label", hw, index)?;
        images.push(sample.image.to_dtype(DType::F32)?);
        labels.push(sample.label.to_dtype(DType::F32)?);
    }
    Ok(ValBatch {
        images: Tensor::stack(&images, 0)?,
        labels: Tensor::stack(&labels, 0)?,
    })
}
