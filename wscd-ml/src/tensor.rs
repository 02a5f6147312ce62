//! Serializable tensor snapshots.

use crate::error::{Result, TrainError};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// A dense f32 tensor flattened in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self { shape, data })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(TrainError::checkpoint(format!(
                "tensor record holds {} values but shape {:?} needs {expected}",
                self.data.len(),
                self.shape
            )));
        }
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_preserves_layout() {
        let tensor = Tensor::arange(0f32, 6f32, &Device::Cpu)
            .unwrap()
            .reshape((2, 3))
            .unwrap();
        let record = TensorRecord::from_tensor(&tensor).unwrap();
        assert_eq!(record.shape, vec![2, 3]);
        assert_eq!(record.data, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let back = record.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap()[1], vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_inconsistent_record_is_rejected() {
        let record = TensorRecord {
            shape: vec![2, 2],
            data: vec![1.0, 2.0, 3.0],
        };
        assert!(matches!(
            record.to_tensor(&Device::Cpu),
            Err(TrainError::Checkpoint(_))
        ));
    }
}
