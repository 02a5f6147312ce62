//! One-file-per-sample datasets stored as safetensors.
//!
//! Training files carry `image` and `boundary`; the pseudo label `label`
//! lives in a file with the same stem under the pseudo-label root.
//! Validation files carry `image` and `label`. Files are visited in name
//! order.

use super::{Dataset, TrainSample, ValSample};
use crate::error::{Result, TrainError};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "safetensors";

fn list_samples(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(TrainError::dataset(format!(
            "sample directory {} does not exist",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn load_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    candle_core::safetensors::load(path, device).map_err(|e| {
        TrainError::dataset(format!("failed to read {}: {e}", path.display()))
    })
}

fn take(tensors: &mut HashMap<String, Tensor>, key: &str, path: &Path) -> Result<Tensor> {
    let tensor = tensors.remove(key).ok_or_else(|| {
        TrainError::dataset(format!("{} has no '{key}' tensor", path.display()))
    })?;
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Pseudo-labelled training samples.
pub struct TrainFolder {
    files: Vec<PathBuf>,
    pseudo_label_root: PathBuf,
    device: Device,
}

impl TrainFolder {
    pub fn open(dir: &Path, pseudo_label_root: &Path, device: &Device) -> Result<Self> {
        let files = list_samples(dir)?;
        if !pseudo_label_root.is_dir() {
            return Err(TrainError::dataset(format!(
                "pseudo label directory {} does not exist",
                pseudo_label_root.display()
            )));
        }
        Ok(Self {
            files,
            pseudo_label_root: pseudo_label_root.to_path_buf(),
            device: device.clone(),
        })
    }
}

impl Dataset for TrainFolder {
    type Item = TrainSample;

    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<TrainSample> {
        let path = self
            .files
            .get(index)
            .ok_or_else(|| TrainError::dataset(format!("no training sample {index}")))?;
        let mut tensors = load_file(path, &self.device)?;
        let image = take(&mut tensors, "image", path)?;
        let boundary = take(&mut tensors, "boundary", path)?;

        let file_name = path.file_name().unwrap_or_default();
        let label_path = self.pseudo_label_root.join(file_name);
        let mut label_tensors = load_file(&label_path, &self.device)?;
        let label = take(&mut label_tensors, "label", &label_path)?;

        Ok(TrainSample {
            image,
            label,
            boundary,
        })
    }
}

/// Ground-truth validation samples.
pub struct ValFolder {
    files: Vec<PathBuf>,
    device: Device,
}

impl ValFolder {
    pub fn open(dir: &Path, device: &Device) -> Result<Self> {
        Ok(Self {
            files: list_samples(dir)?,
            device: device.clone(),
        })
    }
}

impl Dataset for ValFolder {
    type Item = ValSample;

    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<ValSample> {
        let path = self
            .files
            .get(index)
            .ok_or_else(|| TrainError::dataset(format!("no validation sample {index}")))?;
        let mut tensors = load_file(path, &self.device)?;
        Ok(ValSample {
            image: take(&mut tensors, "image", path)?,
            label: take(&mut tensors, "label", path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn save(path: &Path, entries: &[(&str, Tensor)]) {
        let map: HashMap<String, Tensor> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        candle_core::safetensors::save(&map, path).unwrap();
    }

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_train_folder_joins_pseudo_labels() {
        let dir = TempDir::new().unwrap();
        let train = dir.path().join("train");
        let pseudo = dir.path().join("pseudo");
        std::fs::create_dir_all(&train).unwrap();
        std::fs::create_dir_all(&pseudo).unwrap();
        for stem in ["b", "a"] {
            save(
                &train.join(format!("{stem}.safetensors")),
                &[("image", zeros(&[4, 2, 2])), ("boundary", zeros(&[2, 2]))],
            );
            save(
                &pseudo.join(format!("{stem}.safetensors")),
                &[("label", zeros(&[2, 2]))],
            );
        }
        std::fs::write(train.join("notes.txt"), "ignored").unwrap();

        let folder = TrainFolder::open(&train, &pseudo, &Device::Cpu).unwrap();
        assert_eq!(folder.len(), 2);
        assert!(folder.files[0].ends_with("a.safetensors"));
        let sample = folder.get(1).unwrap();
        assert_eq!(sample.image.dims(), &[4, 2, 2]);
        assert_eq!(sample.label.dims(), &[2, 2]);
    }

    #[test]
    fn test_missing_pseudo_label_is_dataset_error() {
        let dir = TempDir::new().unwrap();
        let train = dir.path().join("train");
        let pseudo = dir.path().join("pseudo");
        std::fs::create_dir_all(&train).unwrap();
        std::fs::create_dir_all(&pseudo).unwrap();
        save(
            &train.join("a.safetensors"),
            &[("image", zeros(&[4, 2, 2])), ("boundary", zeros(&[2, 2]))],
        );
        let folder = TrainFolder::open(&train, &pseudo, &Device::Cpu).unwrap();
        assert!(matches!(folder.get(0), Err(TrainError::Dataset(_))));
    }

    #[test]
    fn test_val_folder_requires_label() {
        let dir = TempDir::new().unwrap();
        save(&dir.path().join("x.safetensors"), &[("image", zeros(&[4, 2, 2]))]);
        let folder = ValFolder::open(dir.path(), &Device::Cpu).unwrap();
        assert!(matches!(folder.get(0), Err(TrainError::Dataset(_))));
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        assert!(ValFolder::open(&dir.path().join("absent"), &Device::Cpu).is_err());
    }
}
