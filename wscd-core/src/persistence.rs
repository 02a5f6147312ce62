//! Persistence helpers for run artifacts.
//!
//! Checkpoints and manifests are pretty-printed JSON written through a
//! `.tmp` sibling and renamed into place, so a crash mid-write never leaves a
//! truncated artifact where a previous good one used to be.

use std::io;
use std::path::Path;

/// Serialize `data` as pretty JSON and write it atomically to `path`.
///
/// Parent directories are created on demand.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, &json)
}

/// Write raw bytes atomically to `path`.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    tracing::trace!(path = %path.display(), bytes = data.len(), "artifact written");
    Ok(())
}

/// Read and deserialize a JSON artifact that must exist.
///
/// A missing file is an error here: callers that tolerate absence should
/// use [`load_json_if_exists`].
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<T> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read and deserialize a JSON artifact, returning `Ok(None)` when absent.
pub fn load_json_if_exists<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        epoch: usize,
        score: f64,
    }

    #[test]
    fn test_atomic_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("best_epoch3.json");
        let record = Record {
            epoch: 3,
            score: 0.81,
        };

        atomic_write_json(&path, &record).unwrap();
        let loaded: Record = read_json(&path).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mResNet34").join("ckpt.json");
        atomic_write_json(&path, &Record { epoch: 1, score: 0.0 }).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latest.json");
        atomic_write(&path, b"{}").unwrap();
        assert!(!dir.path().join("latest.json.tmp").exists());
    }

    #[test]
    fn test_read_json_missing_is_error() {
        let dir = TempDir::new().unwrap();
        let result: io::Result<Record> = read_json(&dir.path().join("nope.json"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_load_json_if_exists_missing() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Record> = load_json_if_exists(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_read_json_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();
        let result: io::Result<Record> = read_json(&path);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
