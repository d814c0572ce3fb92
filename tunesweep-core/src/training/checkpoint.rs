//! Read-only inventory of persisted training checkpoints.
//!
//! Layout: `<root>/<dataset_trained_on>/<model>/version_<N>/checkpoints/*.ckpt`.
//! Versions are monotonically increasing per (model, dataset) but may have gaps.

use crate::error::CheckpointError;
use crate::setup::CheckpointRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const CHECKPOINT_EXT: &str = "ckpt";

/// A persisted checkpoint artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub model: String,
    pub dataset_trained_on: String,
    pub version: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl Checkpoint {
    fn from_file(model: &str, dataset: &str, version: u32, path: PathBuf) -> Self {
        let meta = std::fs::metadata(&path).ok();
        Self {
            model: model.to_string(),
            dataset_trained_on: dataset.to_string(),
            version,
            size_bytes: meta.as_ref().map(|m| m.len()).unwrap_or(0),
            modified: meta
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            path,
        }
    }

    pub fn reference(&self) -> CheckpointRef {
        CheckpointRef::new(&self.dataset_trained_on, self.version)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointInventory {
    root: PathBuf,
}

impl CheckpointInventory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, model: &str, dataset: &str) -> PathBuf {
        self.root.join(dataset).join(model)
    }

    fn checkpoint_dir(&self, model: &str, dataset: &str, version: u32) -> PathBuf {
        self.model_dir(model, dataset)
            .join(format!("version_{version}"))
            .join("checkpoints")
    }

    /// Resolve a checkpoint reference for `model`. When a version holds
    /// several `.ckpt` files the lexicographically first one is used.
    pub fn lookup(&self, model: &str, reference: &CheckpointRef) -> Result<Checkpoint, CheckpointError> {
        let dataset = &reference.dataset_trained_on;
        let not_found = || CheckpointError::NotFound {
            model: model.to_string(),
            dataset: dataset.clone(),
            version: reference.version,
        };

        let dir = self.checkpoint_dir(model, dataset, reference.version);
        let path = first_checkpoint_file(&dir)?.ok_or_else(not_found)?;
        Ok(Checkpoint::from_file(model, dataset, reference.version, path))
    }

    pub fn exists(&self, model: &str, reference: &CheckpointRef) -> bool {
        self.lookup(model, reference).is_ok()
    }

    /// Versions holding at least one checkpoint file, ascending.
    pub fn versions(&self, model: &str, dataset: &str) -> Result<Vec<u32>, CheckpointError> {
        let dir = self.model_dir(model, dataset);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(version) = parse_version(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if first_checkpoint_file(&entry.path().join("checkpoints"))?.is_some() {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest(&self, model: &str, dataset: &str) -> Result<Option<u32>, CheckpointError> {
        Ok(self.versions(model, dataset)?.last().copied())
    }

    /// Every checkpoint under the root, ordered by (dataset, model, version).
    pub fn scan(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut found: BTreeMap<(String, String, u32), PathBuf> = BTreeMap::new();
        for entry in WalkDir::new(&self.root).min_depth(5).max_depth(5) {
            let entry = entry.map_err(|e| CheckpointError::Io(e.into()))?;
            if !entry.file_type().is_file() || !is_checkpoint_file(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let [dataset, model, version_dir, checkpoints, _file] = parts.as_slice() else {
                continue;
            };
            let Some(version) = parse_version(version_dir) else {
                continue;
            };
            if checkpoints != "checkpoints" {
                continue;
            }

            let key = (dataset.clone(), model.clone(), version);
            let path = entry.path().to_path_buf();
            found
                .entry(key)
                .and_modify(|existing| {
                    if path < *existing {
                        *existing = path.clone();
                    }
                })
                .or_insert(path);
        }

        Ok(found
            .into_iter()
            .map(|((dataset, model, version), path)| {
                Checkpoint::from_file(&model, &dataset, version, path)
            })
            .collect())
    }
}

fn parse_version(name: &str) -> Option<u32> {
    name.strip_prefix("version_")?.parse().ok()
}

fn is_checkpoint_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == CHECKPOINT_EXT)
}

fn first_checkpoint_file(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_checkpoint_file(&path) {
            files.push(path);
        }
    }
    Ok(files.into_iter().min())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn touch(root: &Path, dataset: &str, model: &str, version: u32, file: &str) {
        let dir = root
            .join(dataset)
            .join(model)
            .join(format!("version_{version}"))
            .join("checkpoints");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), b"weights").unwrap();
    }

    #[test]
    fn test_lookup_existing() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "cifar10", "lowres_resnet9", 0, "epoch=29-step=5850.ckpt");
        let inventory = CheckpointInventory::new(dir.path());

        let ckpt = inventory
            .lookup("lowres_resnet9", &CheckpointRef::new("cifar10", 0))
            .unwrap();
        assert_eq!(ckpt.version, 0);
        assert_eq!(ckpt.size_bytes, 7);
        assert!(ckpt.path.ends_with("epoch=29-step=5850.ckpt"));
        assert_eq!(ckpt.reference(), CheckpointRef::new("cifar10", 0));
    }

    #[test]
    fn test_lookup_missing_version() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "cifar10", "lowres_resnet9", 0, "last.ckpt");
        let inventory = CheckpointInventory::new(dir.path());

        let err = inventory
            .lookup("lowres_resnet9", &CheckpointRef::new("cifar10", 99))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { version: 99, .. }));
        assert!(!inventory.exists("lowres_resnet9", &CheckpointRef::new("cifar10", 99)));
    }

    #[test]
    fn test_lexicographically_first_file_wins() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "cifar10", "lowres_resnet9", 2, "last.ckpt");
        touch(dir.path(), "cifar10", "lowres_resnet9", 2, "epoch=9.ckpt");
        touch(dir.path(), "cifar10", "lowres_resnet9", 2, "notes.txt");
        let inventory = CheckpointInventory::new(dir.path());

        let ckpt = inventory
            .lookup("lowres_resnet9", &CheckpointRef::new("cifar10", 2))
            .unwrap();
        assert!(ckpt.path.ends_with("epoch=9.ckpt"));
    }

    #[test]
    fn test_versions_may_have_gaps() {
        let dir = TempDir::new().unwrap();
        for v in [0, 3, 7] {
            touch(dir.path(), "svhn", "lowres_vgg11", v, "last.ckpt");
        }
        // An empty version directory does not count.
        std::fs::create_dir_all(dir.path().join("svhn/lowres_vgg11/version_9/checkpoints")).unwrap();
        let inventory = CheckpointInventory::new(dir.path());

        assert_eq!(inventory.versions("lowres_vgg11", "svhn").unwrap(), vec![0, 3, 7]);
        assert_eq!(inventory.latest("lowres_vgg11", "svhn").unwrap(), Some(7));
        assert_eq!(inventory.latest("lowres_vgg11", "mnist").unwrap(), None);
    }

    #[test]
    fn test_scan_lists_all_artifacts() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "cifar10", "lowres_resnet9", 0, "b.ckpt");
        touch(dir.path(), "cifar10", "lowres_resnet9", 0, "a.ckpt");
        touch(dir.path(), "cifar10", "lowres_alexnet", 1, "last.ckpt");
        touch(dir.path(), "mnist", "lowres_resnet9", 4, "last.ckpt");
        let inventory = CheckpointInventory::new(dir.path());

        let refs: Vec<(String, String, u32)> = inventory
            .scan()
            .unwrap()
            .into_iter()
            .map(|c| (c.dataset_trained_on, c.model, c.version))
            .collect();
        assert_eq!(
            refs,
            vec![
                ("cifar10".into(), "lowres_alexnet".into(), 1),
                ("cifar10".into(), "lowres_resnet9".into(), 0),
                ("mnist".into(), "lowres_resnet9".into(), 4),
            ]
        );
    }

    #[test]
    fn test_scan_missing_root() {
        let inventory = CheckpointInventory::new("/nonexistent/tunesweep/checkpoints");
        assert!(inventory.scan().unwrap().is_empty());
    }
}
