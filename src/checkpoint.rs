//! Checkpoints are a flat mapping from dotted parameter names (`encoder.layers.0.fc.weight`) to
//! dense tensors. On disk each training step gets its own `.npz` archive, this keeps them loadable
//! from numpy which is handy when comparing against a reference implementation.
//!
//! Writes go to a temporary file which is renamed into place once the archive is complete, so a
//! crash mid-save never leaves a truncated `step-N.npz` behind for `latest` to pick up.
use anyhow::Context;
use ndarray::{ArrayD, Dimension, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::{btree_map, BTreeMap};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Named collection of parameter tensors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Checkpoint {
    params: BTreeMap<String, ArrayD<f32>>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor of any dimensionality, replacing an existing entry with the same name.
    pub fn insert<D: Dimension>(&mut self, name: impl Into<String>, value: ndarray::Array<f32, D>) {
        self.params.insert(name.into(), value.into_dyn());
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.params.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<f32>> {
        self.params.iter()
    }

    /// Keep only the entries under `prefix.` and strip the prefix. Used to pull one sub-model out
    /// of a checkpoint that was saved for a larger composite model.
    pub fn sub_checkpoint(&self, prefix: &str) -> Self {
        let lead = format!("{}.", prefix);
        let params = self
            .params
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&lead).map(|k| (k.to_string(), v.clone())))
            .collect();
        Self { params }
    }

    /// Writes the checkpoint as an uncompressed npz archive.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("npz.partial");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("creating checkpoint file {}", tmp.display()))?;
            let mut npz = NpzWriter::new(BufWriter::new(file));
            for (name, value) in self.params.iter() {
                npz.add_array(name.as_str(), value)
                    .with_context(|| format!("writing parameter {}", name))?;
            }
            npz.finish().context("finalising npz archive")?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("moving checkpoint into place at {}", path.display()))?;
        info!("Saved {} parameters to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("opening checkpoint {}", path.display()))?;
        let mut npz = NpzReader::new(file).context("reading npz archive")?;
        let mut params = BTreeMap::new();
        for name in npz.names().context("listing npz entries")? {
            let name = name.trim_end_matches(".npy").to_string();
            let value = npz
                .by_name::<OwnedRepr<f32>, IxDyn>(&name)
                .with_context(|| format!("reading parameter {}", name))?;
            debug!("Loaded {} {:?}", name, value.shape());
            params.insert(name, value);
        }
        info!("Loaded {} parameters from {}", params.len(), path.display());
        Ok(Self { params })
    }
}

/// Layout of a training run output directory.
#[derive(Clone, Debug)]
pub struct OutputTree {
    pub root: PathBuf,
}

impl OutputTree {
    /// Creates `<root>/checkpoints` and `<root>/samples` if they don't already exist.
    pub fn create(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let tree = Self {
            root: root.as_ref().to_path_buf(),
        };
        fs::create_dir_all(tree.checkpoint_dir())
            .with_context(|| format!("creating {}", tree.checkpoint_dir().display()))?;
        fs::create_dir_all(tree.sample_dir())
            .with_context(|| format!("creating {}", tree.sample_dir().display()))?;
        Ok(tree)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn sample_dir(&self) -> PathBuf {
        self.root.join("samples")
    }

    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        checkpoint_path(self.checkpoint_dir(), step)
    }
}

pub fn checkpoint_path(dir: impl AsRef<Path>, step: usize) -> PathBuf {
    dir.as_ref().join(format!("step-{}.npz", step))
}

/// Extracts the step from a `step-N.npz` file name.
pub fn step_from_path(path: impl AsRef<Path>) -> Option<usize> {
    static STEP_REGEX: OnceCell<Regex> = OnceCell::new();
    let re = STEP_REGEX.get_or_init(|| Regex::new(r"^step-(\d+)\.npz$").unwrap());
    let name = path.as_ref().file_name()?.to_str()?;
    re.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Finds the checkpoint with the highest step in a directory, `None` if there are none.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> anyhow::Result<Option<(usize, PathBuf)>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if let Some(step) = step_from_path(&path) {
            if best.as_ref().map(|(s, _)| step > *s).unwrap_or(true) {
                best = Some((step, path));
            }
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = Checkpoint::new();
        ckpt.insert("encoder.fc.weight", arr2(&[[1.0, 2.0], [3.0, 4.0]]));
        ckpt.insert("encoder.fc.bias", arr1(&[0.5, -0.5]));

        let path = checkpoint_path(dir.path(), 10);
        ckpt.save(&path).unwrap();
        assert!(!path.with_extension("npz.partial").exists());

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, ckpt);

        let sub = loaded.sub_checkpoint("encoder");
        assert!(sub.contains("fc.weight"));
        assert!(sub.contains("fc.bias"));
    }

    #[test]
    fn latest_step() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(dir.path()).unwrap().is_none());

        let ckpt = Checkpoint::new();
        for step in [5, 100, 20] {
            ckpt.save(checkpoint_path(dir.path(), step)).unwrap();
        }
        fs::write(dir.path().join("step-notanumber.npz"), b"").unwrap();

        let (step, path) = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(step, 100);
        assert_eq!(step_from_path(path), Some(100));
    }
}
