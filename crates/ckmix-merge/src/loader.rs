//! Lazy checkpoint reading for memory-efficient merging.
//!
//! [`CheckpointReader`] memory-maps a safetensors file and indexes its header
//! once. Tensor bytes are only touched when a tensor is requested, so a
//! multi-gigabyte checkpoint costs little more than its header until the
//! accumulator walks it key by key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use safetensors::{Dtype, SafeTensors};
use tracing::debug;

use crate::tensor::{decode, TensorEntry, TensorMap};
use crate::{MergeError, Result};

/// Number of sample keys reported by [`ModelInfo`].
const SAMPLE_KEYS: usize = 5;

/// Source of named tensors.
pub trait TensorLoader: Send + Sync {
    /// All tensor names, in the order the source declares them.
    fn keys(&self) -> &[String];

    /// Whether the source holds `key`.
    fn contains(&self, key: &str) -> bool;

    /// Load a tensor by name.
    fn get(&self, key: &str) -> Result<TensorEntry>;

    /// Get the shape of a tensor without loading it.
    fn shape(&self, key: &str) -> Result<Vec<usize>>;

    /// Get the dtype of a tensor without loading it.
    fn dtype(&self, key: &str) -> Result<Dtype>;

    /// Load a tensor decoded to `f64`.
    fn values(&self, key: &str) -> Result<Vec<f64>> {
        self.get(key)?.to_f64()
    }
}

/// Location of a tensor within a memory-mapped file.
#[derive(Debug, Clone)]
struct TensorLocation {
    /// Byte offset from the start of the file.
    offset: usize,
    /// Length in bytes.
    len: usize,
    dtype: Dtype,
    shape: Vec<usize>,
}

/// Memory-mapped reader for a single safetensors checkpoint.
#[derive(Debug)]
pub struct CheckpointReader {
    path: PathBuf,
    mmap: memmap2::Mmap,
    /// Tensor names sorted by data offset.
    keys: Vec<String>,
    index: HashMap<String, TensorLocation>,
    /// Free-form `__metadata__` from the header.
    metadata: HashMap<String, String>,
}

impl CheckpointReader {
    /// Open and index a checkpoint.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_progress(path, usize::MAX, |_, _| {})
    }

    /// Open a checkpoint, calling `progress(indexed, total)` every `interval`
    /// tensors and once more when indexing finishes.
    pub fn open_with_progress(
        path: impl AsRef<Path>,
        interval: usize,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(MergeError::NotFound { path });
        }

        debug!("Memory-mapping {:?}", path);
        let file = std::fs::File::open(&path).map_err(|e| MergeError::io(&path, e))?;
        // SAFETY: The file is opened read-only and the map lives as long as
        // this reader. Concurrent truncation by another process is outside
        // what the tool guards against.
        #[allow(unsafe_code)]
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| MergeError::io(&path, e))?;

        let (keys, index, metadata) = {
            let tensors = SafeTensors::deserialize(&mmap)
                .map_err(|e| MergeError::format(&path, e.to_string()))?;
            let (_, header) = SafeTensors::read_metadata(&mmap)
                .map_err(|e| MergeError::format(&path, e.to_string()))?;
            let metadata = header.metadata().clone().unwrap_or_default();

            let base_ptr = mmap.as_ptr() as usize;
            let views = tensors.tensors();
            let total = views.len();
            let interval = interval.max(1);

            let mut index = HashMap::with_capacity(total);
            for (done, (name, view)) in views.into_iter().enumerate() {
                let data = view.data();
                let offset = data.as_ptr() as usize - base_ptr;

                index.insert(
                    name,
                    TensorLocation {
                        offset,
                        len: data.len(),
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                    },
                );

                if (done + 1) % interval == 0 {
                    progress(done + 1, total);
                }
            }
            if total % interval != 0 || total == 0 {
                progress(total, total);
            }

            let mut keys: Vec<String> = index.keys().cloned().collect();
            keys.sort_by(|a, b| {
                let (la, lb) = (&index[a], &index[b]);
                (la.offset, la.len, a).cmp(&(lb.offset, lb.len, b))
            });

            (keys, index, metadata)
        };

        debug!("Indexed {} tensors from {:?}", keys.len(), path);

        Ok(Self {
            path,
            mmap,
            keys,
            index,
            metadata,
        })
    }

    /// Get the checkpoint path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Header `__metadata__` entries.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the checkpoint holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Summarize the checkpoint without reading tensor data.
    pub fn info(&self) -> ModelInfo {
        let mut dtypes: Vec<(Dtype, usize)> = Vec::new();
        for loc in self.keys.iter().map(|k| &self.index[k]) {
            match dtypes.iter_mut().find(|(d, _)| *d == loc.dtype) {
                Some((_, count)) => *count += 1,
                None => dtypes.push((loc.dtype, 1)),
            }
        }

        ModelInfo {
            path: self.path.clone(),
            tensor_count: self.keys.len(),
            sample_keys: self.keys.iter().take(SAMPLE_KEYS).cloned().collect(),
            parameter_count: self
                .index
                .values()
                .map(|loc| loc.shape.iter().product::<usize>() as u64)
                .sum(),
            file_size_bytes: self.file_size(),
            dtypes,
        }
    }

    fn location(&self, key: &str) -> Result<&TensorLocation> {
        self.index.get(key).ok_or_else(|| MergeError::KeyMissing {
            key: key.to_string(),
        })
    }

    fn bytes(&self, loc: &TensorLocation) -> &[u8] {
        &self.mmap[loc.offset..loc.offset + loc.len]
    }
}

impl TensorLoader for CheckpointReader {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    fn get(&self, key: &str) -> Result<TensorEntry> {
        let loc = self.location(key)?;
        TensorEntry::new(key, loc.dtype, loc.shape.clone(), self.bytes(loc).to_vec())
    }

    fn shape(&self, key: &str) -> Result<Vec<usize>> {
        Ok(self.location(key)?.shape.clone())
    }

    fn dtype(&self, key: &str) -> Result<Dtype> {
        Ok(self.location(key)?.dtype)
    }

    fn values(&self, key: &str) -> Result<Vec<f64>> {
        let loc = self.location(key)?;
        decode(key, loc.dtype, self.bytes(loc))
    }
}

impl TensorLoader for TensorMap {
    fn keys(&self) -> &[String] {
        TensorMap::keys(self)
    }

    fn contains(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    fn get(&self, key: &str) -> Result<TensorEntry> {
        self.entry(key).cloned().ok_or_else(|| MergeError::KeyMissing {
            key: key.to_string(),
        })
    }

    fn shape(&self, key: &str) -> Result<Vec<usize>> {
        self.get_ref(key).map(|e| e.shape.clone())
    }

    fn dtype(&self, key: &str) -> Result<Dtype> {
        self.get_ref(key).map(|e| e.dtype)
    }

    fn values(&self, key: &str) -> Result<Vec<f64>> {
        self.get_ref(key)?.to_f64()
    }
}

impl TensorMap {
    fn get_ref(&self, key: &str) -> Result<&TensorEntry> {
        self.entry(key).ok_or_else(|| MergeError::KeyMissing {
            key: key.to_string(),
        })
    }
}

/// Header-level summary of a checkpoint.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Checkpoint path.
    pub path: PathBuf,
    /// Number of tensors.
    pub tensor_count: usize,
    /// First few tensor names in file order.
    pub sample_keys: Vec<String>,
    /// Total number of elements.
    pub parameter_count: u64,
    /// File size in bytes.
    pub file_size_bytes: u64,
    /// Tensor count per dtype, in order of first appearance.
    pub dtypes: Vec<(Dtype, usize)>,
}

impl ModelInfo {
    /// Parameter count in billions.
    pub fn parameters_billions(&self) -> f64 {
        self.parameter_count as f64 / 1e9
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::CheckpointWriter;

    fn write_fixture(dir: &Path, name: &str, entries: Vec<TensorEntry>) -> PathBuf {
        let path = dir.join(name);
        CheckpointWriter::new()
            .write(&path, &TensorMap::from_entries(entries))
            .unwrap();
        path
    }

    #[test]
    fn test_open_missing_file() {
        let err = CheckpointReader::open("/nonexistent/model.safetensors").unwrap_err();
        assert!(matches!(err, MergeError::NotFound { .. }));
    }

    #[test]
    fn test_open_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        std::fs::write(&path, b"definitely not a safetensors header").unwrap();

        let err = CheckpointReader::open(&path).unwrap_err();
        assert!(matches!(err, MergeError::Format { .. }));
        assert!(err.to_string().contains("broken.safetensors"));
    }

    #[test]
    fn test_open_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(
            CheckpointReader::open(&path),
            Err(MergeError::Format { .. })
        ));
    }

    #[test]
    fn test_keys_follow_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            dir.path(),
            "a.safetensors",
            vec![
                TensorEntry::from_f32("z.weight", vec![2], &[1.0, 2.0]).unwrap(),
                TensorEntry::from_f32("a.weight", vec![1], &[3.0]).unwrap(),
                TensorEntry::from_f32("m.bias", vec![3], &[4.0, 5.0, 6.0]).unwrap(),
            ],
        );

        let reader = CheckpointReader::open(&path).unwrap();
        assert_eq!(reader.keys(), &["z.weight", "a.weight", "m.bias"]);
        assert_eq!(reader.shape("m.bias").unwrap(), vec![3]);
        assert_eq!(reader.dtype("a.weight").unwrap(), Dtype::F32);
        assert_eq!(reader.values("m.bias").unwrap(), vec![4.0, 5.0, 6.0]);

        let entry = reader.get("z.weight").unwrap();
        assert_eq!(entry.to_f64().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            dir.path(),
            "a.safetensors",
            vec![TensorEntry::from_f32("w", vec![1], &[1.0]).unwrap()],
        );

        let reader = CheckpointReader::open(&path).unwrap();
        assert!(matches!(
            reader.get("nope"),
            Err(MergeError::KeyMissing { .. })
        ));
        assert!(!reader.contains("nope"));
    }

    #[test]
    fn test_reads_library_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.safetensors");

        let data: Vec<u8> = [1.0_f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        let view = safetensors::tensor::TensorView::new(Dtype::F32, vec![2, 2], &data).unwrap();
        safetensors::serialize_to_file(vec![("block1.weight", view)], &None, &path).unwrap();

        let reader = CheckpointReader::open(&path).unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.values("block1.weight").unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_progress_reported_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let entries = (0..250)
            .map(|i| TensorEntry::from_f32(format!("k{i:03}"), vec![1], &[i as f32]).unwrap())
            .collect();
        let path = write_fixture(dir.path(), "many.safetensors", entries);

        let mut calls = Vec::new();
        CheckpointReader::open_with_progress(&path, 100, |done, total| calls.push((done, total)))
            .unwrap();

        assert_eq!(calls, vec![(100, 250), (200, 250), (250, 250)]);
    }

    #[test]
    fn test_model_info() {
        let dir = tempfile::tempdir().unwrap();
        let entries = (0..7)
            .map(|i| TensorEntry::from_f32(format!("layer{i}.weight"), vec![2, 3], &[0.0; 6]).unwrap())
            .collect();
        let path = write_fixture(dir.path(), "info.safetensors", entries);

        let info = CheckpointReader::open(&path).unwrap().info();
        assert_eq!(info.tensor_count, 7);
        assert_eq!(info.sample_keys.len(), 5);
        assert_eq!(info.sample_keys[0], "layer0.weight");
        assert_eq!(info.parameter_count, 42);
        assert_eq!(info.dtypes, vec![(Dtype::F32, 7)]);
        assert!(info.file_size_bytes > 42 * 4);
    }
}
