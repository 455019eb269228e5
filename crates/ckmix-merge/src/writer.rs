//! Safetensors output with stable key order and atomic replacement.
//!
//! The header is framed exactly as the `safetensors` crate frames it
//! (optional `__metadata__` first, `dtype`/`shape`/`data_offsets` per tensor,
//! compact JSON padded with spaces to 8 bytes) but tensors keep the caller's
//! order instead of being regrouped by dtype. Re-writing an unmodified file
//! read through [`CheckpointReader`](crate::CheckpointReader) therefore
//! reproduces it byte for byte.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use safetensors::Dtype;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::{debug, info};

use crate::tensor::TensorMap;
use crate::{MergeError, Result};

/// Header alignment required by the format.
const HEADER_ALIGN: usize = 8;

#[derive(serde::Serialize)]
struct TensorInfo<'a> {
    dtype: Dtype,
    shape: &'a [usize],
    data_offsets: (usize, usize),
}

struct Header<'a> {
    metadata: Option<&'a BTreeMap<String, String>>,
    tensors: Vec<(&'a str, TensorInfo<'a>)>,
}

impl Serialize for Header<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.tensors.len() + usize::from(self.metadata.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(metadata) = self.metadata {
            map.serialize_entry("__metadata__", metadata)?;
        }
        for (name, info) in &self.tensors {
            map.serialize_entry(name, info)?;
        }
        map.end()
    }
}

/// Writer for merged checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CheckpointWriter {
    metadata: Option<BTreeMap<String, String>>,
}

impl CheckpointWriter {
    /// Create a writer that emits no `__metadata__` block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach free-form header metadata.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Serialize the header and return it padded to the format's alignment.
    fn header_bytes(&self, tensors: &TensorMap) -> Result<Vec<u8>> {
        let mut offset = 0usize;
        let mut infos = Vec::with_capacity(tensors.len());
        for entry in tensors.iter() {
            entry.check_layout()?;
            let end = offset + entry.data.len();
            infos.push((
                entry.key.as_str(),
                TensorInfo {
                    dtype: entry.dtype,
                    shape: &entry.shape,
                    data_offsets: (offset, end),
                },
            ));
            offset = end;
        }

        let header = Header {
            metadata: self.metadata.as_ref(),
            tensors: infos,
        };

        let mut bytes = serde_json::to_vec(&header)?;
        let extra = (HEADER_ALIGN - bytes.len() % HEADER_ALIGN) % HEADER_ALIGN;
        bytes.extend(std::iter::repeat(b' ').take(extra));
        Ok(bytes)
    }

    /// Encode `tensors` to an in-memory safetensors buffer.
    pub fn to_bytes(&self, tensors: &TensorMap) -> Result<Vec<u8>> {
        let header = self.header_bytes(tensors)?;
        let data_len: usize = tensors.iter().map(|e| e.data.len()).sum();

        let mut out = Vec::with_capacity(8 + header.len() + data_len);
        out.extend((header.len() as u64).to_le_bytes());
        out.extend(&header);
        for entry in tensors.iter() {
            out.extend(&entry.data);
        }
        Ok(out)
    }

    /// Write `tensors` to `path`, replacing any existing file.
    ///
    /// Data goes to a temporary file next to `path` that is synced and then
    /// renamed over the destination, so readers never observe a partial file.
    /// Returns the number of bytes written.
    pub fn write(&self, path: impl AsRef<Path>, tensors: &TensorMap) -> Result<u64> {
        let path = path.as_ref();
        let header = self.header_bytes(tensors)?;

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| MergeError::io(&parent, e))?;

        let tmp = tempfile::Builder::new()
            .prefix(".ckmix-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| MergeError::io(&parent, e))?;
        debug!("Staging output in {:?}", tmp.path());

        let mut out = BufWriter::new(tmp);
        let mut written = 0u64;

        let io = |e| MergeError::io(path, e);
        out.write_all(&(header.len() as u64).to_le_bytes()).map_err(io)?;
        out.write_all(&header).map_err(io)?;
        written += 8 + header.len() as u64;

        for entry in tensors.iter() {
            out.write_all(&entry.data).map_err(io)?;
            written += entry.data.len() as u64;
        }

        let tmp = out.into_inner().map_err(|e| io(e.into_error()))?;
        tmp.as_file().sync_all().map_err(io)?;
        tmp.persist(path).map_err(|e| io(e.error))?;

        info!("Wrote {} tensors ({} bytes) to {:?}", tensors.len(), written, path);
        Ok(written)
    }
}
