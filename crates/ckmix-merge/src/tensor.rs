//! Owned tensor entries and dtype conversion.
//!
//! Checkpoints store little-endian element buffers. Merging decodes every
//! supported element type into `f64`, sums there, and encodes the result back
//! into the promoted output type.

use std::collections::HashMap;

use half::{bf16, f16};
use safetensors::Dtype;

use crate::{MergeError, Result};

/// A named, typed, shaped tensor with its raw little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    /// Parameter name.
    pub key: String,
    /// Dimensions, outermost first.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: Dtype,
    /// Raw element bytes.
    pub data: Vec<u8>,
}

impl TensorEntry {
    /// Create an entry, checking that the byte length fits dtype and shape.
    pub fn new(key: impl Into<String>, dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let entry = Self {
            key: key.into(),
            shape,
            dtype,
            data,
        };
        entry.check_layout()?;
        Ok(entry)
    }

    /// Build an entry from `f64` values, encoding them as `dtype`.
    pub fn from_f64(key: impl Into<String>, dtype: Dtype, shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        let key = key.into();
        let data = encode(&key, dtype, values)?;
        Self::new(key, dtype, shape, data)
    }

    /// Build an `F32` entry, mostly for fixtures.
    pub fn from_f32(key: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(key, Dtype::F32, shape, data)
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode the elements into `f64`.
    pub fn to_f64(&self) -> Result<Vec<f64>> {
        decode(&self.key, self.dtype, &self.data)
    }

    /// Verify that `data.len() == dtype size * Π shape`.
    pub fn check_layout(&self) -> Result<()> {
        let expected = self
            .shape
            .iter()
            .try_fold(self.dtype.size(), |acc, &d| acc.checked_mul(d));

        match expected {
            Some(len) if len == self.data.len() => Ok(()),
            Some(len) => Err(MergeError::Layout {
                key: self.key.clone(),
                reason: format!(
                    "{:?} tensor of shape {:?} needs {} bytes, has {}",
                    self.dtype,
                    self.shape,
                    len,
                    self.data.len()
                ),
            }),
            None => Err(MergeError::Layout {
                key: self.key.clone(),
                reason: format!("shape {:?} overflows", self.shape),
            }),
        }
    }
}

/// Insertion-ordered mapping from key to tensor.
///
/// Keys keep the position of their first insertion; re-inserting a key
/// replaces the tensor in place.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    keys: Vec<String>,
    entries: HashMap<String, TensorEntry>,
}

impl TensorMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from entries, keeping their order.
    pub fn from_entries(entries: impl IntoIterator<Item = TensorEntry>) -> Self {
        let mut map = Self::new();
        for entry in entries {
            map.insert(entry);
        }
        map
    }

    /// Insert an entry.
    pub fn insert(&mut self, entry: TensorEntry) {
        if !self.entries.contains_key(&entry.key) {
            self.keys.push(entry.key.clone());
        }
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Look up an entry.
    pub fn entry(&self, key: &str) -> Option<&TensorEntry> {
        self.entries.get(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TensorEntry> {
        self.keys.iter().filter_map(|k| self.entries.get(k))
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the map holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Total number of elements across all tensors.
    pub fn parameter_count(&self) -> usize {
        self.iter().map(TensorEntry::num_elements).sum()
    }
}

/// Whether weighted arithmetic is defined for `dtype`.
pub fn is_mergeable(dtype: Dtype) -> bool {
    matches!(
        dtype,
        Dtype::F16
            | Dtype::BF16
            | Dtype::F32
            | Dtype::F64
            | Dtype::I8
            | Dtype::I16
            | Dtype::I32
            | Dtype::I64
            | Dtype::U8
            | Dtype::U16
            | Dtype::U32
            | Dtype::U64
    )
}

fn is_float(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F16 | Dtype::BF16 | Dtype::F32 | Dtype::F64)
}

/// Output type when tensors of `a` and `b` are summed.
///
/// Floats win over integers and the wider type wins; the two 16-bit floats
/// have no common 16-bit representation and meet at `F32`.
pub fn promote(a: Dtype, b: Dtype) -> Dtype {
    if a == b {
        return a;
    }
    match (is_float(a), is_float(b)) {
        (true, false) => a,
        (false, true) => b,
        (true, true) => {
            if matches!((a, b), (Dtype::F16, Dtype::BF16) | (Dtype::BF16, Dtype::F16)) {
                Dtype::F32
            } else if a.size() >= b.size() {
                a
            } else {
                b
            }
        }
        (false, false) => {
            let signed = |d: Dtype| matches!(d, Dtype::I8 | Dtype::I16 | Dtype::I32 | Dtype::I64);
            let size = a.size().max(b.size());
            if signed(a) || signed(b) {
                match size {
                    1 => Dtype::I8,
                    2 => Dtype::I16,
                    4 => Dtype::I32,
                    _ => Dtype::I64,
                }
            } else if a.size() >= b.size() {
                a
            } else {
                b
            }
        }
    }
}

macro_rules! decode_le {
    ($data:expr, $ty:ty, $n:expr, $conv:expr) => {
        $data
            .chunks_exact($n)
            .map(|c| {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(c);
                $conv(<$ty>::from_le_bytes(buf))
            })
            .collect()
    };
}

/// Decode little-endian `data` of type `dtype` into `f64`.
pub fn decode(key: &str, dtype: Dtype, data: &[u8]) -> Result<Vec<f64>> {
    let values: Vec<f64> = match dtype {
        Dtype::F16 => decode_le!(data, f16, 2, |v: f16| v.to_f64()),
        Dtype::BF16 => decode_le!(data, bf16, 2, |v: bf16| v.to_f64()),
        Dtype::F32 => decode_le!(data, f32, 4, |v: f32| v as f64),
        Dtype::F64 => decode_le!(data, f64, 8, |v: f64| v),
        Dtype::I8 => decode_le!(data, i8, 1, |v: i8| v as f64),
        Dtype::I16 => decode_le!(data, i16, 2, |v: i16| v as f64),
        Dtype::I32 => decode_le!(data, i32, 4, |v: i32| v as f64),
        Dtype::I64 => decode_le!(data, i64, 8, |v: i64| v as f64),
        Dtype::U8 => decode_le!(data, u8, 1, |v: u8| v as f64),
        Dtype::U16 => decode_le!(data, u16, 2, |v: u16| v as f64),
        Dtype::U32 => decode_le!(data, u32, 4, |v: u32| v as f64),
        Dtype::U64 => decode_le!(data, u64, 8, |v: u64| v as f64),
        dtype => {
            return Err(MergeError::UnsupportedDtype {
                key: key.to_string(),
                dtype,
            })
        }
    };
    Ok(values)
}

/// Encode `values` as little-endian `dtype` bytes.
///
/// Integer targets round to nearest; `as` casts saturate out-of-range values.
pub fn encode(key: &str, dtype: Dtype, values: &[f64]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * dtype.size());
    match dtype {
        Dtype::F16 => values.iter().for_each(|&v| out.extend(f16::from_f64(v).to_le_bytes())),
        Dtype::BF16 => values.iter().for_each(|&v| out.extend(bf16::from_f64(v).to_le_bytes())),
        Dtype::F32 => values.iter().for_each(|&v| out.extend((v as f32).to_le_bytes())),
        Dtype::F64 => values.iter().for_each(|&v| out.extend(v.to_le_bytes())),
        Dtype::I8 => values.iter().for_each(|&v| out.extend((v.round() as i8).to_le_bytes())),
        Dtype::I16 => values.iter().for_each(|&v| out.extend((v.round() as i16).to_le_bytes())),
        Dtype::I32 => values.iter().for_each(|&v| out.extend((v.round() as i32).to_le_bytes())),
        Dtype::I64 => values.iter().for_each(|&v| out.extend((v.round() as i64).to_le_bytes())),
        Dtype::U8 => values.iter().for_each(|&v| out.extend((v.round() as u8).to_le_bytes())),
        Dtype::U16 => values.iter().for_each(|&v| out.extend((v.round() as u16).to_le_bytes())),
        Dtype::U32 => values.iter().for_each(|&v| out.extend((v.round() as u32).to_le_bytes())),
        Dtype::U64 => values.iter().for_each(|&v| out.extend((v.round() as u64).to_le_bytes())),
        dtype => {
            return Err(MergeError::UnsupportedDtype {
                key: key.to_string(),
                dtype,
            })
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_check() {
        assert!(TensorEntry::new("a", Dtype::F32, vec![2, 2], vec![0u8; 16]).is_ok());

        let err = TensorEntry::new("a", Dtype::F32, vec![2, 2], vec![0u8; 12]).unwrap_err();
        assert!(matches!(err, MergeError::Layout { .. }));
    }

    #[test]
    fn test_scalar_tensor_has_one_element() {
        let entry = TensorEntry::from_f32("scale", vec![], &[3.5]).unwrap();
        assert_eq!(entry.num_elements(), 1);
        assert_eq!(entry.to_f64().unwrap(), vec![3.5]);
    }

    #[test]
    fn test_half_precision_is_exact_through_f64() {
        let values = [0.5_f64, -1.25, 65504.0, 0.0];
        for dtype in [Dtype::F16, Dtype::BF16, Dtype::F32] {
            let bytes = encode("k", dtype, &values).unwrap();
            assert_eq!(decode("k", dtype, &bytes).unwrap()[..2], values[..2]);
            // Re-encoding the decoded values gives back the same bytes.
            let again = encode("k", dtype, &decode("k", dtype, &bytes).unwrap()).unwrap();
            assert_eq!(again, bytes);
        }
    }

    #[test]
    fn test_negative_zero_survives() {
        let bytes = encode("k", Dtype::F32, &[-0.0]).unwrap();
        assert_eq!(bytes, (-0.0_f32).to_le_bytes().to_vec());
    }

    #[test]
    fn test_integer_encoding_rounds_and_saturates() {
        let bytes = encode("ids", Dtype::I64, &[1.4, 1.6, -2.5]).unwrap();
        assert_eq!(decode("ids", Dtype::I64, &bytes).unwrap(), vec![1.0, 2.0, -3.0]);

        let bytes = encode("u", Dtype::U8, &[300.0, -4.0]).unwrap();
        assert_eq!(bytes, vec![255, 0]);
    }

    #[test]
    fn test_unsupported_dtype() {
        assert!(!is_mergeable(Dtype::BOOL));
        let err = decode("mask", Dtype::BOOL, &[1, 0]).unwrap_err();
        assert!(matches!(err, MergeError::UnsupportedDtype { .. }));
    }

    #[test]
    fn test_tensor_map_keeps_first_insertion_order() {
        let mut map = TensorMap::new();
        map.insert(TensorEntry::from_f32("b", vec![1], &[1.0]).unwrap());
        map.insert(TensorEntry::from_f32("a", vec![1], &[2.0]).unwrap());
        map.insert(TensorEntry::from_f32("b", vec![2], &[3.0, 4.0]).unwrap());

        assert_eq!(map.keys(), &["b".to_string(), "a".to_string()]);
        assert_eq!(map.entry("b").unwrap().shape, vec![2]);
        assert_eq!(map.parameter_count(), 3);
    }

    #[test]
    fn test_promotion() {
        assert_eq!(promote(Dtype::F16, Dtype::F16), Dtype::F16);
        assert_eq!(promote(Dtype::F16, Dtype::F32), Dtype::F32);
        assert_eq!(promote(Dtype::BF16, Dtype::F16), Dtype::F32);
        assert_eq!(promote(Dtype::I64, Dtype::F16), Dtype::F16);
        assert_eq!(promote(Dtype::U8, Dtype::I8), Dtype::I8);
        assert_eq!(promote(Dtype::U16, Dtype::I8), Dtype::I16);
        assert_eq!(promote(Dtype::U32, Dtype::U8), Dtype::U32);
    }
}
