//! Weighted linear accumulation across checkpoints.
//!
//! For every key in the union of the sources, in first-seen order:
//!
//! ```text
//! merged[k] = Σ weight_i * source_i[k]   over sources holding k with the reference shape
//! ```
//!
//! The first source holding a key fixes its reference shape. Later sources
//! with another shape are skipped for that key and reported; the key is still
//! written from the sources that do match. Weights are never renormalized, so
//! a key held by a single source comes out scaled by that source's weight.

use std::collections::HashSet;
use std::fmt;

use safetensors::Dtype;
use serde::Serialize;
use tracing::{debug, warn};

use crate::tensor::{is_mergeable, promote, TensorEntry, TensorMap};
use crate::{ComputeBackend, MergeError, Result, TensorLoader, WeightedTerm};

/// Ordered result of a merge.
pub type MergedCheckpoint = TensorMap;

/// Why a source's tensor was left out of a key's sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The tensor's shape differs from the key's reference shape.
    ShapeMismatch,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch => f.write_str("shape_mismatch"),
        }
    }
}

/// One skipped contribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedKey {
    /// Tensor name.
    pub key: String,
    /// Source whose tensor was skipped.
    pub model: String,
    /// Why it was skipped.
    pub reason: SkipReason,
    /// Reference shape for the key.
    pub expected_shape: Vec<usize>,
    /// Shape the skipped source had.
    pub actual_shape: Vec<usize>,
}

/// A checkpoint participating in the sum.
#[derive(Clone, Copy)]
pub struct WeightedSource<'a> {
    /// Label used in skip records.
    pub name: &'a str,
    /// Tensor source.
    pub loader: &'a dyn TensorLoader,
    /// Coefficient for every tensor of this source.
    pub weight: f64,
}

/// Resolution of a single key.
#[derive(Debug, Clone)]
pub struct KeyOutcome {
    /// Merged tensor.
    pub entry: TensorEntry,
    /// Number of sources that were summed.
    pub contributors: usize,
    /// Sources left out of the sum.
    pub skipped: Vec<SkippedKey>,
}

/// Events emitted while the accumulator walks the key set.
#[derive(Debug)]
pub enum AccumulatorEvent<'a> {
    /// A contribution was skipped.
    Skipped(&'a SkippedKey),
    /// A key was resolved.
    KeyDone {
        /// Keys resolved so far.
        done: usize,
        /// Total keys in the union.
        total: usize,
        /// Keys summed from two or more sources so far.
        merged: usize,
        /// Distinct keys with at least one skipped contribution so far.
        skipped: usize,
    },
}

/// Counters over a finished accumulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccumulatorStats {
    /// Size of the key union.
    pub keys_total: usize,
    /// Keys summed from two or more sources.
    pub keys_merged: usize,
    /// Keys taken from exactly one source.
    pub keys_single_source: usize,
    /// Every skipped contribution, in processing order.
    pub skipped: Vec<SkippedKey>,
}

impl AccumulatorStats {
    /// Number of distinct keys with a skipped contribution.
    pub fn keys_skipped(&self) -> usize {
        self.skipped
            .iter()
            .map(|s| s.key.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Computes the weighted sum of several tensor sources.
pub struct WeightedAccumulator<'a> {
    sources: Vec<WeightedSource<'a>>,
    backend: &'a dyn ComputeBackend,
}

impl<'a> WeightedAccumulator<'a> {
    /// Create an accumulator that evaluates sums on `backend`.
    pub fn new(backend: &'a dyn ComputeBackend) -> Self {
        Self {
            sources: Vec::new(),
            backend,
        }
    }

    /// Append a source; order of calls is the merge order.
    pub fn add_source(&mut self, name: &'a str, loader: &'a dyn TensorLoader, weight: f64) -> &mut Self {
        self.sources.push(WeightedSource { name, loader, weight });
        self
    }

    /// Sources in merge order.
    pub fn sources(&self) -> &[WeightedSource<'a>] {
        &self.sources
    }

    /// Union of all keys: sources in merge order, keys in source order,
    /// each key at its first appearance.
    pub fn key_order(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for source in &self.sources {
            for key in source.loader.keys() {
                if seen.insert(key.as_str()) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// Resolve one key.
    pub fn merge_key(&self, key: &str) -> Result<KeyOutcome> {
        let mut reference: Option<Vec<usize>> = None;
        let mut dtype: Option<Dtype> = None;
        let mut values: Vec<Vec<f64>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut skipped = Vec::new();

        for source in &self.sources {
            if !source.loader.contains(key) {
                continue;
            }

            let shape = source.loader.shape(key)?;
            match &reference {
                None => reference = Some(shape),
                Some(expected) if *expected != shape => {
                    warn!(
                        "Skipping {} from {}: shape {:?} does not match {:?}",
                        key, source.name, shape, expected
                    );
                    skipped.push(SkippedKey {
                        key: key.to_string(),
                        model: source.name.to_string(),
                        reason: SkipReason::ShapeMismatch,
                        expected_shape: expected.clone(),
                        actual_shape: shape,
                    });
                    continue;
                }
                Some(_) => {}
            }

            let source_dtype = source.loader.dtype(key)?;
            if !is_mergeable(source_dtype) {
                return Err(MergeError::UnsupportedDtype {
                    key: key.to_string(),
                    dtype: source_dtype,
                });
            }
            dtype = Some(dtype.map_or(source_dtype, |d| promote(d, source_dtype)));

            values.push(source.loader.values(key)?);
            weights.push(source.weight);
        }

        let (Some(shape), Some(dtype)) = (reference, dtype) else {
            return Err(MergeError::KeyMissing {
                key: key.to_string(),
            });
        };

        let terms: Vec<WeightedTerm<'_>> = values
            .iter()
            .zip(&weights)
            .map(|(values, &weight)| WeightedTerm { values, weight })
            .collect();
        let summed = self.backend.weighted_sum(&terms)?;

        debug!("Merged {} from {} sources as {:?}", key, terms.len(), dtype);

        Ok(KeyOutcome {
            entry: TensorEntry::from_f64(key, dtype, shape, &summed)?,
            contributors: terms.len(),
            skipped,
        })
    }

    /// Merge every key.
    pub fn run(&self) -> Result<(MergedCheckpoint, AccumulatorStats)> {
        self.run_with(|_| Ok(()))
    }

    /// Merge every key, reporting to `observer`; an error from the observer
    /// stops the run and is returned as-is.
    pub fn run_with(
        &self,
        mut observer: impl FnMut(AccumulatorEvent<'_>) -> Result<()>,
    ) -> Result<(MergedCheckpoint, AccumulatorStats)> {
        let keys = self.key_order();
        let total = keys.len();

        let mut merged = MergedCheckpoint::new();
        let mut stats = AccumulatorStats {
            keys_total: total,
            ..Default::default()
        };
        let mut skipped_keys = 0;

        for (idx, key) in keys.iter().enumerate() {
            let outcome = self.merge_key(key)?;

            for skip in &outcome.skipped {
                observer(AccumulatorEvent::Skipped(skip))?;
            }
            if !outcome.skipped.is_empty() {
                skipped_keys += 1;
            }

            if outcome.contributors > 1 {
                stats.keys_merged += 1;
            } else {
                stats.keys_single_source += 1;
            }
            stats.skipped.extend(outcome.skipped);
            merged.insert(outcome.entry);

            observer(AccumulatorEvent::KeyDone {
                done: idx + 1,
                total,
                merged: stats.keys_merged,
                skipped: skipped_keys,
            })?;
        }

        Ok((merged, stats))
    }
}
