//! Compute backends for the weighted sum.
//!
//! The device is chosen once per run by [`select_backend`]. An accelerator is
//! only used when `candle-core` was built with its `cuda` or `metal` feature
//! and a device actually answers; otherwise the run continues on the CPU.
//!
//! ```ignore
//! use ckmix_merge::{select_backend, DevicePreference, WeightedTerm};
//!
//! let backend = select_backend(DevicePreference::Auto);
//! let merged = backend.weighted_sum(&[
//!     WeightedTerm { values: &a, weight: 0.6 },
//!     WeightedTerm { values: &b, weight: 0.4 },
//! ])?;
//! ```

use candle_core::{DType, Device, Tensor};
use tracing::{info, warn};

use crate::{DevicePreference, MergeError, Result};

/// One contribution to a weighted sum.
#[derive(Debug, Clone, Copy)]
pub struct WeightedTerm<'a> {
    /// Decoded tensor elements.
    pub values: &'a [f64],
    /// Coefficient for this contribution.
    pub weight: f64,
}

/// Device that evaluates `Σ weight_i * values_i` element-wise.
pub trait ComputeBackend: Send + Sync {
    /// Short device name for logs and reports.
    fn name(&self) -> &str;

    /// Whether the work runs on an accelerator.
    fn is_accelerated(&self) -> bool;

    /// Sum the weighted terms in order.
    ///
    /// All terms must have the same length. The first product seeds the
    /// accumulator, so a single term with weight `1.0` is returned bit-exact.
    fn weighted_sum(&self, terms: &[WeightedTerm<'_>]) -> Result<Vec<f64>>;
}

fn check_terms(terms: &[WeightedTerm<'_>]) -> Result<usize> {
    let first = terms.first().ok_or_else(|| {
        MergeError::Config("weighted sum needs at least one term".to_string())
    })?;
    let len = first.values.len();
    if let Some(bad) = terms.iter().find(|t| t.values.len() != len) {
        return Err(MergeError::Config(format!(
            "weighted sum terms differ in length: {} vs {}",
            len,
            bad.values.len()
        )));
    }
    Ok(len)
}

/// Plain CPU implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    /// Create a CPU backend.
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn is_accelerated(&self) -> bool {
        false
    }

    fn weighted_sum(&self, terms: &[WeightedTerm<'_>]) -> Result<Vec<f64>> {
        check_terms(terms)?;

        let mut acc: Vec<f64> = terms[0].values.iter().map(|v| v * terms[0].weight).collect();
        for term in &terms[1..] {
            for (a, v) in acc.iter_mut().zip(term.values) {
                *a += v * term.weight;
            }
        }
        Ok(acc)
    }
}

/// Accelerated implementation on a candle device.
///
/// Sums run in `F64` except on Metal, which has no `F64` arithmetic kernels
/// and computes in `F32`.
#[derive(Debug, Clone)]
pub struct CandleBackend {
    device: Device,
    dtype: DType,
    name: String,
}

impl CandleBackend {
    /// Wrap an already-initialized candle device.
    pub fn new(device: Device) -> Self {
        let (name, dtype) = match &device {
            Device::Cpu => ("candle-cpu", DType::F64),
            Device::Cuda(_) => ("cuda", DType::F64),
            Device::Metal(_) => ("metal", DType::F32),
        };
        Self {
            device,
            dtype,
            name: name.to_string(),
        }
    }

    /// Try CUDA device 0.
    pub fn cuda() -> Result<Self> {
        Ok(Self::new(Device::new_cuda(0)?))
    }

    /// Try the default Metal device.
    pub fn metal() -> Result<Self> {
        Ok(Self::new(Device::new_metal(0)?))
    }

    /// Override the compute dtype. Anything but `F32` computes in `F64`.
    pub fn with_compute_dtype(mut self, dtype: DType) -> Self {
        self.dtype = if dtype == DType::F32 { DType::F32 } else { DType::F64 };
        self
    }

    /// Element type the sums are computed in.
    pub fn compute_dtype(&self) -> DType {
        self.dtype
    }

    fn upload(&self, values: &[f64]) -> Result<Tensor> {
        let tensor = if self.dtype == DType::F32 {
            let narrowed: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            Tensor::from_slice(&narrowed, values.len(), &self.device)?
        } else {
            Tensor::from_slice(values, values.len(), &self.device)?
        };
        Ok(tensor)
    }

    /// Upload one term and multiply it by its weight.
    ///
    /// A plain multiply rather than `affine`, whose `+ 0.0` would turn `-0.0`
    /// into `+0.0`.
    fn scaled(&self, term: &WeightedTerm<'_>) -> Result<Tensor> {
        let values = self.upload(term.values)?;
        let weight = self.upload(&[term.weight])?;
        Ok(values.broadcast_mul(&weight)?)
    }

    /// The underlying device.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl ComputeBackend for CandleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_accelerated(&self) -> bool {
        !matches!(self.device, Device::Cpu)
    }

    fn weighted_sum(&self, terms: &[WeightedTerm<'_>]) -> Result<Vec<f64>> {
        check_terms(terms)?;

        let mut acc = self.scaled(&terms[0])?;
        for term in &terms[1..] {
            acc = acc.add(&self.scaled(term)?)?;
        }

        // Blocks until the device has finished.
        if self.dtype == DType::F32 {
            Ok(acc.to_vec1::<f32>()?.into_iter().map(f64::from).collect())
        } else {
            Ok(acc.to_vec1::<f64>()?)
        }
    }
}

/// Run a small known sum on `backend`.
fn smoke_test(backend: &dyn ComputeBackend) -> Result<()> {
    let a = [1.0, -2.0, 0.5];
    let b = [3.0, 4.0, -0.5];
    let result = backend.weighted_sum(&[
        WeightedTerm { values: &a, weight: 0.5 },
        WeightedTerm { values: &b, weight: 0.5 },
    ])?;

    let expected = [2.0, 1.0, 0.0];
    if result.len() != expected.len() || result.iter().zip(&expected).any(|(r, e)| (r - e).abs() > 1e-6) {
        return Err(MergeError::Config(format!(
            "{} returned {:?} for a known sum",
            backend.name(),
            result
        )));
    }
    Ok(())
}

/// Keep `candidate` only if it can actually compute a weighted sum.
fn verified_or_cpu(candidate: Box<dyn ComputeBackend>, preference: DevicePreference) -> Box<dyn ComputeBackend> {
    match smoke_test(candidate.as_ref()) {
        Ok(()) => {
            info!("Using {} backend", candidate.name());
            candidate
        }
        Err(e) => {
            warn!(
                "{} backend initialized but cannot compute ({}), falling back to CPU backend",
                candidate.name(),
                e
            );
            if preference == DevicePreference::Auto {
                info!("Using CPU backend");
            }
            Box::new(CpuBackend::new())
        }
    }
}

/// Pick the compute backend for a run.
///
/// Never fails: a missing, uncompiled or non-working accelerator degrades to
/// [`CpuBackend`] with a warning.
pub fn select_backend(preference: DevicePreference) -> Box<dyn ComputeBackend> {
    let attempt = match preference {
        DevicePreference::Cpu => None,
        DevicePreference::Cuda => Some(CandleBackend::cuda()),
        DevicePreference::Metal => Some(CandleBackend::metal()),
        DevicePreference::Auto => Some(CandleBackend::cuda().or_else(|_| CandleBackend::metal())),
    };

    match attempt {
        None => {
            info!("Using CPU backend");
            Box::new(CpuBackend::new())
        }
        Some(Ok(backend)) => verified_or_cpu(Box::new(backend), preference),
        Some(Err(e)) => {
            if preference == DevicePreference::Auto {
                info!("No accelerator available ({}), using CPU backend", e);
            } else {
                warn!("{} unavailable ({}), falling back to CPU backend", preference, e);
            }
            Box::new(CpuBackend::new())
        }
    }
}

/// Accelerators that can be initialized in this build on this machine.
pub fn available_accelerators() -> Vec<DevicePreference> {
    let mut found = Vec::new();
    if CandleBackend::cuda().is_ok() {
        found.push(DevicePreference::Cuda);
    }
    if CandleBackend::metal().is_ok() {
        found.push(DevicePreference::Metal);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_weighted_sum() {
        let a = [1.0, 2.0, 3.0];
        let b = [3.0, 4.0, 5.0];
        let result = CpuBackend::new()
            .weighted_sum(&[
                WeightedTerm { values: &a, weight: 0.5 },
                WeightedTerm { values: &b, weight: 0.5 },
            ])
            .unwrap();
        assert_eq!(result, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_single_term_identity_keeps_negative_zero() {
        let a = [-0.0, 1.5];
        let result = CpuBackend::new()
            .weighted_sum(&[WeightedTerm { values: &a, weight: 1.0 }])
            .unwrap();
        assert!(result[0].is_sign_negative());
        assert_eq!(result[1], 1.5);
    }

    #[test]
    fn test_rejects_empty_and_ragged_terms() {
        let backend = CpuBackend::new();
        assert!(backend.weighted_sum(&[]).is_err());

        let a = [1.0, 2.0];
        let b = [1.0];
        assert!(backend
            .weighted_sum(&[
                WeightedTerm { values: &a, weight: 1.0 },
                WeightedTerm { values: &b, weight: 1.0 },
            ])
            .is_err());
    }

    #[test]
    fn test_candle_cpu_device_matches_cpu_backend() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [0.5, 0.25, -1.0, 8.0];
        let terms = [
            WeightedTerm { values: &a, weight: 0.6 },
            WeightedTerm { values: &b, weight: 0.4 },
        ];

        let candle = CandleBackend::new(Device::Cpu);
        assert!(!candle.is_accelerated());

        let expected = CpuBackend::new().weighted_sum(&terms).unwrap();
        let actual = candle.weighted_sum(&terms).unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-12);
        }
    }

    #[test]
    fn test_candle_f32_compute_matches_cpu_backend() {
        let a = [1.0, 2.0, 3.0, -0.0];
        let b = [0.5, 0.25, -1.0, 8.0];
        let terms = [
            WeightedTerm { values: &a, weight: 0.6 },
            WeightedTerm { values: &b, weight: 0.4 },
        ];

        let candle = CandleBackend::new(Device::Cpu).with_compute_dtype(DType::F32);
        assert_eq!(candle.compute_dtype(), DType::F32);

        let expected = CpuBackend::new().weighted_sum(&terms).unwrap();
        let actual = candle.weighted_sum(&terms).unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-6);
        }

        let identity = candle
            .weighted_sum(&[WeightedTerm { values: &a, weight: 1.0 }])
            .unwrap();
        assert!(identity[3].is_sign_negative());
    }

    /// Backend that initializes but cannot run arithmetic.
    struct BrokenBackend;

    impl ComputeBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }

        fn is_accelerated(&self) -> bool {
            true
        }

        fn weighted_sum(&self, _terms: &[WeightedTerm<'_>]) -> Result<Vec<f64>> {
            Err(MergeError::Backend(candle_core::Error::Msg(
                "binary mul F64 not implemented".to_string(),
            )))
        }
    }

    /// Backend that computes the wrong answer.
    struct ZeroBackend;

    impl ComputeBackend for ZeroBackend {
        fn name(&self) -> &str {
            "zero"
        }

        fn is_accelerated(&self) -> bool {
            true
        }

        fn weighted_sum(&self, terms: &[WeightedTerm<'_>]) -> Result<Vec<f64>> {
            Ok(vec![0.0; terms[0].values.len()])
        }
    }

    #[test]
    fn test_non_working_accelerator_falls_back_to_cpu() {
        for preference in [DevicePreference::Auto, DevicePreference::Metal] {
            let backend = verified_or_cpu(Box::new(BrokenBackend), preference);
            assert_eq!(backend.name(), "cpu");
            assert!(!backend.is_accelerated());
        }

        let backend = verified_or_cpu(Box::new(ZeroBackend), DevicePreference::Cuda);
        assert_eq!(backend.name(), "cpu");
    }

    #[test]
    fn test_working_accelerator_is_kept() {
        let backend = verified_or_cpu(Box::new(CandleBackend::new(Device::Cpu)), DevicePreference::Auto);
        assert_eq!(backend.name(), "candle-cpu");
    }

    #[test]
    fn test_cpu_preference_never_touches_accelerators() {
        let backend = select_backend(DevicePreference::Cpu);
        assert_eq!(backend.name(), "cpu");
        assert!(!backend.is_accelerated());
    }

    #[test]
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    fn test_falls_back_without_accelerator_support() {
        for preference in [DevicePreference::Auto, DevicePreference::Cuda, DevicePreference::Metal] {
            let backend = select_backend(preference);
            assert_eq!(backend.name(), "cpu");
        }
        assert!(available_accelerators().is_empty());
    }
}
