//! Merge run orchestration.
//!
//! A run moves through `Init → Loading → Merging → Saving → Done`, or to
//! `Failed` from any phase. The first fatal error ends the run; nothing is
//! written unless every checkpoint loaded and every key resolved.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    select_backend, AccumulatorEvent, CheckpointReader, CheckpointWriter, ComputeBackend,
    DevicePreference, MergeCallback, MergeConfig, MergeError, ModelSpec, NullCallback, Result,
    SkippedKey, TensorLoader, WeightedAccumulator,
};

/// Phase of a run, as attached to errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePhase {
    /// Configuration validation and backend selection.
    Init,
    /// Opening input checkpoints.
    Loading,
    /// Computing the weighted sums.
    Merging,
    /// Writing the output checkpoint.
    Saving,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Loading => "loading",
            Self::Merging => "merging",
            Self::Saving => "saving",
        };
        f.write_str(s)
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeState {
    /// Not started, or validating.
    Init,
    /// Opening checkpoint `index` (0-based) of `total`.
    Loading {
        /// Checkpoint being opened.
        index: usize,
        /// Number of checkpoints.
        total: usize,
    },
    /// Accumulating.
    Merging,
    /// Writing output.
    Saving,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

impl MergeState {
    /// Phase this state belongs to; `None` once terminal.
    pub fn phase(&self) -> Option<MergePhase> {
        match self {
            Self::Init => Some(MergePhase::Init),
            Self::Loading { .. } => Some(MergePhase::Loading),
            Self::Merging => Some(MergePhase::Merging),
            Self::Saving => Some(MergePhase::Saving),
            Self::Done | Self::Failed => None,
        }
    }

    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading { index, total } => write!(f, "loading {}/{}", index + 1, total),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
            other => match other.phase() {
                Some(phase) => write!(f, "{phase}"),
                None => Ok(()),
            },
        }
    }
}

/// Shared flag that cancels a run at the next file or key boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Create an untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(MergeError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    /// Size of the key union.
    pub keys_total: usize,
    /// Keys summed from two or more checkpoints.
    pub keys_merged: usize,
    /// Keys carried over from a single checkpoint.
    pub keys_single_source: usize,
    /// Distinct keys with at least one skipped contribution.
    pub keys_skipped: usize,
    /// Every skipped contribution with its reason.
    pub skipped: Vec<SkippedKey>,
    /// Where the merged checkpoint was written.
    pub output_path: PathBuf,
    /// Size of the written file.
    pub output_size_bytes: u64,
    /// Compute backend that ran the sums.
    pub backend: String,
    /// Checkpoints and weights, in merge order.
    pub models: Vec<ModelSpec>,
    /// Sum of all weights.
    pub weight_sum: f64,
    /// Wall-clock duration of the run.
    pub elapsed_secs: f64,
    /// Run-level warnings.
    pub warnings: Vec<String>,
}

impl MergeReport {
    /// Output size in GiB.
    pub fn output_size_gb(&self) -> f64 {
        self.output_size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Drives one merge run from configuration to output file.
pub struct MergeOrchestrator {
    config: MergeConfig,
    backend: Option<Box<dyn ComputeBackend>>,
    state: MergeState,
    abort: AbortHandle,
}

impl MergeOrchestrator {
    /// Create an orchestrator; the backend is chosen from `config.device`
    /// when the run starts.
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            backend: None,
            state: MergeState::Init,
            abort: AbortHandle::new(),
        }
    }

    /// Use `backend` instead of selecting one from the configuration.
    pub fn with_backend(mut self, backend: Box<dyn ComputeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Handle that cancels this run from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Current state.
    pub fn state(&self) -> &MergeState {
        &self.state
    }

    /// The run's configuration.
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    fn transition(&mut self, state: MergeState, callback: &mut dyn MergeCallback) {
        self.state = state;
        callback.on_state(&self.state);
    }

    /// Execute the run. An orchestrator runs at most once.
    pub fn run(&mut self, callback: &mut dyn MergeCallback) -> Result<MergeReport> {
        if self.state != MergeState::Init {
            return Err(MergeError::Config(format!(
                "merge run already {}; create a new orchestrator to retry",
                self.state
            )));
        }

        let started = Instant::now();
        callback.on_state(&self.state);

        match self.run_phases(callback, started) {
            Ok(report) => {
                self.transition(MergeState::Done, callback);
                info!(
                    "Merge complete in {:.1}s: {} keys ({} merged, {} single-source, {} skipped)",
                    report.elapsed_secs,
                    report.keys_total,
                    report.keys_merged,
                    report.keys_single_source,
                    report.keys_skipped
                );
                Ok(report)
            }
            Err(e) => {
                let phase = self.state.phase().unwrap_or(MergePhase::Init);
                self.transition(MergeState::Failed, callback);
                error!("Merge failed during {}: {}", phase, e);
                Err(MergeError::Phase {
                    phase,
                    source: Box::new(e),
                })
            }
        }
    }

    fn run_phases(&mut self, callback: &mut dyn MergeCallback, started: Instant) -> Result<MergeReport> {
        let config = self.config.clone();
        let mut warnings = Vec::new();

        // Init
        config.validate()?;
        let weight_sum = config.weight_sum();
        if !config.weights_normalized() {
            let msg = format!("weights sum to {weight_sum:.2}, not 1.0; output will be scaled");
            warn!("{}", msg);
            callback.on_warning(&msg);
            warnings.push(msg);
        }
        for model in &config.models {
            debug!("{}: {:.0}% weight", model.name, model.weight * 100.0);
        }

        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => select_backend(config.device),
        };
        self.abort.check()?;

        // Loading
        let total = config.models.len();
        let mut readers = Vec::with_capacity(total);
        for (index, model) in config.models.iter().enumerate() {
            self.abort.check()?;
            self.transition(MergeState::Loading { index, total }, callback);

            let path = config.model_path(model);
            debug!("[1/3] Loading {} ({}/{}) from {:?}", model.name, index + 1, total, path);
            callback.on_load_start(index, total, &model.name, &path);

            let reader = CheckpointReader::open_with_progress(&path, config.progress_interval, |done, n| {
                callback.on_load_progress(index, done, n)
            })?;

            debug!("  Loaded {} keys", reader.len());
            callback.on_load_end(index, &model.name, reader.len());
            readers.push(reader);
        }

        // Merging
        self.abort.check()?;
        self.transition(MergeState::Merging, callback);

        let mut accumulator = WeightedAccumulator::new(backend.as_ref());
        for (model, reader) in config.models.iter().zip(&readers) {
            accumulator.add_source(&model.name, reader as &dyn TensorLoader, model.weight);
        }

        let keys_total = accumulator.key_order().len();
        debug!("[2/3] Merging {} keys on {}", keys_total, backend.name());
        callback.on_merge_start(keys_total);

        let interval = config.progress_interval;
        let abort = self.abort.clone();
        let (merged, stats) = accumulator.run_with(|event| {
            match event {
                AccumulatorEvent::Skipped(skip) => callback.on_skip(skip),
                AccumulatorEvent::KeyDone {
                    done,
                    total,
                    merged,
                    skipped,
                } => {
                    abort.check()?;
                    if done % interval == 0 || done == total {
                        debug!(
                            "  Processed {}/{} keys ({} merged, {} skipped)",
                            done, total, merged, skipped
                        );
                        callback.on_merge_progress(done, total, merged, skipped);
                    }
                }
            }
            Ok(())
        })?;
        drop(accumulator);

        // Header metadata follows the first checkpoint so an identity merge
        // reproduces its input.
        let mut metadata: BTreeMap<String, String> = readers
            .first()
            .map(|r| r.metadata().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        drop(readers);

        let keys_skipped = stats.keys_skipped();
        if config.models.len() > 1 && stats.keys_total > 0 {
            let unblended = (stats.keys_single_source + keys_skipped) as f64 / stats.keys_total as f64;
            if unblended > config.low_overlap_warn_ratio {
                let msg = format!(
                    "{:.0}% of keys were not blended ({} single-source, {} with skipped contributions); \
                     the checkpoints may not share an architecture",
                    unblended * 100.0,
                    stats.keys_single_source,
                    keys_skipped
                );
                warn!("{}", msg);
                callback.on_warning(&msg);
                warnings.push(msg);
            }
        }

        // Saving
        self.abort.check()?;
        self.transition(MergeState::Saving, callback);

        let output_path = config.output_path();
        debug!("[3/3] Saving merged checkpoint to {:?}", output_path);
        callback.on_save_start(&output_path);

        if config.record_provenance {
            metadata.extend(provenance(&config.models));
        }
        let mut writer = CheckpointWriter::new();
        if !metadata.is_empty() {
            writer = writer.with_metadata(metadata);
        }
        let output_size_bytes = writer.write(&output_path, &merged)?;
        callback.on_save_end(&output_path, output_size_bytes);

        Ok(MergeReport {
            keys_total: stats.keys_total,
            keys_merged: stats.keys_merged,
            keys_single_source: stats.keys_single_source,
            keys_skipped,
            skipped: stats.skipped,
            output_path,
            output_size_bytes,
            backend: backend.name().to_string(),
            models: config.models.clone(),
            weight_sum,
            elapsed_secs: started.elapsed().as_secs_f64(),
            warnings,
        })
    }
}

fn provenance(models: &[ModelSpec]) -> BTreeMap<String, String> {
    let names = models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>().join(",");
    let weights = models
        .iter()
        .map(|m| m.weight.to_string())
        .collect::<Vec<_>>()
        .join(",");

    BTreeMap::from([
        ("ckmix.models".to_string(), names),
        ("ckmix.weights".to_string(), weights),
    ])
}

/// Run a merge with the backend chosen from `config.device` and no callback.
pub fn run_merge(config: &MergeConfig) -> Result<MergeReport> {
    MergeOrchestrator::new(config.clone()).run(&mut NullCallback)
}

/// Builder for creating merge configurations programmatically.
#[derive(Debug, Default)]
pub struct MergeBuilder {
    config: MergeConfig,
}

impl MergeBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory relative paths are resolved against.
    pub fn models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.models_dir = dir.into();
        self
    }

    /// Add a checkpoint with its weight.
    pub fn add_model(mut self, name: impl Into<String>, file: impl Into<PathBuf>, weight: f64) -> Self {
        self.config.models.push(ModelSpec::new(name, file, weight));
        self
    }

    /// Set the output path.
    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        self.config.output = path.as_ref().to_path_buf();
        self
    }

    /// Set the preferred device.
    pub fn device(mut self, device: DevicePreference) -> Self {
        self.config.device = device;
        self
    }

    /// Set how many keys pass between progress callbacks.
    pub fn progress_interval(mut self, interval: usize) -> Self {
        self.config.progress_interval = interval;
        self
    }

    /// Record model names and weights in the output header.
    pub fn record_provenance(mut self, enabled: bool) -> Self {
        self.config.record_provenance = enabled;
        self
    }

    /// Build the merge configuration.
    pub fn build(self) -> Result<MergeConfig> {
        if self.config.models.is_empty() {
            return Err(MergeError::Config("at least one model is required".to_string()));
        }
        Ok(self.config)
    }

    /// Build and run the merge.
    pub fn run(self) -> Result<MergeReport> {
        let config = self.build()?;
        run_merge(&config)
    }
}
