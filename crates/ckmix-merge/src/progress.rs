//! Progress callbacks for merge runs.

use std::path::Path;

use crate::{MergeState, SkippedKey};

/// Callback trait for merge events.
///
/// Every method has a no-op default, so implementors only override what
/// they display.
pub trait MergeCallback {
    /// Called on every state transition.
    fn on_state(&mut self, _state: &MergeState) {}

    /// Called before checkpoint `index` (0-based) of `total` is opened.
    fn on_load_start(&mut self, _index: usize, _total: usize, _name: &str, _path: &Path) {}

    /// Called while a checkpoint's tensors are being indexed.
    fn on_load_progress(&mut self, _index: usize, _indexed: usize, _tensors: usize) {}

    /// Called once a checkpoint is open.
    fn on_load_end(&mut self, _index: usize, _name: &str, _tensors: usize) {}

    /// Called before accumulation with the size of the key union.
    fn on_merge_start(&mut self, _keys_total: usize) {}

    /// Called every `progress_interval` keys and after the last key.
    fn on_merge_progress(&mut self, _done: usize, _total: usize, _merged: usize, _skipped: usize) {}

    /// Called for every skipped contribution.
    fn on_skip(&mut self, _skip: &SkippedKey) {}

    /// Called before the output is written.
    fn on_save_start(&mut self, _path: &Path) {}

    /// Called after the output is in place.
    fn on_save_end(&mut self, _path: &Path, _bytes: u64) {}

    /// Called for run-level warnings (weight sum, low overlap).
    fn on_warning(&mut self, _message: &str) {}
}

/// Callback that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCallback;

impl MergeCallback for NullCallback {}

/// Callback that records events as strings, for assertions in tests.
///
/// Only built for this crate's unit tests or with the `test-utils` feature.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingCallback {
    /// Events in arrival order.
    pub events: Vec<String>,
}

#[cfg(any(test, feature = "test-utils"))]
impl RecordingCallback {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<&str> {
        self.events
            .iter()
            .map(String::as_str)
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl MergeCallback for RecordingCallback {
    fn on_state(&mut self, state: &MergeState) {
        self.events.push(format!("state {state}"));
    }

    fn on_load_start(&mut self, index: usize, total: usize, name: &str, _path: &Path) {
        self.events.push(format!("load_start {}/{} {name}", index + 1, total));
    }

    fn on_load_progress(&mut self, index: usize, indexed: usize, tensors: usize) {
        self.events.push(format!("load_progress {index} {indexed}/{tensors}"));
    }

    fn on_load_end(&mut self, index: usize, name: &str, tensors: usize) {
        self.events.push(format!("load_end {index} {name} {tensors}"));
    }

    fn on_merge_start(&mut self, keys_total: usize) {
        self.events.push(format!("merge_start {keys_total}"));
    }

    fn on_merge_progress(&mut self, done: usize, total: usize, merged: usize, skipped: usize) {
        self.events
            .push(format!("merge_progress {done}/{total} merged={merged} skipped={skipped}"));
    }

    fn on_skip(&mut self, skip: &SkippedKey) {
        self.events
            .push(format!("skip {} {} {}", skip.key, skip.model, skip.reason));
    }

    fn on_save_start(&mut self, _path: &Path) {
        self.events.push("save_start".to_string());
    }

    fn on_save_end(&mut self, _path: &Path, bytes: u64) {
        self.events.push(format!("save_end {bytes}"));
    }

    fn on_warning(&mut self, message: &str) {
        self.events.push(format!("warning {message}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_filters_by_prefix() {
        let mut recorder = RecordingCallback::new();
        recorder.on_save_start(Path::new("out.safetensors"));
        recorder.on_warning("weights sum to 1.40");
        recorder.on_save_end(Path::new("out.safetensors"), 128);

        assert_eq!(recorder.matching("save"), vec!["save_start", "save_end 128"]);
        assert_eq!(recorder.matching("warning"), vec!["warning weights sum to 1.40"]);
        assert!(recorder.matching("skip").is_empty());
    }
}
