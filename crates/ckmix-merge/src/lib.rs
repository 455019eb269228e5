//! Weighted linear merging of safetensors checkpoints.
//!
//! Given N checkpoints and one weight per checkpoint, every tensor key in the
//! union of the inputs becomes
//!
//! ```text
//! merged[k] = Σ weight_i * checkpoint_i[k]
//! ```
//!
//! summed over the checkpoints that hold `k` with a compatible shape. Output
//! is a single safetensors file with deterministic key order, written
//! atomically.
//!
//! # Pieces
//!
//! - [`CheckpointReader`]: memory-mapped, lazily decoded input
//! - [`WeightedAccumulator`]: the per-key sum with shape checks
//! - [`CheckpointWriter`]: safetensors output with stable key order
//! - [`MergeOrchestrator`]: drives a configured run and reports on it
//!
//! # Example
//!
//! ```ignore
//! use ckmix_merge::MergeBuilder;
//!
//! let report = MergeBuilder::new()
//!     .models_dir("models")
//!     .add_model("jake", "jake.safetensors", 0.6)
//!     .add_model("realvis", "realvis.safetensors", 0.4)
//!     .output("merged_sdxl.safetensors")
//!     .run()?;
//!
//! println!("{} keys merged", report.keys_merged);
//! ```

#![warn(missing_docs)]

mod accumulate;
mod backend;
mod config;
mod error;
mod loader;
mod merge;
mod progress;
pub mod tensor;
mod writer;

pub use accumulate::*;
pub use backend::*;
pub use config::*;
pub use error::*;
pub use loader::*;
pub use merge::*;
pub use progress::*;
pub use tensor::{TensorEntry, TensorMap};
pub use writer::*;

/// Re-exported so callers can name element types without a direct dependency.
pub use safetensors::Dtype;
