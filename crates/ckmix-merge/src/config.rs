//! Configuration types for checkpoint merging.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{MergeError, Result};

/// Tolerance on `|Σ weight - 1|` before a warning is emitted.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Complete merge configuration, typically loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Directory that relative model and output paths are resolved against.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Output checkpoint path.
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Preferred compute device.
    #[serde(default)]
    pub device: DevicePreference,

    /// Number of keys between progress callbacks.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,

    /// Share of single-source or skipped keys above which the run warns
    /// that little actual blending took place.
    #[serde(default = "default_low_overlap_warn_ratio")]
    pub low_overlap_warn_ratio: f64,

    /// Record merged model names and weights in the output `__metadata__`.
    #[serde(default)]
    pub record_provenance: bool,

    /// Checkpoints to merge, in merge order.
    pub models: Vec<ModelSpec>,
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_output() -> PathBuf {
    PathBuf::from("merged_sdxl.safetensors")
}

fn default_progress_interval() -> usize {
    100
}

fn default_low_overlap_warn_ratio() -> f64 {
    0.1
}

/// One input checkpoint and its merge weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Unique label used in progress output and reports.
    pub name: String,

    /// Checkpoint file, relative to `models_dir` unless absolute.
    pub file: PathBuf,

    /// Coefficient applied to this checkpoint's tensors.
    pub weight: f64,
}

impl ModelSpec {
    /// Create a model spec.
    pub fn new(name: impl Into<String>, file: impl Into<PathBuf>, weight: f64) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            weight,
        }
    }

    /// Parse the `NAME=FILE:WEIGHT` shorthand used on the command line.
    ///
    /// The weight is split off at the last `:` so file names may contain colons.
    pub fn parse(s: &str) -> Result<Self> {
        let (name, rest) = s.split_once('=').ok_or_else(|| {
            MergeError::Config(format!("expected NAME=FILE:WEIGHT, got '{s}'"))
        })?;
        let (file, weight) = rest.rsplit_once(':').ok_or_else(|| {
            MergeError::Config(format!("missing ':WEIGHT' in '{s}'"))
        })?;
        let weight: f64 = weight
            .trim()
            .parse()
            .map_err(|_| MergeError::Config(format!("invalid weight '{weight}' in '{s}'")))?;

        if name.trim().is_empty() || file.trim().is_empty() {
            return Err(MergeError::Config(format!(
                "empty name or file in '{s}'"
            )));
        }

        Ok(Self::new(name.trim(), file.trim(), weight))
    }
}

/// Which compute device the weighted sum should run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use an accelerator when one is present, otherwise the CPU.
    #[default]
    Auto,
    /// Always use the CPU.
    Cpu,
    /// Prefer CUDA device 0.
    Cuda,
    /// Prefer the default Metal device.
    Metal,
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        };
        f.write_str(s)
    }
}

impl FromStr for DevicePreference {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            other => Err(MergeError::Config(format!("unknown device '{other}'"))),
        }
    }
}

impl MergeConfig {
    /// Create a configuration with default settings and no models.
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| MergeError::io(path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Full path of a model's checkpoint file.
    pub fn model_path(&self, model: &ModelSpec) -> PathBuf {
        resolve(&self.models_dir, &model.file)
    }

    /// Full path of the output checkpoint.
    pub fn output_path(&self) -> PathBuf {
        resolve(&self.models_dir, &self.output)
    }

    /// Sum of all model weights.
    pub fn weight_sum(&self) -> f64 {
        self.models.iter().map(|m| m.weight).sum()
    }

    /// Whether the weights add up to roughly one.
    pub fn weights_normalized(&self) -> bool {
        (self.weight_sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE
    }

    /// Validate the configuration.
    ///
    /// Weights outside `(0, 1]` or not summing to one are accepted; only
    /// structurally unusable configurations are rejected.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(MergeError::Config("at least one model is required".to_string()));
        }

        if self.progress_interval == 0 {
            return Err(MergeError::Config(
                "progress_interval must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(MergeError::Config(format!(
                    "duplicate model name '{}'",
                    model.name
                )));
            }

            if !model.weight.is_finite() {
                return Err(MergeError::Config(format!(
                    "weight for '{}' is not a finite number",
                    model.name
                )));
            }

            let path = self.model_path(model);
            if !path.is_file() {
                return Err(MergeError::Config(format!(
                    "checkpoint for '{}' not found: {}",
                    model.name,
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            output: default_output(),
            device: DevicePreference::default(),
            progress_interval: default_progress_interval(),
            low_overlap_warn_ratio: default_low_overlap_warn_ratio(),
            record_provenance: false,
            models: Vec::new(),
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
models_dir: /data/models
output: out/merged.safetensors
device: cpu
models:
  - name: jake
    file: "JakeSubwaySurfer1-10 (4).safetensors"
    weight: 0.6
  - name: realvis
    file: realvis.safetensors
    weight: 0.4
"#;

        let config = MergeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.device, DevicePreference::Cpu);
        assert_eq!(config.progress_interval, 100);
        assert!(!config.record_provenance);
        assert_eq!(
            config.model_path(&config.models[0]),
            PathBuf::from("/data/models/JakeSubwaySurfer1-10 (4).safetensors")
        );
        assert_eq!(
            config.output_path(),
            PathBuf::from("/data/models/out/merged.safetensors")
        );
        assert!(config.weights_normalized());
    }

    #[test]
    fn test_defaults_when_omitted() {
        let config = MergeConfig::from_yaml("models: []").unwrap();
        assert_eq!(config.models_dir, PathBuf::from("models"));
        assert_eq!(config.output, PathBuf::from("merged_sdxl.safetensors"));
        assert_eq!(config.device, DevicePreference::Auto);
    }

    #[test]
    fn test_empty_models_rejected() {
        let config = MergeConfig::default();
        assert!(matches!(config.validate(), Err(MergeError::Config(_))));
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MergeConfig::new(dir.path());
        config.models.push(ModelSpec::new("a", "missing.safetensors", 1.0));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing.safetensors"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), b"").unwrap();

        let mut config = MergeConfig::new(dir.path());
        config.models.push(ModelSpec::new("a", "a.safetensors", 0.5));
        config.models.push(ModelSpec::new("a", "a.safetensors", 0.5));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_out_of_range_weights_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), b"").unwrap();

        let mut config = MergeConfig::new(dir.path());
        config.models.push(ModelSpec::new("a", "a.safetensors", 1.7));

        assert!(config.validate().is_ok());
        assert!(!config.weights_normalized());
    }

    #[test]
    fn test_nan_weight_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.safetensors"), b"").unwrap();

        let mut config = MergeConfig::new(dir.path());
        config.models.push(ModelSpec::new("a", "a.safetensors", f64::NAN));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_spec_shorthand() {
        let spec = ModelSpec::parse("jake=JakeSubwaySurfer1-10 (4).safetensors:0.6").unwrap();
        assert_eq!(spec.name, "jake");
        assert_eq!(spec.file, PathBuf::from("JakeSubwaySurfer1-10 (4).safetensors"));
        assert_eq!(spec.weight, 0.6);

        let spec = ModelSpec::parse("w=C:/models/a.safetensors:0.25").unwrap();
        assert_eq!(spec.file, PathBuf::from("C:/models/a.safetensors"));
        assert_eq!(spec.weight, 0.25);

        assert!(ModelSpec::parse("no-equals").is_err());
        assert!(ModelSpec::parse("a=file.safetensors").is_err());
        assert!(ModelSpec::parse("a=file.safetensors:heavy").is_err());
    }

    #[test]
    fn test_device_preference_from_str() {
        assert_eq!("CUDA".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("mps".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }
}
