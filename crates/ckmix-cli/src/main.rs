//! ckmix CLI - weighted merging of safetensors checkpoints.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ckmix_merge::{
    available_accelerators, CheckpointReader, DevicePreference, MergeCallback, MergeConfig,
    MergeOrchestrator, MergeReport, ModelSpec, SkippedKey,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(name = "ckmix")]
#[command(author, version, about = "Weighted linear merging of safetensors checkpoints", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge checkpoints with per-model weights
    Merge {
        /// Path to a YAML merge configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Model as NAME=FILE:WEIGHT; repeat for each model (replaces models from --config)
        #[arg(short, long = "model", value_name = "NAME=FILE:WEIGHT")]
        models: Vec<String>,

        /// Directory relative model and output paths are resolved against
        #[arg(long)]
        models_dir: Option<PathBuf>,

        /// Output checkpoint path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compute device (auto, cpu, cuda, metal)
        #[arg(long)]
        device: Option<DevicePreference>,

        /// Record model names and weights in the output header
        #[arg(long)]
        provenance: bool,

        /// Write the merge report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show a summary of a checkpoint
    Info {
        /// Checkpoint file
        file: PathBuf,
    },

    /// List usable compute backends
    Backends,

    /// Write a sample merge configuration
    Init {
        /// Output path for the configuration
        #[arg(default_value = "merge.yaml")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Merge {
            config,
            models,
            models_dir,
            output,
            device,
            provenance,
            report,
        } => {
            let config = build_merge_config(config.as_deref(), &models, models_dir, output, device, provenance)?;
            run_merge_command(config, report.as_deref())
        }
        Commands::Info { file } => run_info(&file),
        Commands::Backends => {
            print_backends();
            Ok(())
        }
        Commands::Init { output } => generate_sample_config(&output),
    }
}

/// Combine the optional YAML file with command-line overrides.
fn build_merge_config(
    config_path: Option<&Path>,
    models: &[String],
    models_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    device: Option<DevicePreference>,
    provenance: bool,
) -> anyhow::Result<MergeConfig> {
    let mut config = match config_path {
        Some(path) => MergeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MergeConfig::default(),
    };

    if !models.is_empty() {
        config.models = models
            .iter()
            .map(|m| ModelSpec::parse(m))
            .collect::<Result<Vec<_>, _>>()?;
    }
    if let Some(dir) = models_dir {
        config.models_dir = dir;
    }
    if let Some(output) = output {
        config.output = output;
    }
    if let Some(device) = device {
        config.device = device;
    }
    if provenance {
        config.record_provenance = true;
    }

    if config.models.is_empty() {
        anyhow::bail!("No models given; pass --config FILE or --model NAME=FILE:WEIGHT");
    }

    Ok(config)
}

fn run_merge_command(config: MergeConfig, report_path: Option<&Path>) -> anyhow::Result<()> {
    println!("========================================");
    println!("  ckmix Merge");
    println!("========================================");
    println!("Models dir: {}", config.models_dir.display());
    println!("Output:     {}", config.output_path().display());
    println!("Device:     {}", config.device);
    println!();
    for model in &config.models {
        println!("  {}: {:.0}% weight", model.name, model.weight * 100.0);
    }
    println!("========================================\n");

    let mut progress = CliProgress::default();
    let report = MergeOrchestrator::new(config).run(&mut progress)?;

    print_report(&report);

    if let Some(path) = report_path {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        println!("Report written to: {}", path.display());
    }

    Ok(())
}

fn print_report(report: &MergeReport) {
    println!("\n========================================");
    println!("  Merge Complete");
    println!("========================================");
    println!("Keys:          {}", report.keys_total);
    println!("Merged:        {}", report.keys_merged);
    println!("Single-source: {}", report.keys_single_source);
    println!("Skipped:       {}", report.keys_skipped);
    println!("Backend:       {}", report.backend);
    println!("Output:        {}", report.output_path.display());
    println!("Size:          {:.2} GB", report.output_size_gb());
    println!("Time:          {:.1}s", report.elapsed_secs);

    if !report.skipped.is_empty() {
        println!("\nSkipped contributions:");
        for skip in &report.skipped {
            println!("  {}", describe_skip(skip));
        }
    }

    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  {}", warning);
        }
    }
    println!("========================================");
}

fn describe_skip(skip: &SkippedKey) -> String {
    format!(
        "{} from {} ({}: expected {:?}, got {:?})",
        skip.key, skip.model, skip.reason, skip.expected_shape, skip.actual_shape
    )
}

fn run_info(file: &Path) -> anyhow::Result<()> {
    let reader = CheckpointReader::open(file)?;
    let info = reader.info();

    println!("========================================");
    println!("  {}", info.path.display());
    println!("========================================");
    println!("Tensors:    {}", info.tensor_count);
    println!(
        "Parameters: {} ({:.2}B)",
        format_param_count(info.parameter_count),
        info.parameters_billions()
    );
    println!(
        "Size:       {:.2} GB",
        info.file_size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    );
    println!("Dtypes:");
    for (dtype, count) in &info.dtypes {
        println!("  {:?}: {}", dtype, count);
    }
    println!("First keys:");
    for key in &info.sample_keys {
        println!("  {}", key);
    }
    if !reader.metadata().is_empty() {
        println!("Metadata:");
        let mut entries: Vec<_> = reader.metadata().iter().collect();
        entries.sort();
        for (key, value) in entries {
            println!("  {}: {}", key, value);
        }
    }

    Ok(())
}

fn print_backends() {
    let found = available_accelerators();

    println!("cpu:   available");
    for (device, compiled) in [
        (DevicePreference::Cuda, cfg!(feature = "cuda")),
        (DevicePreference::Metal, cfg!(feature = "metal")),
    ] {
        let status = if found.contains(&device) {
            "available"
        } else if compiled {
            "no device found"
        } else {
            "not compiled in"
        };
        println!("{:<6} {}", format!("{}:", device), status);
    }
}

fn generate_sample_config(output: &Path) -> anyhow::Result<()> {
    let config = MergeConfig {
        models: vec![
            ModelSpec::new("jake", "JakeSubwaySurfer1-10 (4).safetensors", 0.6),
            ModelSpec::new("realvis", "realvisxlV50_v50LightningBakedvae.safetensors", 0.4),
        ],
        ..Default::default()
    };

    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(output, yaml).with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Sample configuration written to: {}", output.display());
    println!("\nEdit the model list and run the merge with:");
    println!("  ckmix merge --config {}", output.display());

    Ok(())
}

/// Format parameter count with suffix (K, M, B).
fn format_param_count(count: u64) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        format!("{}", count)
    }
}

/// Progress bars for a merge run: one per loaded file, one for merging and a
/// spinner while saving.
#[derive(Default)]
struct CliProgress {
    bar: Option<ProgressBar>,
}

impl CliProgress {
    fn start_bar(&mut self, len: u64, prefix: String) -> &ProgressBar {
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:>12} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(prefix);
        self.bar.insert(bar)
    }

    fn println(&self, line: String) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => eprintln!("{line}"),
        }
    }
}

impl MergeCallback for CliProgress {
    fn on_load_start(&mut self, index: usize, total: usize, name: &str, _path: &Path) {
        let bar = self.start_bar(0, format!("[{}/{}]", index + 1, total));
        bar.set_message(name.to_string());
    }

    fn on_load_progress(&mut self, _index: usize, indexed: usize, tensors: usize) {
        if let Some(bar) = &self.bar {
            bar.set_length(tensors as u64);
            bar.set_position(indexed as u64);
        }
    }

    fn on_load_end(&mut self, _index: usize, name: &str, tensors: usize) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(format!("{name}: {tensors} tensors"));
        }
    }

    fn on_merge_start(&mut self, keys_total: usize) {
        let bar = self.start_bar(keys_total as u64, "merging".to_string());
        bar.set_message("");
    }

    fn on_merge_progress(&mut self, done: usize, _total: usize, merged: usize, skipped: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(done as u64);
            bar.set_message(format!("{merged} merged, {skipped} skipped"));
        }
    }

    fn on_skip(&mut self, skip: &SkippedKey) {
        self.println(format!("  skipped {}", describe_skip(skip)));
    }

    fn on_save_start(&mut self, path: &Path) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("Saving {}", path.display()));
        spinner.enable_steady_tick(std::time::Duration::from_millis(120));
        self.bar = Some(spinner);
    }

    fn on_save_end(&mut self, path: &Path, bytes: u64) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!(
                "Saved {} ({:.2} GB)",
                path.display(),
                bytes as f64 / (1024.0 * 1024.0 * 1024.0)
            ));
        }
    }

    fn on_warning(&mut self, message: &str) {
        self.println(format!("warning: {message}"));
    }
}
