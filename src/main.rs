//! Rice Disease Model Export CLI
//!
//! Converts the trained checkpoint into the app's mobile artifact and label
//! file. Exit status: 0 trained artifact written, 2 untrained placeholder
//! written, 1 error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::info;

use rice_model_export::backend::backend_name;
use rice_model_export::pipeline::{EXIT_FAILURE, EXIT_PLACEHOLDER};
use rice_model_export::utils::logging::{init_logging, LogConfig};
use rice_model_export::utils::{format_bytes, format_duration, format_shape};
use rice_model_export::{
    validate_artifact, ExportConfig, LabelSet, FallbackPolicy, ModelArtifactPipeline, PipelineReport,
    SupportedOps, ValidationReport, WeightPrecision, BRIDGE_ENABLED,
};

/// Rice Disease Model Export
///
/// Converts the trained rice-disease CNN checkpoint into a mobile graph
/// artifact and labels file for the Android app.
#[derive(Parser, Debug)]
#[command(name = "rice_model_export")]
#[command(version)]
#[command(about = "Convert the rice-disease CNN into a mobile artifact", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Configuration file, TOML or `.json`; missing TOML keys keep their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute (defaults to `convert`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert the trained checkpoint (the default)
    Convert(ConvertArgs),

    /// Write the untrained placeholder model on purpose
    Placeholder(OutputArgs),

    /// Smoke-test an existing artifact
    Validate {
        /// Artifact to check (defaults to the configured asset path)
        #[arg(short, long)]
        artifact: Option<PathBuf>,
    },

    /// Write only the labels file
    Labels {
        /// App asset directory
        #[arg(long)]
        assets_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Args, Debug, Default)]
struct OutputArgs {
    /// App asset directory receiving the artifact and labels
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Weight storage precision (default f16)
    #[arg(long, value_enum)]
    precision: Option<PrecisionArg>,

    /// Disable int8 weight quantization under `--precision f32`
    #[arg(long, default_value = "false")]
    no_quantize: bool,

    /// Allow select operators in the artifact
    #[arg(long, default_value = "false")]
    select_ops: bool,
}

#[derive(Args, Debug, Default)]
struct ConvertArgs {
    /// Checkpoint stem or `.mpk.gz` record
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Which bridge failures may be answered with the placeholder
    #[arg(long, value_enum)]
    fallback: Option<FallbackArg>,

    /// Keep the intermediate interchange graph
    #[arg(long, default_value = "false")]
    keep_interchange: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FallbackArg {
    /// Only a missing converter
    BridgeUnavailable,
    /// A missing converter or a structural conversion failure
    AnyBridgeFailure,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PrecisionArg {
    F32,
    F16,
}

impl OutputArgs {
    fn apply(&self, config: &mut ExportConfig) {
        if let Some(dir) = &self.assets_dir {
            config.paths.assets_dir = dir.clone();
        }
        if let Some(precision) = self.precision {
            config.optimization.weight_precision = match precision {
                PrecisionArg::F32 => WeightPrecision::Float32,
                PrecisionArg::F16 => WeightPrecision::Float16,
            };
        }
        if self.no_quantize {
            config.optimization.default_quantization = false;
        }
        if self.select_ops {
            config.optimization.supported_ops = SupportedOps::BuiltinsAndSelect;
        }
    }
}

impl ConvertArgs {
    fn apply(&self, config: &mut ExportConfig) {
        if let Some(checkpoint) = &self.checkpoint {
            config.paths.checkpoint = checkpoint.clone();
        }
        if let Some(fallback) = self.fallback {
            config.fallback = match fallback {
                FallbackArg::BridgeUnavailable => FallbackPolicy::BridgeUnavailable,
                FallbackArg::AnyBridgeFailure => FallbackPolicy::AnyBridgeFailure,
            };
        }
        if self.keep_interchange {
            config.interchange.keep_file = true;
        }
        self.output.apply(config);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    // Keep `show-config` output pipeable
    if !matches!(cli.command, Some(Commands::ShowConfig)) {
        print_banner();
    }

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ExportConfig> {
    match path {
        Some(path) if path.extension().is_some_and(|ext| ext == "json") => {
            info!("Loading JSON configuration from {:?}", path);
            ExportConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))
        }
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Ok(ExportConfig::from_toml_file(path)?)
        }
        None => Ok(ExportConfig::default()),
    }
}

fn run(cli: Cli) -> Result<u8> {
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Convert(ConvertArgs::default())) {
        Commands::Convert(args) => {
            args.apply(&mut config);
            cmd_convert(config)
        }
        Commands::Placeholder(args) => {
            args.apply(&mut config);
            cmd_placeholder(config)
        }
        Commands::Validate { artifact } => {
            let path = artifact.unwrap_or_else(|| config.paths.artifact_path());
            cmd_validate(&config, &path)
        }
        Commands::Labels { assets_dir } => {
            if let Some(dir) = assets_dir {
                config.paths.assets_dir = dir;
            }
            cmd_labels(config)
        }
        Commands::ShowConfig => {
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(0)
        }
    }
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +------------------------------------------------------------+
 |   Rice Disease Model Export                                |
 |   Checkpoint -> mobile artifact + labels with Burn + Rust  |
 +------------------------------------------------------------+
  "#
        .green()
    );
}

fn cmd_convert(config: ExportConfig) -> Result<u8> {
    println!("{} {}", "Backend:".cyan(), backend_name());
    println!(
        "{} {}",
        "Checkpoint:".cyan(),
        config.paths.checkpoint_record_path().display()
    );
    if !BRIDGE_ENABLED {
        println!(
            "{} built without the `bridge` feature; only the placeholder can be produced",
            "Note:".yellow()
        );
    }

    let pipeline = ModelArtifactPipeline::with_defaults(config)?;
    let report = pipeline.run().context("Model conversion failed")?;
    print_report(&report, &pipeline.config().labels);
    Ok(report.exit_code())
}

fn cmd_placeholder(config: ExportConfig) -> Result<u8> {
    let pipeline = ModelArtifactPipeline::with_defaults(config)?;
    let report = pipeline
        .run_placeholder()
        .context("Placeholder generation failed")?;
    print_report(&report, &pipeline.config().labels);
    Ok(EXIT_PLACEHOLDER)
}

fn cmd_validate(config: &ExportConfig, path: &Path) -> Result<u8> {
    config.validate()?;
    let report = validate_artifact(path, config)?;
    print_validation(&report, &config.labels);

    let labels_path = path.with_file_name(&config.paths.labels_file);
    if labels_path.exists() {
        let written = LabelSet::read(&labels_path)?;
        if written != config.labels {
            println!(
                "{} {} lists {:?}, configuration expects {:?}",
                "WARNING:".yellow().bold(),
                labels_path.display(),
                written.iter().collect::<Vec<_>>(),
                config.labels.iter().collect::<Vec<_>>()
            );
        }
    }
    println!("\n{}", "Artifact is loadable and runs.".green().bold());
    Ok(0)
}

fn cmd_labels(config: ExportConfig) -> Result<u8> {
    let pipeline = ModelArtifactPipeline::with_defaults(config)?;
    let path = pipeline.write_labels()?;
    println!("{} {}", "Labels written to".green(), path.display());
    for (index, name) in pipeline.config().labels.iter().enumerate() {
        println!("  {}: {}", index, name);
    }
    Ok(0)
}

fn print_validation(report: &ValidationReport, labels: &LabelSet) {
    println!("\n{}", "Smoke Test".cyan().bold());
    println!("  Artifact:     {}", report.artifact.display());
    println!("  Origin:       {}", report.origin);
    println!("  Size:         {}", format_bytes(report.size_bytes));
    println!(
        "  Input:        {} (batch dynamic: {})",
        format_shape(&report.input_shape),
        report.input_signature.first() == Some(&-1)
    );
    println!(
        "  Output:       {} (batch dynamic: {})",
        format_shape(&report.output_shape),
        report.output_signature.first() == Some(&-1)
    );
    println!(
        "  Operators:    {} ({} select)",
        report.summary.operators, report.summary.select_operators
    );
    println!("  Parameters:   {}", report.summary.parameters);
    println!("  Precision:    {}", report.summary.precision);
    println!("  Sample:       {:?}", report.sample_output);
    if let Some((index, score)) = report.top_class() {
        println!(
            "  Top class:    {} ({:.4})",
            labels.get(index).unwrap_or("?"),
            score
        );
    }
}

fn print_report(report: &PipelineReport, labels: &LabelSet) {
    print_validation(&report.validation, labels);

    println!("\n{}", "Outputs".cyan().bold());
    println!("  Artifact:     {}", report.artifact_path.display());
    println!("  Labels:       {}", report.labels_path.display());
    if let Some(path) = &report.interchange_path {
        println!("  Interchange:  {}", path.display());
    }
    println!(
        "  Elapsed:      {} (finished {})",
        format_duration(report.elapsed_secs),
        report.finished_at
    );

    if report.is_placeholder() {
        println!(
            "\n{} the artifact is an UNTRAINED placeholder; predictions are random.",
            "WARNING:".yellow().bold()
        );
        if let Some(reason) = &report.fallback_reason {
            println!("  Reason: {}", reason);
        }
    } else {
        println!("\n{}", "Trained model converted successfully.".green().bold());
    }
}
