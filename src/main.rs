//! Batch converter that turns a patient/subject/session/case tree of DICOM
//! series into compressed NIfTI volumes.
//!
//! Conversion is either delegated to the external dcm2niix tool or done
//! in-process by stacking slice pixel data; both strategies share the same
//! traversal, resume/skip behavior, and failure reporting.
mod cache;
mod config;
mod converter;
mod processor;
mod stacker;
mod walker;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

use crate::config::{load_runtime_config, EffectiveConfig, RuntimeConfigFile, DEFAULT_CONFIG_PATH};
use crate::processor::{run_batch, BatchOptions, Strategy};

#[derive(Parser)]
#[command(name = "dicom_nifti_cli")]
#[command(about = "Batch DICOM to NIfTI Converter", long_about = None)]
/// Entry CLI that dispatches to subcommands.
struct Cli {
    /// Optional runtime config in TOML that supplies defaults for the CLI.
    #[arg(short, long, help = "TOML config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delegate each case to dcm2niix (maps to the legacy external-tool scripts)
    External(ExternalArgs),
    /// Stack slice pixel data in-process and write the volume directly
    Stack(StackArgs),
}

#[derive(Args, Clone)]
struct SharedArgs {
    /// Root directory of the patient/Subject_N/Session_M/case DICOM tree.
    #[arg(long = "dicom_dir")]
    dicom_dir: PathBuf,

    /// Root directory receiving the per-patient NIfTI output folders.
    #[arg(long = "nifti_dir")]
    nifti_dir: PathBuf,

    /// Skip patient subtrees below the highest patient number already in nifti_dir.
    #[arg(long)]
    resume: bool,

    /// Drop the OS filesystem cache after every N successful conversions (0 disables).
    #[arg(long)]
    clear_cache_every: Option<u64>,

    /// Terminate the whole process once N conversions succeed in this run.
    #[arg(long)]
    stop_after: Option<u64>,

    /// Where to append per-case failure lines (truncated at run start).
    #[arg(long)]
    error_log: Option<PathBuf>,

    /// Where to write the end-of-run failed-case table.
    #[arg(long)]
    error_csv: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct ExternalArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Path to the dcm2niix executable.
    #[arg(long)]
    dcm2niix: Option<String>,
}

#[derive(Args, Clone)]
struct StackArgs {
    #[command(flatten)]
    shared: SharedArgs,
}

/// Entrypoint that wires CLI args, runtime config, and the batch run loop.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let cfg_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Commands::External(cmd) => run_external(cmd, &cfg_path).await,
        Commands::Stack(cmd) => run_stack(cmd, &cfg_path).await,
    }
}

/// Merge CLI overrides with a parsed runtime config, falling back to crate defaults.
///
/// CLI flags take precedence, followed by the runtime file, and finally
/// `EffectiveConfig::defaults()`.
fn merge_config(cli: &SharedArgs, file: Option<RuntimeConfigFile>) -> EffectiveConfig {
    let mut cfg = EffectiveConfig::defaults();
    let f = file.unwrap_or_default();

    cfg.dcm2niix_path = f.dcm2niix_path.unwrap_or(cfg.dcm2niix_path);
    cfg.dcm2niix_args = f.dcm2niix_args.unwrap_or(cfg.dcm2niix_args);
    cfg.clear_cache_every = cli
        .clear_cache_every
        .or(f.clear_cache_every)
        .unwrap_or(cfg.clear_cache_every);
    cfg.stop_after = cli.stop_after.or(f.stop_after).or(cfg.stop_after);
    cfg.error_log = cli.error_log.clone().or(f.error_log).unwrap_or(cfg.error_log);
    cfg.error_csv = cli.error_csv.clone().or(f.error_csv).unwrap_or(cfg.error_csv);

    cfg
}

fn batch_options(cli: &SharedArgs, cfg: &EffectiveConfig) -> BatchOptions {
    BatchOptions {
        dicom_dir: cli.dicom_dir.clone(),
        nifti_dir: cli.nifti_dir.clone(),
        resume: cli.resume,
        clear_cache_every: cfg.clear_cache_every,
        stop_after: cfg.stop_after,
        error_log: cfg.error_log.clone(),
        error_csv: cfg.error_csv.clone(),
    }
}

async fn run_external(args: ExternalArgs, cfg_path: &PathBuf) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let mut effective = merge_config(&args.shared, runtime_file);
    if let Some(path) = args.dcm2niix {
        effective.dcm2niix_path = path;
    }

    if !converter::check_dcm2niix_available(&effective.dcm2niix_path) {
        bail!(
            "dcm2niix not found at {:?}; install it or point --dcm2niix at the executable",
            effective.dcm2niix_path
        );
    }

    let strategy = Strategy::External {
        dcm2niix_path: effective.dcm2niix_path.clone(),
        extra_args: effective.dcm2niix_args.clone(),
    };
    let options = batch_options(&args.shared, &effective);

    println!(
        "Converting {} via dcm2niix into {}...",
        options.dicom_dir.display(),
        options.nifti_dir.display()
    );
    let summary = run_batch(&strategy, &options).await?;
    print_summary(&summary);
    Ok(())
}

async fn run_stack(args: StackArgs, cfg_path: &PathBuf) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let effective = merge_config(&args.shared, runtime_file);
    let options = batch_options(&args.shared, &effective);

    println!(
        "Converting {} by in-process stacking into {}...",
        options.dicom_dir.display(),
        options.nifti_dir.display()
    );
    let summary = run_batch(&Strategy::Stacked, &options).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &processor::RunSummary) {
    println!(
        "Summary: {} converted, {} skipped, {} failed.",
        summary.converted.to_string().green(),
        summary.skipped,
        summary.failed.to_string().red()
    );
}
