use std::{error::Error, path::PathBuf};

use clap::Parser;

use crate::config::BuildConfig;

pub mod build;
pub mod config;
pub mod counties;
pub mod crosswalk;
pub mod error;
pub mod metro;
pub mod output;
pub mod per_capita;

/// Builds CBSA and CSA housing statistics from county statistics.
#[derive(Parser, Debug)]
#[command(name = "metro-build", version)]
struct Args {
    /// County-level dataset (CSV)
    counties: PathBuf,

    /// County to CBSA/CSA crosswalk (NBER cbsa2fipsxw.csv layout)
    crosswalk: PathBuf,

    /// Directory receiving the snapshot, the metro list and the per-metro files
    out_dir: PathBuf,

    /// JSON file overriding the default build settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log per-metro detail
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(verbose)
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => BuildConfig::load(path)?,
        None => BuildConfig::default(),
    };

    let summary = build::run_build(&args.counties, &args.crosswalk, &args.out_dir, &config)?;

    log::info!(
        "Built {} metro rows: {} metros in the list, {} per-metro files in {}",
        summary.rows,
        summary.index_entries,
        summary.shards,
        args.out_dir.display()
    );

    Ok(())
}
