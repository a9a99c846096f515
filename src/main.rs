//! sadasadam command line interface
//!
//! Runs the pipeline described by a YAML configuration file.

use anyhow::Context;
use clap::Parser;
use sadasadam::{Config, Pipeline, PipelineError, RunSummary};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "sadasadam")]
#[command(
    about = "Same-day Sentinel-2 and Landsat clear-sky mosaics with FORCE",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<RunSummary> {
    let settings = Config::load(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;

    Ok(Pipeline::new(settings).run()?)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(e) if e.is_configuration() => 2,
        _ => 1,
    }
}

fn main() {
    // verbosity through RUST_LOG, e.g. RUST_LOG=debug
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(&args) {
        Ok(summary) => {
            print!("{}", summary);
            if summary.has_failures() {
                log::warn!("Run finished with failures, see the summary above");
            }
        }
        Err(e) => {
            log::error!("{:#}", e);
            process::exit(exit_code(&e));
        }
    }
}
