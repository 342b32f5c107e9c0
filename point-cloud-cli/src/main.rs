//! `pcp`: run a point cloud pipeline described by a JSON file.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

#[derive(Parser)]
#[command(name = "pcp", about = "Process point clouds through a declarative pipeline")]
struct Cli {
    /// Path to the pipeline JSON (native or drawflow form).
    pipeline: PathBuf,
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let text = fs::read_to_string(&cli.pipeline)
        .with_context(|| format!("could not open the json file {}", cli.pipeline.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid json in {}", cli.pipeline.display()))?;

    point_cloud_pipeline::execute(&doc)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}
