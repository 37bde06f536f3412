//! posecvt - convert a pose checkpoint into the app's mobile asset.
//!
//! `posecvt convert` runs the pipeline and prints the outcome record as JSON
//! on stdout. The exit status is zero only when the model was published.
//! `posecvt inspect` reports what the asset directory currently holds.

mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "posecvt")]
#[command(about = "Convert pose models into mobile inference assets")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a native checkpoint and publish it to the asset directory
    Convert(ConvertArgs),
    /// List the representations stored for a model
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone)]
struct StoreArgs {
    /// Asset directory the downstream app reads from
    #[arg(long, default_value = "app/src/main/assets")]
    assets_dir: PathBuf,

    /// Logical model name; files are stored as <name>.<ext>
    #[arg(short, long, default_value = "yolov8n_pose")]
    name: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Native checkpoint (defaults to <assets-dir>/<name>.pt)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory for converter scripts and scratch files
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Square input resolution
    #[arg(long)]
    image_size: Option<u32>,

    /// Operator-set version of the intermediate graph
    #[arg(long)]
    opset: Option<u32>,

    /// Operator-support profile of the mobile compiler
    #[arg(long, value_enum)]
    profile: Option<ProfileArg>,

    /// Numeric optimization of the mobile artifact
    #[arg(long, value_enum)]
    optimize: Option<OptimizeArg>,

    /// Skip the single-shot native-to-mobile attempt
    #[arg(long)]
    no_shortcut: bool,

    /// Try each transition's fallback strategy before its preferred one
    #[arg(long)]
    fallback_first: bool,

    /// Representation to publish
    #[arg(long, value_enum)]
    target: Option<TargetArg>,

    /// Python interpreter for the converter scripts
    #[arg(long)]
    python: Option<String>,

    /// Outputs smaller than this are treated as suspect
    #[arg(long)]
    min_size_bytes: Option<u64>,

    /// Fail a strategy whose output is suspect instead of warning
    #[arg(long)]
    reject_suspect: bool,

    /// Also write the outcome record to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[command(flatten)]
    store: StoreArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ProfileArg {
    Strict,
    Permissive,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum OptimizeArg {
    None,
    Size,
    Latency,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum TargetArg {
    Tflite,
    Onnx,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    logging::init_tracing(cli.json_logs, log_level);

    match cli.command {
        Command::Convert(args) => commands::convert(args).await,
        Command::Inspect(args) => commands::inspect(args),
    }
}
