//! Subcommand implementations.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use posecvt::{
    ArtifactStore, ConversionConfig, ConvertError, OperatorProfile, OptimizationMode,
    PipelineBuilder, PublishTarget, Representation, SizeCheckPolicy, StrategyOrder,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{ConvertArgs, InspectArgs, OptimizeArg, ProfileArg, StoreArgs, TargetArg};

/// Exit status for an interrupted run (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

fn load_config(store: &StoreArgs) -> Result<ConversionConfig> {
    match &store.config {
        Some(path) => ConversionConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ConversionConfig::default()),
    }
}

fn apply_overrides(config: &mut ConversionConfig, args: &ConvertArgs) {
    if let Some(size) = args.image_size {
        config.image_size = size;
    }
    if let Some(opset) = args.opset {
        config.opset = opset;
    }
    if let Some(profile) = args.profile {
        config.operator_profile = match profile {
            ProfileArg::Strict => OperatorProfile::Strict,
            ProfileArg::Permissive => OperatorProfile::Permissive,
        };
    }
    if let Some(optimize) = args.optimize {
        config.optimization = match optimize {
            OptimizeArg::None => OptimizationMode::None,
            OptimizeArg::Size => OptimizationMode::Size,
            OptimizeArg::Latency => OptimizationMode::Latency,
        };
    }
    if args.no_shortcut {
        config.shortcut = false;
    }
    if args.fallback_first {
        config.strategy_order = StrategyOrder::FallbackFirst;
    }
    if let Some(target) = args.target {
        config.publish_target = match target {
            TargetArg::Tflite => PublishTarget::Mobile,
            TargetArg::Onnx => PublishTarget::IntermediateGraph,
        };
    }
    if let Some(python) = &args.python {
        config.python = python.clone();
    }
    if let Some(min) = args.min_size_bytes {
        config.min_artifact_bytes = min;
    }
    if args.reject_suspect {
        config.size_check = SizeCheckPolicy::Reject;
    }
}

pub async fn convert(args: ConvertArgs) -> Result<ExitCode> {
    let mut config = load_config(&args.store)?;
    apply_overrides(&mut config, &args);

    let mut builder = PipelineBuilder::new(&args.store.assets_dir).config(config);
    if let Some(work_dir) = &args.work_dir {
        builder = builder.work_dir(work_dir);
    }
    let pipeline = builder.build()?;

    let name = &args.store.name;
    let input = args
        .input
        .clone()
        .unwrap_or_else(|| pipeline.assets().path_for(Representation::Native, name));
    info!("Converting {} as {}", input.display(), name);

    let result = tokio::select! {
        result = pipeline.run(&input, name) => result,
        _ = tokio::signal::ctrl_c() => Err(ConvertError::Cancelled),
    };

    let run = match result {
        Ok(run) => run,
        Err(ConvertError::Cancelled) => {
            warn!("Interrupted; nothing was published");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("{}", run.to_json()?);
    if let Some(report) = &args.report {
        run.save(report)
            .with_context(|| format!("writing report to {}", report.display()))?;
    }

    Ok(if run.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub fn inspect(args: InspectArgs) -> Result<ExitCode> {
    let config = load_config(&args.store)?;
    let report = inspect_store(&args.store.assets_dir, &args.store.name, &config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

/// Describe what the store holds for `name` without changing anything.
fn inspect_store(assets_dir: &Path, name: &str, config: &ConversionConfig) -> Result<serde_json::Value> {
    if !assets_dir.is_dir() {
        anyhow::bail!("asset directory {} does not exist", assets_dir.display());
    }
    let store = ArtifactStore::open(assets_dir)?;

    let artifacts: Vec<_> = store
        .list(name)?
        .iter()
        .map(|artifact| {
            let suspect = artifact.representation() == Representation::Mobile
                && artifact.size_bytes() < config.min_artifact_bytes;
            json!({
                "representation": artifact.representation(),
                "path": artifact.path(),
                "size_bytes": artifact.size_bytes(),
                "valid": artifact.validate().is_ok(),
                "suspect": suspect,
            })
        })
        .collect();

    Ok(json!({
        "model_name": name,
        "assets_dir": store.root(),
        "min_artifact_bytes": config.min_artifact_bytes,
        "artifacts": artifacts,
    }))
}
