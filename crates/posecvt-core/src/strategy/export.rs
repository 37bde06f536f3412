//! Strategies that start from the native checkpoint.

use std::ffi::OsString;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::scripts::Script;
use super::{
    collect_output, ConversionParams, ConversionStrategy, ScriptRunner, StrategyContext,
    Transition,
};
use crate::artifact::{ModelArtifact, Representation};
use crate::config::OptimizationMode;
use crate::dependency::Dependency;
use crate::Result;

/// Native checkpoint to intermediate graph through the ultralytics exporter.
pub struct UltralyticsOnnxExport {
    runner: Arc<ScriptRunner>,
}

impl UltralyticsOnnxExport {
    pub const NAME: &'static str = "ultralytics-onnx";

    pub fn new(runner: Arc<ScriptRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConversionStrategy for UltralyticsOnnxExport {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transition(&self) -> Transition {
        Transition::EXPORT
    }

    fn required_dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::named("ultralytics"), Dependency::named("onnx")]
    }

    /// The exporter never quantizes.
    fn weight_precision(&self, _params: &ConversionParams) -> &'static str {
        "float32"
    }

    async fn convert(
        &self,
        source: &ModelArtifact,
        ctx: &StrategyContext<'_>,
    ) -> Result<ModelArtifact> {
        let weights = ctx.source_path(source)?;
        let output = ctx.output_path(Representation::IntermediateGraph);
        let params = ctx.params;

        let mut args: Vec<OsString> = vec![
            "--weights".into(),
            weights.into(),
            "--output".into(),
            output.clone().into(),
            "--imgsz".into(),
            params.image_size.to_string().into(),
            "--opset".into(),
            params.opset.to_string().into(),
        ];
        if params.simplify {
            args.push("--simplify".into());
        }
        if params.dynamic_axes {
            args.push("--dynamic".into());
        }

        info!(
            "Exporting intermediate graph (imgsz={}, opset={})",
            params.image_size, params.opset
        );
        let outcome = self.runner.run(Script::ExportOnnx, &args, ctx.output_dir).await?;
        collect_output(Representation::IntermediateGraph, &output, &outcome)
    }
}

/// Native checkpoint straight to the mobile format in one step.
pub struct UltralyticsTfliteExport {
    runner: Arc<ScriptRunner>,
}

impl UltralyticsTfliteExport {
    pub const NAME: &'static str = "ultralytics-tflite";

    pub fn new(runner: Arc<ScriptRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConversionStrategy for UltralyticsTfliteExport {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transition(&self) -> Transition {
        Transition::SHORTCUT
    }

    fn required_dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::named("ultralytics"), Dependency::named("tensorflow")]
    }

    /// Only half precision is available in one step; dynamic-range int8 is not.
    fn weight_precision(&self, params: &ConversionParams) -> &'static str {
        match params.optimization {
            OptimizationMode::Size => "float16",
            OptimizationMode::None | OptimizationMode::Latency => "float32",
        }
    }

    async fn convert(
        &self,
        source: &ModelArtifact,
        ctx: &StrategyContext<'_>,
    ) -> Result<ModelArtifact> {
        let weights = ctx.source_path(source)?;
        let output = ctx.output_path(Representation::Mobile);

        let args: Vec<OsString> = vec![
            "--weights".into(),
            weights.into(),
            "--output".into(),
            output.clone().into(),
            "--imgsz".into(),
            ctx.params.image_size.to_string().into(),
            "--optimization".into(),
            ctx.params.optimization.as_str().into(),
        ];

        if ctx.params.optimization == OptimizationMode::Latency {
            warn!("One-step export keeps float32 weights; int8 quantization needs the staged path");
        }
        info!("Exporting mobile model directly (imgsz={})", ctx.params.image_size);
        let outcome = self.runner.run(Script::ExportTflite, &args, ctx.output_dir).await?;
        collect_output(Representation::Mobile, &output, &outcome)
    }
}
