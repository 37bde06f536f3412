//! Intermediate graph to graph bundle.
//!
//! Two converters cover this step. `onnx-tf` handles the opset-13 exports the
//! exporter produces; `onnx2tf` copes with more operators but pulls in a
//! heavier toolchain, so it runs second by default.

use std::ffi::OsString;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::scripts::Script;
use super::{collect_output, ConversionStrategy, ScriptRunner, StrategyContext, Transition};
use crate::artifact::{ModelArtifact, Representation};
use crate::dependency::Dependency;
use crate::Result;

async fn run_bridge(
    runner: &ScriptRunner,
    script: Script,
    source: &ModelArtifact,
    ctx: &StrategyContext<'_>,
) -> Result<ModelArtifact> {
    let input = ctx.source_path(source)?;
    let output = ctx.output_path(Representation::GraphBundle);
    let args: Vec<OsString> = vec![
        "--input".into(),
        input.into(),
        "--output".into(),
        output.clone().into(),
    ];
    let outcome = runner.run(script, &args, ctx.output_dir).await?;
    collect_output(Representation::GraphBundle, &output, &outcome)
}

/// Bridge through `onnx_tf.backend.prepare(...).export_graph(...)`.
pub struct OnnxTfBridge {
    runner: Arc<ScriptRunner>,
}

impl OnnxTfBridge {
    pub const NAME: &'static str = "onnx-tf";

    pub fn new(runner: Arc<ScriptRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConversionStrategy for OnnxTfBridge {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transition(&self) -> Transition {
        Transition::BRIDGE
    }

    fn required_dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::named("onnx"),
            Dependency::new("onnx_tf", "onnx-tf"),
            Dependency::named("tensorflow"),
        ]
    }

    async fn convert(
        &self,
        source: &ModelArtifact,
        ctx: &StrategyContext<'_>,
    ) -> Result<ModelArtifact> {
        info!("Rehydrating graph bundle with onnx-tf");
        run_bridge(&self.runner, Script::OnnxTfBridge, source, ctx).await
    }
}

/// Bridge through `onnx2tf.convert`.
pub struct Onnx2TfBridge {
    runner: Arc<ScriptRunner>,
}

impl Onnx2TfBridge {
    pub const NAME: &'static str = "onnx2tf";

    pub fn new(runner: Arc<ScriptRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConversionStrategy for Onnx2TfBridge {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transition(&self) -> Transition {
        Transition::BRIDGE
    }

    fn required_dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::named("onnx"),
            Dependency::named("onnx2tf"),
            Dependency::named("tensorflow"),
        ]
    }

    async fn convert(
        &self,
        source: &ModelArtifact,
        ctx: &StrategyContext<'_>,
    ) -> Result<ModelArtifact> {
        info!("Rehydrating graph bundle with onnx2tf");
        run_bridge(&self.runner, Script::Onnx2TfBridge, source, ctx).await
    }
}
