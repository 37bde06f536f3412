//! Graph bundle to mobile format.

use std::ffi::OsString;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::scripts::Script;
use super::{collect_output, ConversionStrategy, ScriptRunner, StrategyContext, Transition};
use crate::artifact::{ModelArtifact, Representation};
use crate::config::OperatorProfile;
use crate::dependency::Dependency;
use crate::Result;

/// TFLite converter pinned to one operator profile.
///
/// The profile is fixed at construction rather than read from the run
/// parameters, so a strict and a permissive compiler can be registered for
/// the same transition.
pub struct TfliteCompiler {
    runner: Arc<ScriptRunner>,
    profile: OperatorProfile,
    name: String,
}

impl TfliteCompiler {
    pub fn new(runner: Arc<ScriptRunner>, profile: OperatorProfile) -> Self {
        Self {
            runner,
            profile,
            name: format!("tflite-{}", profile.as_str()),
        }
    }

    pub fn profile(&self) -> OperatorProfile {
        self.profile
    }
}

#[async_trait]
impl ConversionStrategy for TfliteCompiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn transition(&self) -> Transition {
        Transition::COMPILE
    }

    fn required_dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::named("tensorflow")]
    }

    async fn convert(
        &self,
        source: &ModelArtifact,
        ctx: &StrategyContext<'_>,
    ) -> Result<ModelArtifact> {
        let saved_model = ctx.source_path(source)?;
        let output = ctx.output_path(Representation::Mobile);
        let optimization = ctx.params.optimization;

        let args: Vec<OsString> = vec![
            "--saved-model".into(),
            saved_model.into(),
            "--output".into(),
            output.clone().into(),
            "--profile".into(),
            self.profile.as_str().into(),
            "--optimization".into(),
            optimization.as_str().into(),
        ];

        info!(
            "Compiling mobile model ({} ops, {} weights)",
            self.profile.as_str(),
            optimization.weight_precision()
        );
        let outcome = self.runner.run(Script::CompileTflite, &args, ctx.output_dir).await?;
        collect_output(Representation::Mobile, &output, &outcome)
    }
}
