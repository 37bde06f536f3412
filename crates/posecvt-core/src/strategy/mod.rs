//! Conversion strategies.
//!
//! A strategy turns an artifact of one representation into a new artifact of
//! another. Strategies are stateless and may be invoked repeatedly; all
//! per-attempt state lives in the [`StrategyContext`] the pipeline builds.
//!
//! The concrete strategies run embedded Python converter scripts (see
//! [`scripts`]) through a [`ScriptRunner`].

mod bridge;
mod compile;
mod export;
mod runner;
pub mod scripts;

pub use bridge::{Onnx2TfBridge, OnnxTfBridge};
pub use compile::TfliteCompiler;
pub use export::{UltralyticsOnnxExport, UltralyticsTfliteExport};
pub use runner::{ScriptOutcome, ScriptProgressLine, ScriptRunner};

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactLocation, ModelArtifact, Representation};
use crate::config::{ConversionConfig, OperatorProfile, OptimizationMode};
use crate::dependency::Dependency;
use crate::error::IoResultExt;
use crate::{ConvertError, Result};

/// A source-to-target representation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    pub source: Representation,
    pub target: Representation,
}

impl Transition {
    /// Single-shot native to mobile.
    pub const SHORTCUT: Transition =
        Transition::new(Representation::Native, Representation::Mobile);
    pub const EXPORT: Transition =
        Transition::new(Representation::Native, Representation::IntermediateGraph);
    pub const BRIDGE: Transition =
        Transition::new(Representation::IntermediateGraph, Representation::GraphBundle);
    pub const COMPILE: Transition =
        Transition::new(Representation::GraphBundle, Representation::Mobile);

    /// The staged path, in execution order.
    pub const STAGED: [Transition; 3] = [Self::EXPORT, Self::BRIDGE, Self::COMPILE];

    pub const fn new(source: Representation, target: Representation) -> Self {
        Self { source, target }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

/// Knobs forwarded to every strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionParams {
    pub image_size: u32,
    pub opset: u32,
    pub simplify: bool,
    pub dynamic_axes: bool,
    pub operator_profile: OperatorProfile,
    pub optimization: OptimizationMode,
}

impl Default for ConversionParams {
    fn default() -> Self {
        Self::from(&ConversionConfig::default())
    }
}

impl From<&ConversionConfig> for ConversionParams {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            image_size: config.image_size,
            opset: config.opset,
            simplify: config.simplify,
            dynamic_axes: config.dynamic_axes,
            operator_profile: config.operator_profile,
            optimization: config.optimization,
        }
    }
}

/// Everything a strategy may touch during one attempt.
pub struct StrategyContext<'a> {
    pub params: &'a ConversionParams,
    /// Private directory for this attempt; removed when the attempt ends.
    pub output_dir: &'a Path,
}

impl StrategyContext<'_> {
    /// Output location for an artifact of `representation` inside the attempt directory.
    pub fn output_path(&self, representation: Representation) -> PathBuf {
        self.output_dir.join(representation.file_name("output"))
    }

    /// On-disk path of `source`, spilling in-memory artifacts into the attempt directory.
    pub fn source_path(&self, source: &ModelArtifact) -> Result<PathBuf> {
        match source.location() {
            ArtifactLocation::Path(path) => Ok(path.clone()),
            ArtifactLocation::Memory(data) => {
                let path = self.output_dir.join(source.representation().file_name("input"));
                std::fs::write(&path, data).with_path(&path)?;
                Ok(path)
            }
        }
    }
}

/// Wrap a script's output as an artifact of `representation`.
///
/// Fails when the script exited cleanly but left nothing behind.
pub(crate) fn collect_output(
    representation: Representation,
    expected: &Path,
    outcome: &ScriptOutcome,
) -> Result<ModelArtifact> {
    let path = outcome
        .output_path
        .as_deref()
        .filter(|p| p.exists())
        .unwrap_or(expected);
    if !path.exists() {
        return Err(ConvertError::ConversionFailed {
            message: format!("converter reported success but wrote no {representation} output"),
        });
    }
    ModelArtifact::from_path(representation, path)
}

/// One concrete way of performing a [`Transition`].
#[async_trait]
pub trait ConversionStrategy: Send + Sync {
    /// Stable identifier used in logs and outcome records.
    fn name(&self) -> &str;

    fn transition(&self) -> Transition;

    /// Optional libraries resolved before [`ConversionStrategy::convert`] runs.
    fn required_dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Weight precision of what [`ConversionStrategy::convert`] produces under `params`.
    fn weight_precision(&self, params: &ConversionParams) -> &'static str {
        params.optimization.weight_precision()
    }

    /// Produce a new artifact of `self.transition().target` from `source`.
    async fn convert(
        &self,
        source: &ModelArtifact,
        ctx: &StrategyContext<'_>,
    ) -> Result<ModelArtifact>;
}
