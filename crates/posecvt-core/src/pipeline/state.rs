use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifact::Representation;

/// Where a run is in the conversion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pending,
    NativeReady,
    IntermediateReady,
    GraphBundleReady,
    MobileReady,
    Published,
    Failed,
}

impl PipelineState {
    /// State reached once an artifact of `representation` exists.
    pub fn ready(representation: Representation) -> Self {
        match representation {
            Representation::Native => PipelineState::NativeReady,
            Representation::IntermediateGraph => PipelineState::IntermediateReady,
            Representation::GraphBundle => PipelineState::GraphBundleReady,
            Representation::Mobile => PipelineState::MobileReady,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "PENDING",
            PipelineState::NativeReady => "NATIVE_READY",
            PipelineState::IntermediateReady => "INTERMEDIATE_READY",
            PipelineState::GraphBundleReady => "GRAPH_BUNDLE_READY",
            PipelineState::MobileReady => "MOBILE_READY",
            PipelineState::Published => "PUBLISHED",
            PipelineState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
