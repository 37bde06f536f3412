//! Conversion pipeline.
//!
//! The pipeline walks a run through
//! `PENDING -> NATIVE_READY -> {INTERMEDIATE_READY | MOBILE_READY} -> ... -> PUBLISHED`,
//! trying the shortcut first and then, per staged transition, the preferred
//! strategy followed by at most one fallback. Strategy errors end up in the
//! [`PipelineRun`] record instead of being returned.

mod driver;
mod registry;
mod run;
mod state;

pub use driver::{scratch_root, ConversionPipeline};
pub use registry::{AttemptRole, StrategyRegistry};
pub use run::{ArtifactSummary, AttemptOutcome, PipelineRun, RunFailure, StageAttempt};
pub use state::PipelineState;
