//! posecvt - Multi-strategy conversion of pose models into mobile assets.
//!
//! A native checkpoint is carried through
//! `native -> intermediate graph -> graph bundle -> mobile`, with a
//! single-shot `native -> mobile` shortcut tried first. Each transition has a
//! preferred and an optional fallback strategy. The result is published
//! atomically into an asset directory and every attempt is recorded in a
//! [`PipelineRun`].
//!
//! # Example
//!
//! ```rust,ignore
//! use posecvt::PipelineBuilder;
//!
//! #[tokio::main]
//! async fn main() -> posecvt::Result<()> {
//!     let pipeline = PipelineBuilder::new("app/src/main/assets").build()?;
//!     let run = pipeline.run("yolov8n-pose.pt".as_ref(), "yolov8n_pose").await?;
//!     println!("{}", run.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod cleanup;
pub mod config;
pub mod dependency;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod strategy;

mod builder;

pub use artifact::{ArtifactLocation, ModelArtifact, Representation};
pub use builder::PipelineBuilder;
pub use cleanup::CleanupCoordinator;
pub use config::{
    ConversionConfig, OperatorProfile, OptimizationMode, PublishTarget, SizeCheckPolicy,
    StrategyOrder, Timeouts,
};
pub use dependency::{Dependency, DependencyResolver, PipResolver};
pub use error::{ConvertError, ErrorKind, Result};
pub use pipeline::{
    AttemptOutcome, AttemptRole, ConversionPipeline, PipelineRun, PipelineState, StageAttempt,
    StrategyRegistry,
};
pub use store::ArtifactStore;
pub use strategy::{ConversionParams, ConversionStrategy, StrategyContext, Transition};
