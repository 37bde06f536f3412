//! The outcome record of one pipeline run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::registry::AttemptRole;
use super::state::PipelineState;
use crate::artifact::{ModelArtifact, Representation};
use crate::error::ErrorKind;
use crate::store::atomic_write_json;
use crate::strategy::Transition;
use crate::{ConvertError, Result};

/// How a single strategy attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded { size_bytes: u64 },
    Failed { kind: ErrorKind, message: String },
}

/// One `(strategy, outcome)` entry, in the order attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub strategy: String,
    pub transition: Transition,
    pub role: AttemptRole,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

impl StageAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded { .. })
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self.outcome {
            AttemptOutcome::Failed { kind, .. } => Some(kind),
            AttemptOutcome::Succeeded { .. } => None,
        }
    }
}

/// A produced artifact as it appears in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub representation: Representation,
    pub path: Option<PathBuf>,
    pub size_bytes: u64,
}

impl From<&ModelArtifact> for ArtifactSummary {
    fn from(artifact: &ModelArtifact) -> Self {
        Self {
            representation: artifact.representation(),
            path: artifact.path().map(Path::to_path_buf),
            size_bytes: artifact.size_bytes(),
        }
    }
}

/// Why a run ended in `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ConvertError> for RunFailure {
    fn from(err: &ConvertError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Structured outcome of one end-to-end conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub model_name: String,
    pub state: PipelineState,
    /// Representation this run publishes.
    pub publish_target: Representation,
    pub attempts: Vec<StageAttempt>,
    pub final_artifact: Option<ArtifactSummary>,
    pub published_path: Option<PathBuf>,
    /// Artifacts written to scratch storage, in production order.
    pub intermediates: Vec<ArtifactSummary>,
    /// Paths removed by cleanup.
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<String>,
    /// Weight precision of the artifact produced for the publish target.
    pub weight_precision: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
}

impl PipelineRun {
    pub fn new(model_name: &str, publish_target: Representation) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            model_name: model_name.to_string(),
            state: PipelineState::Pending,
            publish_target,
            attempts: Vec::new(),
            final_artifact: None,
            published_path: None,
            intermediates: Vec::new(),
            removed: Vec::new(),
            warnings: Vec::new(),
            weight_precision: None,
            started_at: Utc::now(),
            finished_at: None,
            failure: None,
        }
    }

    /// True only when the run reached `PUBLISHED`.
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Published
    }

    /// Names of the attempted strategies, in order.
    pub fn strategies(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.strategy.as_str()).collect()
    }

    /// Failure kind of every failed attempt, in order.
    pub fn failure_kinds(&self) -> Vec<ErrorKind> {
        self.attempts.iter().filter_map(StageAttempt::failure_kind).collect()
    }

    pub(crate) fn fail(&mut self, err: &ConvertError) {
        self.state = PipelineState::Failed;
        self.failure = Some(RunFailure::from(err));
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the record to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}
