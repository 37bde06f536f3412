//! The conversion state machine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, info_span, warn, Instrument};

use super::registry::{AttemptRole, StrategyRegistry};
use super::run::{ArtifactSummary, AttemptOutcome, PipelineRun, StageAttempt};
use super::state::PipelineState;
use crate::artifact::{ModelArtifact, Representation};
use crate::cleanup::CleanupCoordinator;
use crate::config::{ConversionConfig, PathsConfig, PublishTarget, SizeCheckPolicy};
use crate::dependency::DependencyResolver;
use crate::error::IoResultExt;
use crate::store::{validate_name, ArtifactStore};
use crate::strategy::{ConversionParams, ConversionStrategy, StrategyContext, Transition};
use crate::{ConvertError, Result};

/// Drives one model through the registered strategies and publishes the result.
pub struct ConversionPipeline {
    config: ConversionConfig,
    params: ConversionParams,
    assets: ArtifactStore,
    scratch_root: PathBuf,
    registry: StrategyRegistry,
    resolver: Arc<dyn DependencyResolver>,
}

impl ConversionPipeline {
    /// `scratch_root` holds one subdirectory per run for intermediates.
    pub fn new(
        config: ConversionConfig,
        assets: ArtifactStore,
        scratch_root: impl Into<PathBuf>,
        registry: StrategyRegistry,
        resolver: Arc<dyn DependencyResolver>,
    ) -> Self {
        Self {
            params: ConversionParams::from(&config),
            config,
            assets,
            scratch_root: scratch_root.into(),
            registry,
            resolver,
        }
    }

    pub fn assets(&self) -> &ArtifactStore {
        &self.assets
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    fn publish_representation(&self) -> Representation {
        match self.config.publish_target {
            PublishTarget::Mobile => Representation::Mobile,
            PublishTarget::IntermediateGraph => Representation::IntermediateGraph,
        }
    }

    fn staged_path(&self) -> &'static [Transition] {
        match self.config.publish_target {
            PublishTarget::Mobile => &Transition::STAGED,
            PublishTarget::IntermediateGraph => &[Transition::EXPORT],
        }
    }

    fn timeout_for(&self, transition: Transition) -> Duration {
        let t = &self.config.timeouts;
        match transition {
            Transition::EXPORT => t.export(),
            Transition::BRIDGE => t.bridge(),
            Transition::COMPILE => t.compile(),
            // The one-step exporter performs both export and compile internally.
            _ => t.export() + t.compile(),
        }
    }

    /// Convert the native checkpoint at `input` and publish it under `name`.
    ///
    /// Conversion failures are reported in the returned record, never as
    /// `Err`. `Err` means the run could not start: an invalid name, another
    /// run holding the lock, or an unusable scratch directory.
    pub async fn run(&self, input: &Path, name: &str) -> Result<PipelineRun> {
        validate_name(name)?;
        let _lock = self.assets.lock(name)?;

        let mut run = PipelineRun::new(name, self.publish_representation());
        // Removed on drop, including when this future is dropped mid-conversion.
        fs::create_dir_all(&self.scratch_root).with_path(&self.scratch_root)?;
        let scratch_dir = tempfile::Builder::new()
            .prefix(&format!("{}-", run.run_id))
            .tempdir_in(&self.scratch_root)
            .with_path(&self.scratch_root)?;
        let scratch = ArtifactStore::open(scratch_dir.path())?;

        let span = info_span!("run", run_id = %run.run_id, model = %name);
        self.drive(&mut run, input, &scratch)
            .instrument(span.clone())
            .await;

        let cleanup = CleanupCoordinator::new(&self.assets);
        let removed = if run.succeeded() {
            cleanup.after_publish(&run, scratch_dir.path())
        } else {
            cleanup.after_failure(&run, scratch_dir.path())
        };
        run.removed = removed;
        run.finish();

        span.in_scope(|| match &run.failure {
            None => info!(
                "Published {} after {} attempt(s)",
                run.published_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                run.attempts.len()
            ),
            Some(failure) => error!("Run failed ({}): {}", failure.kind, failure.message),
        });
        Ok(run)
    }

    async fn drive(&self, run: &mut PipelineRun, input: &Path, scratch: &ArtifactStore) {
        let source = match ModelArtifact::from_path(Representation::Native, input)
            .and_then(|a| a.validate().map(|()| a))
        {
            Ok(source) => source,
            Err(e) => return run.fail(&e),
        };
        run.state = PipelineState::NativeReady;
        info!("Native checkpoint ready ({} bytes)", source.size_bytes());

        let mut produced = None;
        if let Some(shortcut) = self.shortcut() {
            match self
                .attempt(run, AttemptRole::Shortcut, shortcut.as_ref(), &source, scratch)
                .await
            {
                Ok(artifact) => {
                    run.state = PipelineState::MobileReady;
                    produced = Some(artifact);
                }
                Err(e) if !e.allows_fallback() => return run.fail(&e),
                Err(_) => info!("Shortcut failed, continuing with the staged path"),
            }
        }

        let artifact = match produced {
            Some(artifact) => artifact,
            None => match self.run_staged(run, source, scratch).await {
                Ok(artifact) => artifact,
                Err(e) => return run.fail(&e),
            },
        };

        match self.publish(&artifact, &run.model_name) {
            Ok(path) => {
                run.final_artifact = Some(ArtifactSummary {
                    path: Some(path.clone()),
                    ..ArtifactSummary::from(&artifact)
                });
                run.published_path = Some(path);
                run.state = PipelineState::Published;
            }
            Err(e) => run.fail(&e),
        }
    }

    fn shortcut(&self) -> Option<&Arc<dyn ConversionStrategy>> {
        if self.config.shortcut && self.config.publish_target == PublishTarget::Mobile {
            self.registry.shortcut()
        } else {
            None
        }
    }

    async fn run_staged(
        &self,
        run: &mut PipelineRun,
        mut current: ModelArtifact,
        scratch: &ArtifactStore,
    ) -> Result<ModelArtifact> {
        for &transition in self.staged_path() {
            current = self.run_transition(run, transition, &current, scratch).await?;
            run.state = PipelineState::ready(transition.target);
        }
        Ok(current)
    }

    /// Try each registered strategy for `transition` until one succeeds.
    ///
    /// When all of them fail, the last strategy's error is returned.
    async fn run_transition(
        &self,
        run: &mut PipelineRun,
        transition: Transition,
        source: &ModelArtifact,
        scratch: &ArtifactStore,
    ) -> Result<ModelArtifact> {
        let candidates = self.registry.candidates(transition);
        if candidates.is_empty() {
            return Err(ConvertError::ConversionFailed {
                message: format!("no strategy registered for {transition}"),
            });
        }

        let mut last_error = None;
        for (role, strategy) in candidates {
            match self.attempt(run, role, strategy.as_ref(), source, scratch).await {
                Ok(artifact) => return Ok(artifact),
                Err(e) if !e.allows_fallback() => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        warn!("Every strategy for {} failed", transition);
        Err(last_error.unwrap_or_else(|| ConvertError::ConversionFailed {
            message: format!("no strategy succeeded for {transition}"),
        }))
    }

    /// Run one strategy and record the attempt.
    async fn attempt(
        &self,
        run: &mut PipelineRun,
        role: AttemptRole,
        strategy: &dyn ConversionStrategy,
        source: &ModelArtifact,
        scratch: &ArtifactStore,
    ) -> Result<ModelArtifact> {
        let transition = strategy.transition();
        let span = info_span!("attempt", strategy = strategy.name(), transition = %transition);
        info!(parent: &span, "Attempting {} ({:?})", strategy.name(), role);

        let started = Instant::now();
        let result = self
            .execute(run, strategy, source, scratch)
            .instrument(span.clone())
            .await;

        let outcome = match &result {
            Ok(artifact) => AttemptOutcome::Succeeded {
                size_bytes: artifact.size_bytes(),
            },
            Err(e) => {
                warn!(parent: &span, "{} failed: {}", strategy.name(), e);
                AttemptOutcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };
        run.attempts.push(StageAttempt {
            strategy: strategy.name().to_string(),
            transition,
            role,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        result
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        strategy: &dyn ConversionStrategy,
        source: &ModelArtifact,
        scratch: &ArtifactStore,
    ) -> Result<ModelArtifact> {
        let transition = strategy.transition();
        source.validate()?;
        self.resolver
            .ensure_all(&strategy.required_dependencies())
            .await?;

        // Removed on drop, whatever the outcome.
        let attempt_dir = tempfile::Builder::new()
            .prefix("attempt-")
            .tempdir_in(scratch.root())
            .with_path(scratch.root())?;
        let ctx = StrategyContext {
            params: &self.params,
            output_dir: attempt_dir.path(),
        };

        let timeout = self.timeout_for(transition);
        let output = tokio::time::timeout(timeout, strategy.convert(source, &ctx))
            .await
            .map_err(|_| ConvertError::ConversionTimeout {
                operation: format!("{} ({transition})", strategy.name()),
                timeout,
            })??;

        if output.representation() != transition.target {
            return Err(ConvertError::ConversionFailed {
                message: format!(
                    "{} produced {} instead of {}",
                    strategy.name(),
                    output.representation(),
                    transition.target
                ),
            });
        }
        output.validate().map_err(|e| ConvertError::ConversionFailed {
            message: format!("{} produced an invalid artifact: {e}", strategy.name()),
        })?;
        if transition.target == run.publish_target {
            self.check_size(run, &output)?;
        }

        // Move the result out of the attempt directory before it is dropped.
        let stored = scratch.write(&output, &run.model_name)?;
        let stored = ModelArtifact::from_path(transition.target, stored)?;
        run.intermediates.push(ArtifactSummary::from(&stored));
        if transition.target == run.publish_target {
            run.weight_precision = Some(strategy.weight_precision(&self.params).to_string());
        }
        Ok(stored)
    }

    fn check_size(&self, run: &mut PipelineRun, artifact: &ModelArtifact) -> Result<()> {
        let threshold = self.config.min_artifact_bytes;
        if artifact.size_bytes() >= threshold {
            return Ok(());
        }
        let err = ConvertError::SuspectArtifact {
            path: artifact.path().map(Path::to_path_buf).unwrap_or_default(),
            size_bytes: artifact.size_bytes(),
            threshold_bytes: threshold,
        };
        match self.config.size_check {
            SizeCheckPolicy::Reject => Err(err),
            SizeCheckPolicy::Warn => {
                warn!("{}", err);
                run.warnings.push(err.to_string());
                Ok(())
            }
        }
    }

    fn publish(&self, artifact: &ModelArtifact, name: &str) -> Result<PathBuf> {
        self.assets
            .write(artifact, name)
            .map_err(|e| ConvertError::PublishFailure {
                path: self.assets.path_for(artifact.representation(), name),
                message: e.to_string(),
            })
    }
}

/// Default scratch location below a work directory.
pub fn scratch_root(work_dir: &Path) -> PathBuf {
    work_dir.join(PathsConfig::SCRATCH_DIR_NAME)
}
