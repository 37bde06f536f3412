//! Builder for assembling a [`ConversionPipeline`].

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ConversionConfig, PathsConfig};
use crate::dependency::{DependencyResolver, PipResolver};
use crate::error::IoResultExt;
use crate::pipeline::{scratch_root, ConversionPipeline, StrategyRegistry};
use crate::store::ArtifactStore;
use crate::strategy::ScriptRunner;
use crate::Result;

/// Builder for configuring a [`ConversionPipeline`].
///
/// Anything not set explicitly falls back to the script-backed defaults:
/// a [`PipResolver`] and the registry from [`StrategyRegistry::with_defaults`].
///
/// # Example
///
/// ```rust,ignore
/// use posecvt::PipelineBuilder;
///
/// let pipeline = PipelineBuilder::new("app/src/main/assets")
///     .work_dir(".posecvt")
///     .build()?;
/// let run = pipeline.run("yolov8n-pose.pt".as_ref(), "yolov8n_pose").await?;
/// ```
pub struct PipelineBuilder {
    assets_dir: PathBuf,
    work_dir: Option<PathBuf>,
    config: ConversionConfig,
    resolver: Option<Arc<dyn DependencyResolver>>,
    registry: Option<StrategyRegistry>,
}

impl PipelineBuilder {
    /// Create a new builder publishing into `assets_dir`.
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            work_dir: None,
            config: ConversionConfig::default(),
            resolver: None,
            registry: None,
        }
    }

    /// Directory for deployed scripts and scratch intermediates.
    ///
    /// Default: `.posecvt` next to the asset directory.
    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn config(mut self, config: ConversionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the pip-backed resolver.
    pub fn resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the default strategies.
    pub fn registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            self.assets_dir
                .parent()
                .unwrap_or(self.assets_dir.as_path())
                .join(PathsConfig::DEFAULT_WORK_DIR_NAME)
        })
    }

    /// Validate the configuration and build the pipeline.
    pub fn build(self) -> Result<ConversionPipeline> {
        self.config.validate()?;
        let work_dir = self.resolved_work_dir();
        std::fs::create_dir_all(&work_dir).with_path(&work_dir)?;

        let assets = ArtifactStore::open(&self.assets_dir)?;
        let resolver: Arc<dyn DependencyResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(PipResolver::new(
                self.config.python.clone(),
                self.config.timeouts.install(),
            )),
        };
        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let runner = Arc::new(ScriptRunner::new(self.config.python.clone(), &work_dir));
                StrategyRegistry::with_defaults(&self.config, runner)?
            }
        };

        Ok(ConversionPipeline::new(
            self.config,
            assets,
            scratch_root(&work_dir),
            registry,
            resolver,
        ))
    }
}
