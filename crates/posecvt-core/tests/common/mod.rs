//! In-process fakes for pipeline integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use posecvt::{
    ArtifactStore, ConversionConfig, ConversionParams, ConversionPipeline, ConversionStrategy,
    ConvertError, Dependency, DependencyResolver, ModelArtifact, Representation, StrategyContext,
    StrategyRegistry, Transition,
};
use tempfile::TempDir;

pub const MODEL: &str = "yolov8n_pose";

pub fn native_bytes(len: usize) -> Vec<u8> {
    padded(&[0x50, 0x4B, 0x03, 0x04], len)
}

pub fn onnx_bytes(len: usize) -> Vec<u8> {
    padded(&[0x08, 0x08], len)
}

pub fn tflite_bytes(len: usize, fill: u8) -> Vec<u8> {
    let mut data = vec![0x1C, 0x00, 0x00, 0x00, b'T', b'F', b'L', b'3'];
    data.resize(len.max(8), fill);
    data
}

fn padded(prefix: &[u8], len: usize) -> Vec<u8> {
    let mut data = prefix.to_vec();
    data.resize(len.max(prefix.len()), 0xAB);
    data
}

/// What a [`FakeStrategy`] does when invoked.
#[derive(Clone)]
pub enum Behavior {
    /// Write a valid artifact of the target representation.
    Succeed { size: usize },
    Fail(fn() -> ConvertError),
    /// Never finish.
    Hang,
}

pub fn unsupported_operator() -> ConvertError {
    ConvertError::UnsupportedOperator {
        operator: "Erf".into(),
        message: "'tf.Erf' op is neither a custom op nor a flex op".into(),
    }
}

pub fn conversion_failed() -> ConvertError {
    ConvertError::ConversionFailed {
        message: "converter exited with status 1".into(),
    }
}

pub struct FakeStrategy {
    name: String,
    transition: Transition,
    behavior: Behavior,
    dependencies: Vec<Dependency>,
    precision: Option<&'static str>,
    calls: AtomicUsize,
}

impl FakeStrategy {
    pub fn new(name: &str, transition: Transition, behavior: Behavior) -> Arc<Self> {
        Self::with_dependencies(name, transition, behavior, Vec::new())
    }

    pub fn with_dependencies(
        name: &str,
        transition: Transition,
        behavior: Behavior,
        dependencies: Vec<Dependency>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            transition,
            behavior,
            dependencies,
            precision: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// A strategy whose output precision ignores the optimization mode.
    pub fn with_precision(
        name: &str,
        transition: Transition,
        behavior: Behavior,
        precision: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            transition,
            behavior,
            dependencies: Vec::new(),
            precision: Some(precision),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionStrategy for FakeStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn transition(&self) -> Transition {
        self.transition
    }

    fn required_dependencies(&self) -> Vec<Dependency> {
        self.dependencies.clone()
    }

    fn weight_precision(&self, params: &ConversionParams) -> &'static str {
        self.precision.unwrap_or_else(|| params.optimization.weight_precision())
    }

    async fn convert(
        &self,
        _source: &ModelArtifact,
        ctx: &StrategyContext<'_>,
    ) -> posecvt::Result<ModelArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed { size } => {
                let target = self.transition.target;
                let path = ctx.output_path(target);
                write_fake_artifact(target, &path, *size);
                ModelArtifact::from_path(target, path)
            }
            Behavior::Fail(make) => Err(make()),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err(conversion_failed())
            }
        }
    }
}

fn write_fake_artifact(representation: Representation, path: &Path, size: usize) {
    match representation {
        Representation::Native => std::fs::write(path, native_bytes(size)).unwrap(),
        Representation::IntermediateGraph => std::fs::write(path, onnx_bytes(size)).unwrap(),
        Representation::GraphBundle => {
            std::fs::create_dir_all(path.join("variables")).unwrap();
            std::fs::write(path.join("saved_model.pb"), vec![1u8; size]).unwrap();
            std::fs::write(path.join("variables").join("variables.index"), b"idx").unwrap();
        }
        Representation::Mobile => std::fs::write(path, tflite_bytes(size, 0x5A)).unwrap(),
    }
}

/// Resolver that refuses a fixed set of libraries and records every request.
#[derive(Default)]
pub struct FakeResolver {
    unavailable: HashSet<String>,
    requested: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn available() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing(libraries: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            unavailable: libraries.iter().map(|l| l.to_string()).collect(),
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl DependencyResolver for FakeResolver {
    async fn ensure(&self, dependency: &Dependency) -> posecvt::Result<()> {
        self.requested.lock().unwrap().push(dependency.module.clone());
        if self.unavailable.contains(&dependency.module) {
            return Err(ConvertError::DependencyUnavailable {
                library: dependency.module.clone(),
                diagnostic: format!("ERROR: No matching distribution found for {}", dependency.package),
            });
        }
        Ok(())
    }
}

/// Temporary asset directory, work directory and native input.
pub struct TestEnv {
    pub temp: TempDir,
    pub assets: ArtifactStore,
    pub input: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let assets = ArtifactStore::open(temp.path().join("assets")).unwrap();
        let input = temp.path().join("yolov8n-pose.pt");
        std::fs::write(&input, native_bytes(64 * 1024)).unwrap();
        Self {
            temp,
            assets,
            input,
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.temp.path().join("work").join("scratch")
    }

    pub fn pipeline(
        &self,
        config: ConversionConfig,
        registry: StrategyRegistry,
        resolver: Arc<dyn DependencyResolver>,
    ) -> ConversionPipeline {
        ConversionPipeline::new(
            config,
            self.assets.clone(),
            self.scratch_root(),
            registry,
            resolver,
        )
    }

    /// Entries left under the scratch root.
    pub fn scratch_entries(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.scratch_root()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Files and directories in the asset store, excluding the lock directory.
    pub fn asset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.assets.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != ".locks")
            .collect();
        names.sort();
        names
    }
}

/// Config with a small size threshold so fake artifacts pass the sanity check.
pub fn test_config() -> ConversionConfig {
    ConversionConfig {
        min_artifact_bytes: 1024,
        ..Default::default()
    }
}

pub const MOBILE_SIZE: usize = 8 * 1024;

/// Registry with succeeding staged strategies and the given shortcut behavior.
pub struct Fakes {
    pub shortcut: Arc<FakeStrategy>,
    pub export: Arc<FakeStrategy>,
    pub bridge: Arc<FakeStrategy>,
    pub bridge_fallback: Arc<FakeStrategy>,
    pub compile: Arc<FakeStrategy>,
    pub compile_fallback: Arc<FakeStrategy>,
}

impl Fakes {
    pub fn new(shortcut: Behavior) -> Self {
        Self {
            shortcut: FakeStrategy::new("direct", Transition::SHORTCUT, shortcut),
            export: FakeStrategy::new("export", Transition::EXPORT, Behavior::Succeed { size: 4096 }),
            bridge: FakeStrategy::new("bridge", Transition::BRIDGE, Behavior::Succeed { size: 4096 }),
            bridge_fallback: FakeStrategy::new(
                "bridge-fallback",
                Transition::BRIDGE,
                Behavior::Succeed { size: 4096 },
            ),
            compile: FakeStrategy::new(
                "compile",
                Transition::COMPILE,
                Behavior::Succeed { size: MOBILE_SIZE },
            ),
            compile_fallback: FakeStrategy::new(
                "compile-fallback",
                Transition::COMPILE,
                Behavior::Succeed { size: MOBILE_SIZE },
            ),
        }
    }

    pub fn registry(&self, config: &ConversionConfig) -> StrategyRegistry {
        let mut registry = StrategyRegistry::new(config.strategy_order);
        registry.set_shortcut(self.shortcut.clone()).unwrap();
        registry.register(self.export.clone(), None).unwrap();
        registry
            .register(self.bridge.clone(), Some(self.bridge_fallback.clone()))
            .unwrap();
        registry
            .register(self.compile.clone(), Some(self.compile_fallback.clone()))
            .unwrap();
        registry
    }
}
