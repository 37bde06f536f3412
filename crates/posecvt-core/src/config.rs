//! Configuration for conversion runs.
//!
//! [`ConversionConfig`] is the user-facing surface (JSON file plus CLI
//! overrides). Fixed names and defaults live on the unit structs below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::atomic_read_json;
use crate::{ConvertError, Result};

/// Timeout defaults for long-running steps.
pub struct TimeoutConfig;

impl TimeoutConfig {
    pub const EXPORT_SECS: u64 = 600;
    pub const BRIDGE_SECS: u64 = 900;
    pub const COMPILE_SECS: u64 = 900;
    pub const INSTALL_SECS: u64 = 600;
    pub const IMPORT_CHECK: Duration = Duration::from_secs(60);
}

/// File and directory naming used by the stores.
pub struct PathsConfig;

impl PathsConfig {
    pub const NATIVE_EXTENSION: &'static str = "pt";
    pub const INTERMEDIATE_EXTENSION: &'static str = "onnx";
    pub const MOBILE_EXTENSION: &'static str = "tflite";
    pub const BUNDLE_DIR_SUFFIX: &'static str = "_saved_model";
    pub const BUNDLE_GRAPH_FILE: &'static str = "saved_model.pb";
    pub const LOCKS_DIR_NAME: &'static str = ".locks";
    pub const SCRIPTS_DIR_NAME: &'static str = "scripts";
    pub const SCRATCH_DIR_NAME: &'static str = "scratch";
    pub const STAGING_PREFIX: &'static str = ".staging-";
    pub const DEFAULT_WORK_DIR_NAME: &'static str = ".posecvt";
}

/// Operator-support profile for the mobile compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorProfile {
    /// Built-in mobile ops only. Smallest runtime, least compatible.
    #[default]
    Strict,
    /// Built-ins plus the fallback interpreter layer for everything else.
    Permissive,
}

impl OperatorProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorProfile::Strict => "strict",
            OperatorProfile::Permissive => "permissive",
        }
    }
}

/// Numeric optimization applied by the mobile compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    /// Float32 weights, no graph optimizations.
    #[default]
    None,
    /// Float16 weights; roughly halves the artifact.
    Size,
    /// Dynamic-range int8 weights; faster on CPU delegates.
    Latency,
}

impl OptimizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationMode::None => "none",
            OptimizationMode::Size => "size",
            OptimizationMode::Latency => "latency",
        }
    }

    /// Weight precision of artifacts compiled in this mode.
    pub fn weight_precision(&self) -> &'static str {
        match self {
            OptimizationMode::None => "float32",
            OptimizationMode::Size => "float16",
            OptimizationMode::Latency => "int8-dynamic-range",
        }
    }
}

/// Which registered strategy a transition tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyOrder {
    #[default]
    PreferredFirst,
    FallbackFirst,
}

/// Representation the run publishes to the asset store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishTarget {
    #[default]
    Mobile,
    IntermediateGraph,
}

/// What to do with an output below `min_artifact_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeCheckPolicy {
    /// Publish, but record a warning.
    #[default]
    Warn,
    /// Fail the producing strategy.
    Reject,
}

/// Per-step timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub export_secs: u64,
    pub bridge_secs: u64,
    pub compile_secs: u64,
    pub install_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            export_secs: TimeoutConfig::EXPORT_SECS,
            bridge_secs: TimeoutConfig::BRIDGE_SECS,
            compile_secs: TimeoutConfig::COMPILE_SECS,
            install_secs: TimeoutConfig::INSTALL_SECS,
        }
    }
}

impl Timeouts {
    pub fn export(&self) -> Duration {
        Duration::from_secs(self.export_secs)
    }

    pub fn bridge(&self) -> Duration {
        Duration::from_secs(self.bridge_secs)
    }

    pub fn compile(&self) -> Duration {
        Duration::from_secs(self.compile_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }
}

/// Recognized options for a conversion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Square input resolution the graph is exported at.
    pub image_size: u32,
    /// Operator-set version for the intermediate graph.
    pub opset: u32,
    /// Run the graph simplifier during export.
    pub simplify: bool,
    /// Export with dynamic batch/spatial axes.
    pub dynamic_axes: bool,
    pub operator_profile: OperatorProfile,
    pub optimization: OptimizationMode,
    pub strategy_order: StrategyOrder,
    /// Try the single-shot native-to-mobile strategy before the staged path.
    pub shortcut: bool,
    pub publish_target: PublishTarget,
    pub min_artifact_bytes: u64,
    pub size_check: SizeCheckPolicy,
    pub timeouts: Timeouts,
    /// Python interpreter used by the converter scripts.
    pub python: String,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            image_size: 320,
            opset: 13,
            simplify: true,
            dynamic_axes: false,
            operator_profile: OperatorProfile::default(),
            optimization: OptimizationMode::default(),
            strategy_order: StrategyOrder::default(),
            shortcut: true,
            publish_target: PublishTarget::default(),
            min_artifact_bytes: 1_000_000,
            size_check: SizeCheckPolicy::default(),
            timeouts: Timeouts::default(),
            python: "python3".to_string(),
        }
    }
}

impl ConversionConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config = atomic_read_json::<Self>(path)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Reject values no converter accepts.
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 || self.image_size % 32 != 0 {
            return Err(ConvertError::Config {
                message: format!(
                    "image_size must be a positive multiple of 32, got {}",
                    self.image_size
                ),
            });
        }
        if !(7..=21).contains(&self.opset) {
            return Err(ConvertError::Config {
                message: format!("opset must be between 7 and 21, got {}", self.opset),
            });
        }
        let t = &self.timeouts;
        if [t.export_secs, t.bridge_secs, t.compile_secs, t.install_secs].contains(&0) {
            return Err(ConvertError::Config {
                message: "timeouts must be non-zero".to_string(),
            });
        }
        if self.python.trim().is_empty() {
            return Err(ConvertError::Config {
                message: "python interpreter must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
