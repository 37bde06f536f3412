//! Strategy registration per transition.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConversionConfig, OperatorProfile, StrategyOrder};
use crate::strategy::{
    ConversionStrategy, Onnx2TfBridge, OnnxTfBridge, ScriptRunner, TfliteCompiler, Transition,
    UltralyticsOnnxExport, UltralyticsTfliteExport,
};
use crate::{ConvertError, Result};

/// Why a strategy was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptRole {
    Shortcut,
    Preferred,
    Fallback,
}

struct StagePair {
    preferred: Arc<dyn ConversionStrategy>,
    fallback: Option<Arc<dyn ConversionStrategy>>,
}

/// At most one preferred and one fallback strategy per transition, plus an
/// optional shortcut.
pub struct StrategyRegistry {
    order: StrategyOrder,
    shortcut: Option<Arc<dyn ConversionStrategy>>,
    stages: HashMap<Transition, StagePair>,
}

impl StrategyRegistry {
    pub fn new(order: StrategyOrder) -> Self {
        Self {
            order,
            shortcut: None,
            stages: HashMap::new(),
        }
    }

    /// The script-backed strategies for `config`.
    ///
    /// When the configured operator profile is strict, a permissive compiler
    /// is registered as its fallback; a permissive configuration has none.
    pub fn with_defaults(config: &ConversionConfig, runner: Arc<ScriptRunner>) -> Result<Self> {
        let mut registry = Self::new(config.strategy_order);

        registry.set_shortcut(Arc::new(UltralyticsTfliteExport::new(runner.clone())))?;
        registry.register(Arc::new(UltralyticsOnnxExport::new(runner.clone())), None)?;
        registry.register(
            Arc::new(OnnxTfBridge::new(runner.clone())),
            Some(Arc::new(Onnx2TfBridge::new(runner.clone()))),
        )?;

        let compiler_fallback: Option<Arc<dyn ConversionStrategy>> =
            match config.operator_profile {
                OperatorProfile::Strict => Some(Arc::new(TfliteCompiler::new(
                    runner.clone(),
                    OperatorProfile::Permissive,
                ))),
                OperatorProfile::Permissive => None,
            };
        registry.register(
            Arc::new(TfliteCompiler::new(runner, config.operator_profile)),
            compiler_fallback,
        )?;

        Ok(registry)
    }

    /// Register the single-shot native-to-mobile strategy.
    pub fn set_shortcut(&mut self, strategy: Arc<dyn ConversionStrategy>) -> Result<()> {
        expect_transition(strategy.as_ref(), Transition::SHORTCUT)?;
        self.shortcut = Some(strategy);
        Ok(())
    }

    /// Register the strategies for one staged transition, replacing any previous pair.
    pub fn register(
        &mut self,
        preferred: Arc<dyn ConversionStrategy>,
        fallback: Option<Arc<dyn ConversionStrategy>>,
    ) -> Result<()> {
        let transition = preferred.transition();
        if transition == Transition::SHORTCUT {
            return Err(ConvertError::Validation {
                field: "transition".into(),
                message: format!("{} is registered with set_shortcut", preferred.name()),
            });
        }
        if let Some(fallback) = &fallback {
            expect_transition(fallback.as_ref(), transition)?;
        }
        self.stages.insert(transition, StagePair { preferred, fallback });
        Ok(())
    }

    pub fn shortcut(&self) -> Option<&Arc<dyn ConversionStrategy>> {
        self.shortcut.as_ref()
    }

    pub fn order(&self) -> StrategyOrder {
        self.order
    }

    /// Strategies for `transition`, in the order they should be attempted.
    pub fn candidates(&self, transition: Transition) -> Vec<(AttemptRole, Arc<dyn ConversionStrategy>)> {
        let Some(pair) = self.stages.get(&transition) else {
            return Vec::new();
        };

        let mut candidates = vec![(AttemptRole::Preferred, pair.preferred.clone())];
        if let Some(fallback) = &pair.fallback {
            candidates.push((AttemptRole::Fallback, fallback.clone()));
        }
        if self.order == StrategyOrder::FallbackFirst {
            candidates.reverse();
        }
        candidates
    }
}

fn expect_transition(strategy: &dyn ConversionStrategy, expected: Transition) -> Result<()> {
    if strategy.transition() == expected {
        Ok(())
    } else {
        Err(ConvertError::Validation {
            field: "transition".into(),
            message: format!(
                "{} performs {}, expected {}",
                strategy.name(),
                strategy.transition(),
                expected
            ),
        })
    }
}
