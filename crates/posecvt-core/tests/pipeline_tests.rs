//! End-to-end tests of the conversion state machine using fake strategies.

mod common;

use common::*;
use std::time::Duration;

use posecvt::{
    AttemptRole, ConversionConfig, ConvertError, Dependency, ErrorKind, ModelArtifact,
    OptimizationMode, PipelineState, PublishTarget, Representation, SizeCheckPolicy,
    StrategyOrder, StrategyRegistry, Transition,
};

fn published_bytes(env: &TestEnv) -> Vec<u8> {
    std::fs::read(env.assets.path_for(Representation::Mobile, MODEL)).unwrap()
}

fn publish_previous(env: &TestEnv) -> Vec<u8> {
    let previous = tflite_bytes(16 * 1024, 0x11);
    let artifact = ModelArtifact::from_bytes(Representation::Mobile, previous.clone()).unwrap();
    env.assets.write(&artifact, MODEL).unwrap();
    previous
}

#[tokio::test]
async fn test_shortcut_success_publishes_after_one_attempt() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert_eq!(run.state, PipelineState::Published);
    assert!(run.succeeded());
    assert_eq!(run.strategies(), vec!["direct"]);
    assert_eq!(run.attempts[0].role, AttemptRole::Shortcut);
    assert_eq!(fakes.export.calls(), 0);
    assert_eq!(
        run.published_path.as_deref(),
        Some(env.assets.path_for(Representation::Mobile, MODEL).as_path())
    );
    assert_eq!(published_bytes(&env), tflite_bytes(MOBILE_SIZE, 0x5A));
    assert!(env.scratch_entries().is_empty());
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn test_shortcut_failure_falls_back_to_staged_path() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Fail(unsupported_operator));
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert_eq!(run.state, PipelineState::Published);
    assert_eq!(run.strategies(), vec!["direct", "export", "bridge", "compile"]);
    assert_eq!(run.attempts[0].failure_kind(), Some(ErrorKind::UnsupportedOperator));
    assert!(run.attempts[1..].iter().all(|a| a.succeeded()));
    assert_eq!(
        run.attempts.iter().map(|a| a.transition).collect::<Vec<_>>(),
        vec![
            Transition::SHORTCUT,
            Transition::EXPORT,
            Transition::BRIDGE,
            Transition::COMPILE
        ]
    );

    // Nothing but the mobile artifact is left behind.
    assert!(env.scratch_entries().is_empty());
    assert_eq!(env.asset_names(), vec![format!("{MODEL}.tflite")]);
    for intermediate in &run.intermediates {
        assert!(!intermediate.path.as_ref().unwrap().exists());
    }
    assert_eq!(run.intermediates.len(), 3);
}

#[tokio::test]
async fn test_unavailable_dependencies_leave_assets_unchanged() {
    let env = TestEnv::new();
    let previous = publish_previous(&env);
    let config = test_config();
    let tensorflow = vec![Dependency::named("tensorflow")];

    let mut registry = StrategyRegistry::new(config.strategy_order);
    registry
        .set_shortcut(FakeStrategy::with_dependencies(
            "direct",
            Transition::SHORTCUT,
            Behavior::Succeed { size: MOBILE_SIZE },
            tensorflow.clone(),
        ))
        .unwrap();
    registry
        .register(
            FakeStrategy::with_dependencies(
                "export",
                Transition::EXPORT,
                Behavior::Succeed { size: 4096 },
                tensorflow.clone(),
            ),
            Some(FakeStrategy::with_dependencies(
                "export-fallback",
                Transition::EXPORT,
                Behavior::Succeed { size: 4096 },
                tensorflow,
            )),
        )
        .unwrap();

    let resolver = FakeResolver::refusing(&["tensorflow"]);
    let pipeline = env.pipeline(config, registry, resolver.clone());
    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert_eq!(run.state, PipelineState::Failed);
    assert!(!run.succeeded());
    assert_eq!(run.attempts.len(), 3);
    assert!(run
        .failure_kinds()
        .iter()
        .all(|k| *k == ErrorKind::DependencyUnavailable));
    assert_eq!(
        run.failure.as_ref().map(|f| f.kind),
        Some(ErrorKind::DependencyUnavailable)
    );
    assert!(run.published_path.is_none());
    assert_eq!(published_bytes(&env), previous);
    assert_eq!(resolver.requested(), vec!["tensorflow"; 3]);
    assert!(env.scratch_entries().is_empty());
}

#[tokio::test]
async fn test_bridge_fallback_runs_after_preferred_fails() {
    let env = TestEnv::new();
    let config = test_config();
    let mut fakes = Fakes::new(Behavior::Fail(unsupported_operator));
    fakes.bridge = FakeStrategy::new("bridge", Transition::BRIDGE, Behavior::Fail(unsupported_operator));
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert!(run.succeeded());
    assert_eq!(
        run.strategies(),
        vec!["direct", "export", "bridge", "bridge-fallback", "compile"]
    );
    assert_eq!(run.attempts[2].role, AttemptRole::Preferred);
    assert_eq!(run.attempts[3].role, AttemptRole::Fallback);
    assert_eq!(fakes.compile_fallback.calls(), 0);
}

#[tokio::test]
async fn test_fallback_first_order() {
    let env = TestEnv::new();
    let config = ConversionConfig {
        strategy_order: StrategyOrder::FallbackFirst,
        shortcut: false,
        ..test_config()
    };
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert!(run.succeeded());
    assert_eq!(
        run.strategies(),
        vec!["export", "bridge-fallback", "compile-fallback"]
    );
    assert_eq!(fakes.shortcut.calls(), 0);
}

#[tokio::test]
async fn test_exhausted_transition_preserves_previous_asset() {
    let env = TestEnv::new();
    let previous = publish_previous(&env);
    let config = test_config();
    let mut fakes = Fakes::new(Behavior::Fail(unsupported_operator));
    fakes.compile = FakeStrategy::new("compile", Transition::COMPILE, Behavior::Fail(unsupported_operator));
    fakes.compile_fallback = FakeStrategy::new(
        "compile-fallback",
        Transition::COMPILE,
        Behavior::Fail(conversion_failed),
    );
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert_eq!(run.state, PipelineState::Failed);
    assert_eq!(run.attempts.len(), 5);
    assert_eq!(
        run.failure.as_ref().map(|f| f.kind),
        Some(ErrorKind::ConversionFailed)
    );
    assert_eq!(published_bytes(&env), previous);
    assert!(env.scratch_entries().is_empty());
}

#[tokio::test]
async fn test_suspect_artifact_rejected_then_staged() {
    let env = TestEnv::new();
    let config = ConversionConfig {
        size_check: SizeCheckPolicy::Reject,
        ..test_config()
    };
    let fakes = Fakes::new(Behavior::Succeed { size: 100 });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert!(run.succeeded());
    assert_eq!(run.attempts[0].failure_kind(), Some(ErrorKind::SuspectArtifact));
    assert_eq!(run.attempts.len(), 4);
    assert_eq!(published_bytes(&env).len(), MOBILE_SIZE);
    assert!(run.warnings.is_empty());
}

#[tokio::test]
async fn test_suspect_artifact_warns_by_default() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: 100 });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert!(run.succeeded());
    assert_eq!(run.attempts.len(), 1);
    assert_eq!(run.warnings.len(), 1);
    assert!(run.warnings[0].contains("below the 1024 byte minimum"));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_strategy_times_out() {
    let env = TestEnv::new();
    let mut config = test_config();
    config.shortcut = false;
    config.timeouts.bridge_secs = 5;
    let mut fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    fakes.bridge = FakeStrategy::new("bridge", Transition::BRIDGE, Behavior::Hang);
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert!(run.succeeded());
    assert_eq!(run.attempts[1].failure_kind(), Some(ErrorKind::ConversionTimeout));
    assert_eq!(run.attempts[2].strategy, "bridge-fallback");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_removes_scratch() {
    let env = TestEnv::new();
    let mut config = test_config();
    config.shortcut = false;
    let mut fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    fakes.bridge = FakeStrategy::new("bridge", Transition::BRIDGE, Behavior::Hang);
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    tokio::select! {
        _ = pipeline.run(&env.input, MODEL) => panic!("run finished despite hanging bridge"),
        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
    }

    assert_eq!(fakes.export.calls(), 1);
    assert_eq!(fakes.bridge.calls(), 1);
    assert!(env.scratch_entries().is_empty(), "{:?}", env.scratch_entries());
    assert!(env.asset_names().is_empty());

    // The lock went with the dropped run.
    let mut fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    fakes.bridge = FakeStrategy::new("bridge", Transition::BRIDGE, Behavior::Succeed { size: 4096 });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());
    assert!(pipeline.run(&env.input, MODEL).await.unwrap().succeeded());
}

#[tokio::test]
async fn test_precision_comes_from_producing_strategy() {
    let env = TestEnv::new();
    let config = ConversionConfig {
        optimization: OptimizationMode::Latency,
        ..test_config()
    };

    let mut fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    fakes.shortcut = FakeStrategy::with_precision(
        "direct",
        Transition::SHORTCUT,
        Behavior::Succeed { size: MOBILE_SIZE },
        "float32",
    );
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());
    let run = pipeline.run(&env.input, MODEL).await.unwrap();
    assert_eq!(run.strategies(), vec!["direct"]);
    assert_eq!(run.weight_precision.as_deref(), Some("float32"));

    let fakes = Fakes::new(Behavior::Fail(unsupported_operator));
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());
    let run = pipeline.run(&env.input, MODEL).await.unwrap();
    assert_eq!(run.strategies().last(), Some(&"compile"));
    assert_eq!(run.weight_precision.as_deref(), Some("int8-dynamic-range"));
}

#[tokio::test]
async fn test_failed_run_records_no_precision() {
    let env = TestEnv::new();
    let config = test_config();
    let mut fakes = Fakes::new(Behavior::Fail(unsupported_operator));
    fakes.compile = FakeStrategy::new("compile", Transition::COMPILE, Behavior::Fail(conversion_failed));
    fakes.compile_fallback =
        FakeStrategy::new("compile-fallback", Transition::COMPILE, Behavior::Fail(conversion_failed));
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert_eq!(run.state, PipelineState::Failed);
    assert_eq!(run.weight_precision, None);
    assert_eq!(run.final_artifact, None);
}

#[tokio::test]
async fn test_final_artifact_points_at_published_file() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Fail(unsupported_operator));
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    let summary = run.final_artifact.clone().unwrap();
    assert_eq!(summary.representation, Representation::Mobile);
    assert_eq!(summary.path, run.published_path);
    assert_eq!(summary.size_bytes, MOBILE_SIZE as u64);
    assert!(summary.path.unwrap().is_file());
    assert!(run.intermediates.iter().all(|i| i.path.as_ref().map_or(true, |p| !p.exists())));
}

#[tokio::test]
async fn test_intermediate_target_publishes_graph() {
    let env = TestEnv::new();
    let stale = ModelArtifact::from_bytes(Representation::Native, native_bytes(128)).unwrap();
    env.assets.write(&stale, MODEL).unwrap();

    let config = ConversionConfig {
        publish_target: PublishTarget::IntermediateGraph,
        ..test_config()
    };
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert!(run.succeeded());
    assert_eq!(run.strategies(), vec!["export"]);
    assert_eq!(run.publish_target, Representation::IntermediateGraph);
    assert_eq!(env.asset_names(), vec![format!("{MODEL}.onnx")]);
    assert_eq!(run.weight_precision.as_deref(), Some("float32"));
}

#[tokio::test]
async fn test_stale_native_asset_removed_after_publish() {
    let env = TestEnv::new();
    let stale = ModelArtifact::from_bytes(Representation::Native, native_bytes(128)).unwrap();
    let stale_path = env.assets.write(&stale, MODEL).unwrap();

    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());
    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert!(run.succeeded());
    assert!(!stale_path.exists());
    assert!(run.removed.contains(&stale_path));
}

#[tokio::test]
async fn test_publish_failure_is_fatal() {
    let env = TestEnv::new();
    // A non-empty directory where the mobile file should go blocks the rename.
    let blocked = env.assets.path_for(Representation::Mobile, MODEL);
    std::fs::create_dir_all(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"x").unwrap();

    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());
    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert_eq!(run.state, PipelineState::Failed);
    assert_eq!(
        run.failure.as_ref().map(|f| f.kind),
        Some(ErrorKind::PublishFailure)
    );
    assert_eq!(run.strategies(), vec!["direct"]);
    assert_eq!(fakes.export.calls(), 0);
    assert!(blocked.join("keep").is_file());
    assert!(env.scratch_entries().is_empty());
}

#[tokio::test]
async fn test_missing_input_fails_without_attempts() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline
        .run(&env.temp.path().join("absent.pt"), MODEL)
        .await
        .unwrap();

    assert_eq!(run.state, PipelineState::Failed);
    assert!(run.attempts.is_empty());
    assert_eq!(
        run.failure.as_ref().map(|f| f.kind),
        Some(ErrorKind::ArtifactNotFound)
    );
}

#[tokio::test]
async fn test_malformed_input_fails_without_attempts() {
    let env = TestEnv::new();
    std::fs::write(&env.input, b"<html>404 Not Found</html>").unwrap();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    assert_eq!(
        run.failure.as_ref().map(|f| f.kind),
        Some(ErrorKind::MalformedInputArtifact)
    );
    assert_eq!(fakes.shortcut.calls(), 0);
}

#[tokio::test]
async fn test_locked_name_is_busy() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let _held = env.assets.lock(MODEL).unwrap();
    let err = pipeline.run(&env.input, MODEL).await.unwrap_err();
    assert!(matches!(err, ConvertError::StoreBusy { .. }));
    assert_eq!(fakes.shortcut.calls(), 0);
}

#[tokio::test]
async fn test_invalid_name_is_rejected() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Succeed { size: MOBILE_SIZE });
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());

    let err = pipeline.run(&env.input, "../escape").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_outcome_record_serializes() {
    let env = TestEnv::new();
    let config = test_config();
    let fakes = Fakes::new(Behavior::Fail(unsupported_operator));
    let pipeline = env.pipeline(config.clone(), fakes.registry(&config), FakeResolver::available());
    let run = pipeline.run(&env.input, MODEL).await.unwrap();

    let report = env.temp.path().join("report.json");
    run.save(&report).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();

    assert_eq!(value["state"], "PUBLISHED");
    assert_eq!(value["model_name"], MODEL);
    assert_eq!(value["attempts"].as_array().unwrap().len(), 4);
    assert_eq!(value["attempts"][0]["role"], "shortcut");
    assert_eq!(value["attempts"][0]["outcome"]["kind"], "unsupported_operator");
    assert_eq!(value["attempts"][3]["outcome"]["status"], "succeeded");
}
