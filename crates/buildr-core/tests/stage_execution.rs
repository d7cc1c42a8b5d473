//! Manifest discovery through stage execution on a scratch project.

use std::sync::Arc;

use buildr_core::fakes::{EngineCall, FakeEngine, MemorySink};
use buildr_core::{BuildError, BuildResult, ContainerSession, Manifest, SessionConfig, StageExecutor};
use tokio_util::sync::CancellationToken;

fn project(manifest_name: &str, source: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(manifest_name), source).unwrap();
    dir
}

#[tokio::test]
async fn discovered_manifest_drives_container() {
    let dir = project(
        ".buildr.yml",
        "version: 1\nimage: rust:1.80\nenvironment:\n  vars: [\"CI=true\", \"MODE=release\"]\nstages: [build, test]\nbuild:\n  script: [cargo build]\ntest:\n  script: [cargo test]\n",
    );
    let manifest = Manifest::discover(dir.path()).unwrap();
    let engine = Arc::new(FakeEngine::new());

    StageExecutor::new(engine.clone(), "unix:///var/run/docker.sock")
        .run(&manifest, dir.path(), &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();

    let calls = engine.calls();
    assert_eq!(calls[0], EngineCall::Pull("rust:1.80".to_string()));
    let spec = engine.created_spec().unwrap();
    assert_eq!(spec.image, "rust:1.80");
    assert_eq!(spec.env, ["CI=true", "MODE=release"]);
    assert_eq!(spec.binds[0].host, std::fs::canonicalize(dir.path()).unwrap());
    assert_eq!(spec.binds[0].container, "/app");
    assert_eq!(engine.executed(), ["cargo build", "cargo test"]);
    assert!(matches!(calls.last(), Some(EngineCall::Remove(_))));
}

#[tokio::test]
async fn untagged_image_pulls_latest() {
    let dir = project(".buildr", "version: 1\nimage: alpine\nstages: []\n");
    let manifest = Manifest::discover(dir.path()).unwrap();
    let engine = Arc::new(FakeEngine::new());

    StageExecutor::new(engine.clone(), "tcp://127.0.0.1:2375")
        .run(&manifest, dir.path(), &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(engine.calls()[0], EngineCall::Pull("alpine:latest".to_string()));
    assert_eq!(engine.created_spec().unwrap().binds.len(), 1);
}

#[tokio::test]
async fn prepare_runs_first_even_when_listed_last() {
    let dir = project(
        ".buildr.yaml",
        "version: 1\nstages: [build, prepare]\nprepare:\n  script: [apt-get update]\nbuild:\n  script: [make]\n",
    );
    let manifest = Manifest::discover(dir.path()).unwrap();
    assert_eq!(manifest.stages(), ["prepare", "build"]);

    let engine = Arc::new(FakeEngine::new());
    StageExecutor::new(engine.clone(), "unix:///var/run/docker.sock")
        .run(&manifest, dir.path(), &MemorySink::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(engine.executed(), ["apt-get update", "make"]);
}

#[tokio::test]
async fn failing_stage_output_reaches_sink() {
    let dir = project(
        ".buildr.yml",
        "version: 1\nstages: [lint, build]\nlint:\n  script: [clippy]\nbuild:\n  script: [make]\n",
    );
    let manifest = Manifest::discover(dir.path()).unwrap();
    let engine = Arc::new(
        FakeEngine::new()
            .with_output("clippy", b"warning: unused variable\n")
            .with_exit("clippy", 101),
    );
    let sink = MemorySink::new();

    let err = StageExecutor::new(engine.clone(), "unix:///var/run/docker.sock")
        .run(&manifest, dir.path(), &sink, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Failure { exit_code: 101, .. }));
    assert_eq!(err.result(), BuildResult::Fail);
    assert_eq!(err.exit_code(), 1);
    assert_eq!(
        sink.lines(),
        ["Running stage \"lint\"", "warning: unused variable"]
    );
    assert_eq!(engine.executed(), ["clippy"]);
}

#[tokio::test]
async fn session_reused_for_sequential_commands() {
    let engine = Arc::new(FakeEngine::new().with_exit("second", 4));
    let config = SessionConfig::new("busybox:1", "/tmp", "unix:///var/run/docker.sock", vec![]);
    let sink = MemorySink::new();

    let mut session = ContainerSession::open(engine.clone(), &config).await.unwrap();
    assert_eq!(session.execute("first", &sink).await.unwrap(), 0);
    assert_eq!(session.execute("second", &sink).await.unwrap(), 4);
    assert_eq!(session.executions(), 2);
    session.close().await.unwrap();

    assert_eq!(engine.count(|c| matches!(c, EngineCall::Create(_))), 1);
    assert_eq!(engine.count(|c| matches!(c, EngineCall::Remove(_))), 1);
}
