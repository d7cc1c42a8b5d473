//! Stage execution: run a manifest's stages against one container session.
//!
//! Stages and their scripts run strictly in manifest order. The first
//! non-zero exit code stops the run: in `prepare` it is an environment
//! error, anywhere else a build failure. Nothing is retried.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::ContainerEngine;
use crate::error::{BuildError, BuildOutcome};
use crate::manifest::{Manifest, PREPARE_STAGE};
use crate::obs;
use crate::progress::ProgressSink;
use crate::session::{ContainerSession, SessionConfig};

/// Runs manifests in fresh containers.
#[derive(Clone)]
pub struct StageExecutor {
    engine: Arc<dyn ContainerEngine>,
    docker_sock: String,
}

impl StageExecutor {
    pub fn new(engine: Arc<dyn ContainerEngine>, docker_sock: impl Into<String>) -> Self {
        Self {
            engine,
            docker_sock: docker_sock.into(),
        }
    }

    /// Open a session for `project_dir`, run every stage, then tear the
    /// session down whatever the outcome. Teardown errors are logged only.
    pub async fn run(
        &self,
        manifest: &Manifest,
        project_dir: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> BuildOutcome {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let config = SessionConfig::new(
            manifest.image(),
            project_dir,
            &self.docker_sock,
            manifest.env().to_vec(),
        );
        let mut session = ContainerSession::open(Arc::clone(&self.engine), &config).await?;

        let outcome = run_stages(&mut session, manifest, sink, cancel).await;

        if let Err(e) = session.close().await {
            obs::emit_teardown_error(session.container_id(), &e);
        }
        outcome
    }
}

/// Run every stage of `manifest` in an already open session.
pub async fn run_stages(
    session: &mut ContainerSession,
    manifest: &Manifest,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> BuildOutcome {
    info!(stages = ?manifest.stages(), "Running stages");

    for stage_name in manifest.stages() {
        let Some(stage) = manifest.stage(stage_name) else {
            warn!(stage = %stage_name, "Stage has no definition, skipping");
            continue;
        };

        info!(stage = %stage_name, "Running stage");
        obs::emit_stage_started(stage_name, stage.script.len());
        sink.line(&format!("Running stage \"{stage_name}\"")).await;

        for script in &stage.script {
            let exit_code = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(stage = %stage_name, "Build cancelled");
                    return Err(BuildError::Cancelled);
                }
                code = session.execute(script, sink) => code?,
            };

            if exit_code != 0 {
                obs::emit_stage_finished(stage_name, false);
                if stage_name == PREPARE_STAGE {
                    error!("Command exited with error, unable to prepare the environment.");
                    return Err(BuildError::Environment(format!(
                        "prepare failed with exit code {exit_code}, unable to set up the environment"
                    )));
                }
                error!(stage = %stage_name, exit_code, "Command exited with error, build failed.");
                return Err(BuildError::Failure {
                    stage: stage_name.clone(),
                    command: script.clone(),
                    exit_code,
                });
            }
        }

        obs::emit_stage_finished(stage_name, true);
        info!(stage = %stage_name, "Stage success");
        sink.line(&format!("Stage \"{stage_name}\" passed")).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{EngineCall, FakeEngine, MemorySink};
    use crate::result::BuildResult;

    fn manifest(source: &str) -> Manifest {
        Manifest::load_with_env(source, Vec::new()).unwrap()
    }

    async fn run(engine: Arc<FakeEngine>, source: &str) -> BuildOutcome {
        let executor = StageExecutor::new(engine, "unix:///var/run/docker.sock");
        executor
            .run(
                &manifest(source),
                Path::new("."),
                &MemorySink::new(),
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_scripts_run_in_manifest_order() {
        let engine = Arc::new(FakeEngine::new());
        run(
            engine.clone(),
            "version: 1\nstages: [b, a]\na:\n  script: [a1, a2]\nb:\n  script: [b1]\nprepare:\n  script: [p1]\n",
        )
        .await
        .unwrap();
        assert_eq!(engine.executed(), ["p1", "b1", "a1", "a2"]);
    }

    #[tokio::test]
    async fn test_failure_stops_later_stages() {
        let engine = Arc::new(FakeEngine::new().with_exit("boom", 2));
        let err = run(
            engine.clone(),
            "version: 1\nstages: [one, two]\none:\n  script: [ok, boom, never]\ntwo:\n  script: [never2]\n",
        )
        .await
        .unwrap_err();

        match &err {
            BuildError::Failure {
                stage, exit_code, ..
            } => {
                assert_eq!(stage, "one");
                assert_eq!(*exit_code, 2);
            }
            other => panic!("expected Failure, got {other:?}"),
        }
        assert_eq!(err.result(), BuildResult::Fail);
        assert_eq!(engine.executed(), ["ok", "boom"]);
        assert_eq!(engine.count(|c| matches!(c, EngineCall::Remove(_))), 1);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_environment_error() {
        let engine = Arc::new(FakeEngine::new().with_exit("false", 1));
        let err = run(
            engine.clone(),
            "version: 1\nstages: [build]\nprepare:\n  script: [\"false\"]\nbuild:\n  script: [\"true\"]\n",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::Environment(_)));
        assert_eq!(err.result(), BuildResult::Error);
        assert_eq!(engine.executed(), ["false"]);
    }

    #[tokio::test]
    async fn test_undefined_stage_skipped() {
        let engine = Arc::new(FakeEngine::new());
        run(
            engine.clone(),
            "version: 1\nprepare: true\nstages: [ghost, build]\nbuild:\n  script: [make]\n",
        )
        .await
        .unwrap();
        assert_eq!(engine.executed(), ["make"]);
    }

    #[tokio::test]
    async fn test_start_failure_is_environment_error() {
        let engine = Arc::new(FakeEngine::new().fail_start());
        let err = run(engine.clone(), "version: 1\nstages: [b]\nb:\n  script: [x]\n")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Environment(_)));
        assert!(engine.executed().is_empty());
        assert_eq!(engine.count(|c| matches!(c, EngineCall::Remove(_))), 1);
    }

    #[tokio::test]
    async fn test_teardown_failure_keeps_result() {
        let engine = Arc::new(FakeEngine::new().fail_remove());
        run(engine.clone(), "version: 1\nstages: [b]\nb:\n  script: [x]\n")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_progress_lines_wrap_stage() {
        let engine = Arc::new(FakeEngine::new().with_output("make", b"compiling\n"));
        let sink = MemorySink::new();
        StageExecutor::new(engine, "unix:///var/run/docker.sock")
            .run(
                &manifest("version: 1\nstages: [build]\nbuild:\n  script: [make]\n"),
                Path::new("."),
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            sink.text(),
            "Running stage \"build\"\ncompiling\nStage \"build\" passed\n"
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_open_touches_nothing() {
        let engine = Arc::new(FakeEngine::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = StageExecutor::new(engine.clone(), "unix:///var/run/docker.sock")
            .run(
                &manifest("version: 1\nstages: [b]\nb:\n  script: [x]\n"),
                Path::new("."),
                &MemorySink::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_script_tears_down() {
        let engine = Arc::new(FakeEngine::new().with_hang("sleep 3600"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = StageExecutor::new(engine.clone(), "unix:///var/run/docker.sock")
            .run(
                &manifest("version: 1\nstages: [b, c]\nb:\n  script: [\"sleep 3600\"]\nc:\n  script: [after]\n"),
                Path::new("."),
                &MemorySink::new(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::Cancelled));
        assert_eq!(engine.executed(), ["sleep 3600"]);
        assert_eq!(engine.count(|c| matches!(c, EngineCall::Remove(_))), 1);
    }
}
