//! Container session: one ephemeral build container as a scoped resource.
//!
//! ```text
//! open() ──► Created ──► Started ──► Executing(0..n) ──► TornDown
//!                                        ▲      │
//!                                        └──────┘ execute()
//! ```
//!
//! [`ContainerSession::open`] returns only a started container (a container
//! whose start failed is removed before the error is returned).
//! [`ContainerSession::close`] tears it down at most once; a session dropped
//! without being closed schedules the teardown on the current runtime.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::engine::{
    control_socket_path, normalize_image, BindMount, ContainerEngine, ContainerSpec, EngineError,
    CONTAINER_WORKDIR,
};
use crate::obs;
use crate::progress::ProgressSink;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Executing,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Started => "started",
            SessionState::Executing => "executing",
            SessionState::TornDown => "torn down",
        };
        f.write_str(s)
    }
}

/// Errors produced by a container session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to pull image {image}: {source}")]
    Pull { image: String, source: EngineError },

    #[error("failed to create container: {source}")]
    Create { source: EngineError },

    #[error("failed to start container: {source}")]
    Start { source: EngineError },

    #[error("container runtime failed while executing a command: {source}")]
    Exec { source: EngineError },

    #[error("failed to tear down container {container_id}: {source}")]
    Teardown {
        container_id: String,
        source: EngineError,
    },

    /// `execute` on a session that is not running. A usage error, not a build error.
    #[error("session is {state}, cannot execute commands")]
    NotRunning { state: SessionState },
}

/// What to run and what to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub image: String,
    pub project_dir: PathBuf,
    /// Host control socket bound at the same path inside the container.
    pub control_socket: Option<PathBuf>,
    pub env: Vec<String>,
}

impl SessionConfig {
    /// Config for `project_dir` with the control socket derived from `docker_sock`.
    pub fn new(
        image: impl Into<String>,
        project_dir: impl Into<PathBuf>,
        docker_sock: &str,
        env: Vec<String>,
    ) -> Self {
        Self {
            image: image.into(),
            project_dir: project_dir.into(),
            control_socket: control_socket_path(docker_sock),
            env,
        }
    }

    fn container_spec(&self) -> ContainerSpec {
        let project_dir = absolute(&self.project_dir);
        let mut binds = vec![BindMount::new(project_dir, CONTAINER_WORKDIR)];
        if let Some(sock) = &self.control_socket {
            binds.push(BindMount::new(sock.clone(), sock.to_string_lossy()));
        }
        ContainerSpec {
            image: normalize_image(&self.image),
            binds,
            env: self.env.clone(),
            working_dir: CONTAINER_WORKDIR.to_string(),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}

/// Exclusive handle to one running build container.
pub struct ContainerSession {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
    state: SessionState,
    executions: usize,
}

impl fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSession")
            .field("container_id", &self.container_id)
            .field("state", &self.state)
            .field("executions", &self.executions)
            .finish()
    }
}

impl ContainerSession {
    /// Pull the image, create the container and start it.
    pub async fn open(
        engine: Arc<dyn ContainerEngine>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let spec = config.container_spec();

        debug!(image = %spec.image, "Pulling image");
        engine
            .pull(&spec.image)
            .await
            .map_err(|source| SessionError::Pull {
                image: spec.image.clone(),
                source,
            })?;

        debug!(image = %spec.image, "Creating container");
        let container_id = engine
            .create(&spec)
            .await
            .map_err(|source| SessionError::Create { source })?;

        let mut session = Self {
            engine,
            container_id,
            state: SessionState::Created,
            executions: 0,
        };

        debug!(container_id = %session.container_id, "Starting container");
        if let Err(source) = session.engine.start(&session.container_id).await {
            if let Err(e) = session.close().await {
                obs::emit_teardown_error(&session.container_id, &e);
            }
            return Err(SessionError::Start { source });
        }
        session.state = SessionState::Started;
        obs::emit_session_opened(&session.container_id, &spec.image);
        Ok(session)
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of commands executed so far.
    pub fn executions(&self) -> usize {
        self.executions
    }

    /// Run `command` in the container, streaming output to `sink`, and
    /// return its exit code. Chunks that are not valid UTF-8 are dropped.
    pub async fn execute(
        &mut self,
        command: &str,
        sink: &dyn ProgressSink,
    ) -> Result<i32, SessionError> {
        match self.state {
            SessionState::Started | SessionState::Executing => {}
            state => return Err(SessionError::NotRunning { state }),
        }
        self.state = SessionState::Executing;
        self.executions += 1;

        debug!(container_id = %self.container_id, command = %command, "Executing command");
        let mut handle = self
            .engine
            .exec(&self.container_id, command)
            .await
            .map_err(|source| SessionError::Exec { source })?;

        while let Some(chunk) = handle.next_chunk().await {
            if let Ok(text) = std::str::from_utf8(&chunk) {
                sink.send(text).await;
            }
        }

        let exit_code = handle
            .exit_code()
            .await
            .map_err(|source| SessionError::Exec { source })?;
        if exit_code == 0 {
            debug!(container_id = %self.container_id, "Command execution success");
        } else {
            warn!(container_id = %self.container_id, exit_code, "Command execution failed");
        }
        Ok(exit_code)
    }

    /// Kill and remove the container. Only the first call reaches the engine.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::TornDown {
            debug!(container_id = %self.container_id, "Session already torn down");
            return Ok(());
        }
        self.state = SessionState::TornDown;
        teardown(self.engine.as_ref(), &self.container_id).await?;
        obs::emit_session_closed(&self.container_id, self.executions);
        Ok(())
    }
}

/// Kill then remove; a failed kill (e.g. the container already exited)
/// does not skip the removal.
async fn teardown(engine: &dyn ContainerEngine, container_id: &str) -> Result<(), SessionError> {
    debug!(container_id = %container_id, "Killing container");
    if let Err(e) = engine.kill(container_id).await {
        debug!(container_id = %container_id, error = %e, "Kill failed, removing anyway");
    }
    debug!(container_id = %container_id, "Removing container");
    engine
        .remove(container_id)
        .await
        .map_err(|source| SessionError::Teardown {
            container_id: container_id.to_string(),
            source,
        })
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        self.state = SessionState::TornDown;
        let engine = Arc::clone(&self.engine);
        let container_id = self.container_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(container_id = %container_id, "Session dropped without close, tearing down");
                handle.spawn(async move {
                    if let Err(e) = teardown(engine.as_ref(), &container_id).await {
                        obs::emit_teardown_error(&container_id, &e);
                    }
                });
            }
            Err(_) => {
                error!(container_id = %container_id, "Session dropped outside a runtime, container leaked");
            }
        }
    }
}
