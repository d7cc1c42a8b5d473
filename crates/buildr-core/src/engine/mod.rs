//! Container engine seam.
//!
//! [`ContainerEngine`] is the narrow set of runtime calls a
//! [`ContainerSession`](crate::session::ContainerSession) needs. Production
//! uses [`DockerCli`]; tests use [`FakeEngine`](crate::fakes::FakeEngine).

pub mod docker;

use std::path::PathBuf;

use async_trait::async_trait;

pub use docker::DockerCli;

/// Working directory inside every build container.
pub const CONTAINER_WORKDIR: &str = "/app";

/// Errors produced by a container engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn container runtime {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("container runtime `{action}` failed (exit status {status:?}): {stderr}")]
    CommandFailed {
        action: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("malformed container runtime output: {0}")]
    Malformed(String),
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
}

impl BindMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }

    /// `host:container` form understood by `-v`.
    pub fn to_volume_arg(&self) -> String {
        format!("{}:{}", self.host.display(), self.container)
    }
}

/// Everything needed to create one build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub binds: Vec<BindMount>,
    pub env: Vec<String>,
    pub working_dir: String,
}

/// A command running inside a container.
#[async_trait]
pub trait ExecHandle: Send {
    /// Next raw output chunk, or `None` once the command's output is closed.
    async fn next_chunk(&mut self) -> Option<Vec<u8>>;

    /// Wait for the command to finish and return its exit code.
    async fn exit_code(self: Box<Self>) -> Result<i32, EngineError>;
}

/// Runtime operations used by a container session.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Create (but do not start) a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, container_id: &str) -> Result<(), EngineError>;

    /// Run a shell command in a started container.
    async fn exec(
        &self,
        container_id: &str,
        command: &str,
    ) -> Result<Box<dyn ExecHandle>, EngineError>;

    async fn kill(&self, container_id: &str) -> Result<(), EngineError>;

    async fn remove(&self, container_id: &str) -> Result<(), EngineError>;
}

/// Image reference with `:latest` appended when no tag or digest is present.
///
/// Only the last path component is inspected, so a registry port
/// (`registry:5000/app`) is not mistaken for a tag.
pub fn normalize_image(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        tracing::warn!(image = %image, "No tag provided on the image, defaulting to latest");
        format!("{image}:latest")
    }
}

/// Host path of a unix control socket URI, or `None` for non-unix sockets.
///
/// Accepts both `unix:///var/run/docker.sock` and the looser
/// `unix://var/run/docker.sock`.
pub fn control_socket_path(docker_sock: &str) -> Option<PathBuf> {
    let rest = match docker_sock.strip_prefix("unix://") {
        Some(rest) => rest,
        None if docker_sock.starts_with('/') => docker_sock,
        None => return None,
    };
    let trimmed = rest.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(format!("/{trimmed}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_image_adds_latest() {
        assert_eq!(normalize_image("ubuntu"), "ubuntu:latest");
        assert_eq!(normalize_image("registry:5000/team/app"), "registry:5000/team/app:latest");
    }

    #[test]
    fn test_normalize_image_keeps_tag_and_digest() {
        assert_eq!(normalize_image("ubuntu:22.04"), "ubuntu:22.04");
        assert_eq!(normalize_image("registry:5000/app:1"), "registry:5000/app:1");
        assert_eq!(normalize_image("app@sha256:abcd"), "app@sha256:abcd");
    }

    #[test]
    fn test_control_socket_path() {
        assert_eq!(
            control_socket_path("unix:///var/run/docker.sock"),
            Some(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            control_socket_path("unix://var/run/docker.sock"),
            Some(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            control_socket_path("/run/podman.sock"),
            Some(PathBuf::from("/run/podman.sock"))
        );
        assert_eq!(control_socket_path("tcp://10.0.0.1:2375"), None);
        assert_eq!(control_socket_path("unix://"), None);
    }

    #[test]
    fn test_volume_arg() {
        let bind = BindMount::new("/tmp/project", CONTAINER_WORKDIR);
        assert_eq!(bind.to_volume_arg(), "/tmp/project:/app");
    }
}
