//! Runner configuration passed into the job handler at construction.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DOCKER_SOCK: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_QUEUE: &str = "build_queue";
pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("workers must be at least 1")]
    NoWorkers,

    #[error("queue name must not be empty")]
    EmptyQueue,

    #[error("docker socket must not be empty")]
    EmptyDockerSock,

    #[error("heartbeat interval must be at least 1 second")]
    NoHeartbeat,
}

/// Settings shared by every job a runner handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildrConfig {
    /// Container runtime control socket URI.
    pub docker_sock: String,
    /// Bounded worker pool size.
    pub workers: usize,
    /// Subject jobs are submitted on.
    pub queue_name: String,
    /// Parent of per-job working directories; the system temp dir when unset.
    pub work_root: Option<PathBuf>,
    /// Branch used when a job names none.
    pub default_branch: String,
    /// Seconds between in-progress acks while a job runs.
    pub heartbeat_secs: u64,
}

impl Default for BuildrConfig {
    fn default() -> Self {
        Self {
            docker_sock: DEFAULT_DOCKER_SOCK.to_string(),
            workers: DEFAULT_WORKERS,
            queue_name: DEFAULT_QUEUE.to_string(),
            work_root: None,
            default_branch: DEFAULT_BRANCH.to_string(),
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

impl BuildrConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::EmptyQueue);
        }
        if self.docker_sock.trim().is_empty() {
            return Err(ConfigError::EmptyDockerSock);
        }
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::NoHeartbeat);
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}
