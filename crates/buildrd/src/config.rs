use std::path::PathBuf;
use std::time::Duration;

use buildr_core::config::{
    DEFAULT_BRANCH, DEFAULT_DOCKER_SOCK, DEFAULT_HEARTBEAT_SECS, DEFAULT_QUEUE, DEFAULT_WORKERS,
};
use buildr_core::BuildrConfig;
use buildr_queue::{QueueConfig, DEFAULT_CONSUMER, DEFAULT_NATS_URL, DEFAULT_STREAM};
use clap::Parser;

/// Worker daemon settings. Every flag can also be set from the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "buildrd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "buildr worker: runs queued builds in containers", long_about = None)]
pub struct Config {
    #[arg(long, env = "BUILDR_NATS_URL", default_value = DEFAULT_NATS_URL)]
    pub nats_url: String,

    /// Subject jobs are published on
    #[arg(long, env = "BUILDR_QUEUE", default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Maximum concurrent builds
    #[arg(long, env = "BUILDR_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    #[arg(long, env = "BUILDR_DOCKER_SOCK", default_value = DEFAULT_DOCKER_SOCK)]
    pub docker_sock: String,

    #[arg(long, env = "BUILDR_STREAM", default_value = DEFAULT_STREAM)]
    pub stream: String,

    /// Durable consumer name shared by all workers
    #[arg(long, env = "BUILDR_CONSUMER", default_value = DEFAULT_CONSUMER)]
    pub consumer: String,

    /// Seconds a build may run before the broker redelivers it
    #[arg(long, env = "BUILDR_ACK_WAIT_SECS", default_value_t = 3600)]
    pub ack_wait_secs: u64,

    /// Seconds between in-progress acks for a running build
    #[arg(long, env = "BUILDR_HEARTBEAT_SECS", default_value_t = DEFAULT_HEARTBEAT_SECS)]
    pub heartbeat_secs: u64,

    /// Parent directory for job checkouts
    #[arg(long, env = "BUILDR_WORK_ROOT")]
    pub work_root: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "BUILDR_LOG_JSON")]
    pub log_json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn buildr(&self) -> BuildrConfig {
        BuildrConfig {
            docker_sock: self.docker_sock.clone(),
            workers: self.workers,
            queue_name: self.queue.clone(),
            work_root: self.work_root.clone(),
            default_branch: DEFAULT_BRANCH.to_string(),
            heartbeat_secs: self.heartbeat_secs(),
        }
    }

    /// Heartbeat interval, kept under half of `ack_wait` so a running build
    /// is never redelivered.
    fn heartbeat_secs(&self) -> u64 {
        let ceiling = (self.ack_wait_secs / 2).max(1);
        self.heartbeat_secs.min(ceiling)
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            nats_url: self.nats_url.clone(),
            subject: self.queue.clone(),
            stream: self.stream.clone(),
            consumer: self.consumer.clone(),
            ack_wait: Duration::from_secs(self.ack_wait_secs),
            max_ack_pending: self.workers,
            ..QueueConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["buildrd"]).unwrap();
        let buildr = config.buildr();
        assert_eq!(buildr.workers, 2);
        assert_eq!(buildr.queue_name, "build_queue");
        assert_eq!(buildr.docker_sock, "unix:///var/run/docker.sock");
        buildr.validate().unwrap();

        let queue = config.queue();
        assert_eq!(queue.stream, "BUILDS");
        assert_eq!(queue.consumer, "buildr-workers");
        assert_eq!(queue.ack_wait, Duration::from_secs(3600));
        assert_eq!(queue.max_ack_pending, 2);
        assert_eq!(buildr.heartbeat_secs, 60);
    }

    #[test]
    fn test_heartbeat_stays_under_ack_wait() {
        let config = Config::try_parse_from(["buildrd", "--ack-wait-secs", "30"]).unwrap();
        assert_eq!(config.buildr().heartbeat_secs, 15);

        let config = Config::try_parse_from(["buildrd", "--ack-wait-secs", "1"]).unwrap();
        assert_eq!(config.buildr().heartbeat_secs, 1);
    }

    #[test]
    fn test_pool_size_bounds_consumer() {
        let config = Config::try_parse_from(["buildrd", "--workers", "8", "--queue", "ci.jobs"])
            .unwrap();
        assert_eq!(config.buildr().workers, 8);
        assert_eq!(config.queue().max_ack_pending, 8);
        assert_eq!(config.queue().subject, "ci.jobs");
    }

    #[test]
    fn test_zero_workers_fails_validation() {
        let config = Config::try_parse_from(["buildrd", "--workers", "0"]).unwrap();
        assert!(config.buildr().validate().is_err());
    }
}
