//! [`ContainerEngine`] backed by the docker command line.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ContainerEngine, ContainerSpec, EngineError, ExecHandle};

/// Environment variable that overrides the runtime binary.
pub const RUNTIME_ENV: &str = "BUILDR_CONTAINER_RUNTIME";

const CHUNK_SIZE: usize = 8 * 1024;

/// Drives `docker -H <socket> ...` through `tokio::process`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    host: String,
}

impl DockerCli {
    /// Engine talking to `docker_sock`, using `$BUILDR_CONTAINER_RUNTIME` or
    /// `docker` as the binary.
    pub fn new(docker_sock: impl Into<String>) -> Self {
        let program = std::env::var(RUNTIME_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "docker".to_string());
        Self::with_program(program, docker_sock)
    }

    pub fn with_program(program: impl Into<String>, docker_sock: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            host: docker_sock.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-H")
            .arg(&self.host)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Run one runtime command to completion, returning its stdout.
    async fn run(&self, action: &str, args: &[String]) -> Result<String, EngineError> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                action: action.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Arguments for `docker create`.
pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "-i".to_string(),
        "-w".to_string(),
        spec.working_dir.clone(),
    ];
    for bind in &spec.binds {
        args.push("-v".to_string());
        args.push(bind.to_volume_arg());
    }
    for var in &spec.env {
        args.push("-e".to_string());
        args.push(var.clone());
    }
    args.push(spec.image.clone());
    args.push("sh".to_string());
    args
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        let out = self.run("pull", &["pull".to_string(), image.to_string()]).await?;
        for line in out.lines() {
            debug!(image = %image, "{line}");
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let out = self.run("create", &create_args(spec)).await?;
        let id = out.trim();
        if id.is_empty() {
            return Err(EngineError::Malformed(
                "docker create returned no container id".to_string(),
            ));
        }
        Ok(id.to_string())
    }

    async fn start(&self, container_id: &str) -> Result<(), EngineError> {
        self.run("start", &["start".to_string(), container_id.to_string()])
            .await
            .map(|_| ())
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
    ) -> Result<Box<dyn ExecHandle>, EngineError> {
        let mut child = self
            .command()
            .args(["exec", container_id, "sh", "-c", command])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, tx));
        }
        Ok(Box::new(DockerExec { child, rx }))
    }

    async fn kill(&self, container_id: &str) -> Result<(), EngineError> {
        self.run("kill", &["kill".to_string(), container_id.to_string()])
            .await
            .map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        self.run(
            "rm",
            &["rm".to_string(), "-f".to_string(), container_id.to_string()],
        )
        .await
        .map(|_| ())
    }
}

async fn forward_output<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "exec output stream closed");
                break;
            }
        }
    }
}

struct DockerExec {
    child: Child,
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl ExecHandle for DockerExec {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    async fn exit_code(self: Box<Self>) -> Result<i32, EngineError> {
        let DockerExec { mut child, rx } = *self;
        drop(rx);
        let status = child.wait().await.map_err(|e| {
            EngineError::Malformed(format!("failed to wait for exec process: {e}"))
        })?;
        status.code().ok_or_else(|| {
            EngineError::Malformed("exec process terminated by signal".to_string())
        })
    }
}
