//! In-memory fakes for the engine, checkout, delivery and publisher seams
//! (testing only).
//!
//! Provides `FakeEngine`, `MemorySink`, `FakeCheckout`, `FakeDelivery` and
//! `MemoryPublisher` that satisfy the trait contracts without docker, git or
//! a broker.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::checkout::{Checkout, CheckoutError};
use crate::engine::{ContainerEngine, ContainerSpec, EngineError, ExecHandle};
use crate::job::Delivery;
use crate::progress::{ProgressMessage, ProgressSink, ReplyPublisher};

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Pull(String),
    Create(ContainerSpec),
    Start(String),
    /// The command passed to `exec`.
    Exec(String),
    Kill(String),
    Remove(String),
}

#[derive(Debug, Clone, Default)]
struct Scripted {
    chunks: Vec<Vec<u8>>,
    exit_code: i32,
    hang: bool,
    panic: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    pull: bool,
    create: bool,
    start: bool,
    exec: bool,
    kill: bool,
    remove: bool,
}

/// Scripted container engine with a full call log.
///
/// Commands without a script exit 0 with no output.
#[derive(Debug, Default)]
pub struct FakeEngine {
    scripts: HashMap<String, Scripted>,
    failures: Failures,
    calls: Mutex<Vec<EngineCall>>,
    next_id: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self, command: &str) -> &mut Scripted {
        self.scripts.entry(command.to_string()).or_default()
    }

    /// `command` exits with `code`.
    pub fn with_exit(mut self, command: &str, code: i32) -> Self {
        self.script(command).exit_code = code;
        self
    }

    /// `command` prints `output` as one chunk.
    pub fn with_output(mut self, command: &str, output: &[u8]) -> Self {
        self.script(command).chunks = vec![output.to_vec()];
        self
    }

    pub fn with_chunks(mut self, command: &str, chunks: Vec<Vec<u8>>) -> Self {
        self.script(command).chunks = chunks;
        self
    }

    /// `command` never finishes.
    pub fn with_hang(mut self, command: &str) -> Self {
        self.script(command).hang = true;
        self
    }

    /// `exec` of `command` panics after being recorded.
    pub fn with_panic(mut self, command: &str) -> Self {
        self.script(command).panic = true;
        self
    }

    pub fn fail_pull(mut self) -> Self {
        self.failures.pull = true;
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.failures.create = true;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.failures.start = true;
        self
    }

    pub fn fail_exec(mut self) -> Self {
        self.failures.exec = true;
        self
    }

    pub fn fail_kill(mut self) -> Self {
        self.failures.kill = true;
        self
    }

    pub fn fail_remove(mut self) -> Self {
        self.failures.remove = true;
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    /// Commands passed to `exec`, in order.
    pub fn executed(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                EngineCall::Exec(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// The spec of the last created container.
    pub fn created_spec(&self) -> Option<ContainerSpec> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|c| match c {
                EngineCall::Create(spec) => Some(spec.clone()),
                _ => None,
            })
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn injected(action: &str) -> EngineError {
        EngineError::CommandFailed {
            action: action.to_string(),
            status: Some(1),
            stderr: format!("injected {action} failure"),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Pull(image.to_string()));
        if self.failures.pull {
            return Err(Self::injected("pull"));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(EngineCall::Create(spec.clone()));
        if self.failures.create {
            return Err(Self::injected("create"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fake-container-{n}"))
    }

    async fn start(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Start(container_id.to_string()));
        if self.failures.start {
            return Err(Self::injected("start"));
        }
        Ok(())
    }

    async fn exec(
        &self,
        _container_id: &str,
        command: &str,
    ) -> Result<Box<dyn ExecHandle>, EngineError> {
        self.record(EngineCall::Exec(command.to_string()));
        if self.failures.exec {
            return Err(Self::injected("exec"));
        }
        let scripted = self.scripts.get(command).cloned().unwrap_or_default();
        if scripted.panic {
            panic!("exec exploded: {command}");
        }
        Ok(Box::new(FakeExec {
            chunks: scripted.chunks.into(),
            exit_code: scripted.exit_code,
            hang: scripted.hang,
        }))
    }

    async fn kill(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Kill(container_id.to_string()));
        if self.failures.kill {
            return Err(Self::injected("kill"));
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(container_id.to_string()));
        if self.failures.remove {
            return Err(Self::injected("rm"));
        }
        Ok(())
    }
}

struct FakeExec {
    chunks: VecDeque<Vec<u8>>,
    exit_code: i32,
    hang: bool,
}

#[async_trait]
impl ExecHandle for FakeExec {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Some(chunk);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn exit_code(self: Box<Self>) -> Result<i32, EngineError> {
        Ok(self.exit_code)
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Progress sink that keeps everything it was sent.
#[derive(Debug, Default)]
pub struct MemorySink {
    text: Mutex<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }
}

#[async_trait]
impl ProgressSink for MemorySink {
    async fn send(&self, text: &str) {
        self.text.lock().unwrap().push_str(text);
    }
}

// ---------------------------------------------------------------------------
// FakeCheckout
// ---------------------------------------------------------------------------

/// Checkout that writes fixed files instead of cloning.
#[derive(Debug, Default)]
pub struct FakeCheckout {
    files: Vec<(PathBuf, String)>,
    error: Option<CheckoutError>,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakeCheckout {
    /// Every checkout produces a tree with `manifest` as `.buildr.yml`.
    pub fn with_manifest(manifest: &str) -> Self {
        Self::default().with_file(".buildr.yml", manifest)
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.files.push((path.into(), contents.to_string()));
        self
    }

    /// Every checkout fails with `error`.
    pub fn failing(error: CheckoutError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// `(repo, branch)` of every checkout request.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Checkout for FakeCheckout {
    async fn checkout(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), CheckoutError> {
        self.requests
            .lock()
            .unwrap()
            .push((repo.to_string(), branch.to_string()));
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        for (path, contents) in &self.files {
            let target = dest.join(path);
            let written = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(&target, contents));
            if let Err(e) = written {
                return Err(CheckoutError::RepositoryInaccessible {
                    repo: repo.to_string(),
                    detail: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeDelivery
// ---------------------------------------------------------------------------

/// A queue delivery held in memory that counts its acknowledgments.
#[derive(Debug, Default)]
pub struct FakeDelivery {
    payload: Vec<u8>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    fail_ack: bool,
    acks: AtomicUsize,
    heartbeats: AtomicUsize,
}

impl FakeDelivery {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Delivery carrying `{"repo": repo, "branch": branch}`.
    pub fn job(repo: &str, branch: &str) -> Self {
        Self::new(serde_json::json!({ "repo": repo, "branch": branch }).to_string())
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn fail_ack(mut self) -> Self {
        self.fail_ack = true;
        self
    }

    /// Number of `ack` calls.
    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Number of `progress` calls.
    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    async fn ack(&self) -> anyhow::Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        if self.fail_ack {
            anyhow::bail!("injected ack failure");
        }
        Ok(())
    }

    async fn progress(&self) -> anyhow::Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublisher
// ---------------------------------------------------------------------------

/// One reply captured by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedReply {
    pub reply_to: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

impl PublishedReply {
    /// Decoded payload. Panics on a malformed body.
    pub fn message(&self) -> ProgressMessage {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Reply publisher that records instead of sending.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<PublishedReply>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher whose every publish fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<PublishedReply> {
        self.published.lock().unwrap().clone()
    }

    /// Decoded messages, in publish order.
    pub fn messages(&self) -> Vec<ProgressMessage> {
        self.published().iter().map(PublishedReply::message).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplyPublisher for MemoryPublisher {
    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<&str>,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            anyhow::bail!("injected publish failure");
        }
        self.published.lock().unwrap().push(PublishedReply {
            reply_to: reply_to.to_string(),
            correlation_id: correlation_id.map(str::to_string),
            body,
        });
        Ok(())
    }
}
