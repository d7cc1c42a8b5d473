//! Source checkout: clone one branch of a repository into a job directory.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Errors produced while checking out a repository.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckoutError {
    #[error("branch '{branch}' not found in {repo}")]
    BranchNotFound { repo: String, branch: String },

    #[error("repository {repo} is inaccessible: {detail}")]
    RepositoryInaccessible { repo: String, detail: String },

    #[error("git is unavailable: {0}")]
    GitUnavailable(String),
}

/// Fetches source code for a job.
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Clone `branch` of `repo` into the existing, empty directory `dest`.
    async fn checkout(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), CheckoutError>;
}

/// Clones with the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitCheckout;

impl GitCheckout {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Checkout for GitCheckout {
    async fn checkout(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), CheckoutError> {
        debug!(repo = %repo, branch = %branch, dest = %dest.display(), "Cloning repository");
        let output = Command::new("git")
            .args(["clone", "--single-branch", "--branch", branch, repo])
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CheckoutError::GitUnavailable(format!("failed to run git: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_clone_failure(repo, branch, &stderr))
    }
}

fn classify_clone_failure(repo: &str, branch: &str, stderr: &str) -> CheckoutError {
    if stderr.contains("Remote branch") && stderr.contains("not found") {
        CheckoutError::BranchNotFound {
            repo: repo.to_string(),
            branch: branch.to_string(),
        }
    } else {
        CheckoutError::RepositoryInaccessible {
            repo: repo.to_string(),
            detail: stderr.to_string(),
        }
    }
}
