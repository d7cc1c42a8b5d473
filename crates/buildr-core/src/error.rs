//! Build error taxonomy.
//!
//! Every failure a job can hit is converted into a [`BuildError`] at the job
//! handler boundary. The variant decides the reported [`BuildResult`], the
//! progress line the submitter sees, and the CLI exit code.

use crate::checkout::CheckoutError;
use crate::manifest::ManifestError;
use crate::result::BuildResult;
use crate::session::SessionError;

/// What part of job setup went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupKind {
    /// The job message could not be decoded or lacks `repo`.
    InvalidJob,
    BranchNotFound,
    RepositoryInaccessible,
    /// The checkout tooling itself is unusable.
    Checkout,
    /// Manifest missing, unreadable, invalid or unsupported.
    Manifest,
    /// The job working directory could not be created.
    Workspace,
}

/// Errors produced while running a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("setup error: {message}")]
    Setup { kind: SetupKind, message: String },

    #[error("environment error: {0}")]
    Environment(String),

    #[error("stage '{stage}' failed with exit code {exit_code}")]
    Failure {
        stage: String,
        command: String,
        exit_code: i32,
    },

    #[error("build cancelled")]
    Cancelled,

    #[error("unknown fault: {0}")]
    Unknown(String),
}

impl BuildError {
    pub fn setup(kind: SetupKind, message: impl Into<String>) -> Self {
        BuildError::Setup {
            kind,
            message: message.into(),
        }
    }

    /// The job result this error classifies as.
    pub fn result(&self) -> BuildResult {
        match self {
            BuildError::Failure { .. } => BuildResult::Fail,
            _ => BuildResult::Error,
        }
    }

    /// Line reported to the submitter before the terminal message.
    pub fn progress_line(&self) -> String {
        match self {
            BuildError::Setup {
                kind: SetupKind::BranchNotFound,
                ..
            } => "Build prep failed, branch doesn't exist".to_string(),
            BuildError::Setup {
                kind: SetupKind::RepositoryInaccessible,
                ..
            } => "Build prep failed, repository inaccessible".to_string(),
            BuildError::Setup { .. } | BuildError::Environment(_) => {
                "Build prep error.".to_string()
            }
            BuildError::Failure { .. } => "Build execution failed".to_string(),
            BuildError::Cancelled => "Build aborted".to_string(),
            BuildError::Unknown(detail) => format!("Unknown error {detail}"),
        }
    }

    /// Process exit code for the local CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Failure { .. } => 1,
            BuildError::Cancelled => 130,
            BuildError::Setup { .. } | BuildError::Environment(_) | BuildError::Unknown(_) => 2,
        }
    }
}

impl From<ManifestError> for BuildError {
    fn from(err: ManifestError) -> Self {
        BuildError::setup(SetupKind::Manifest, err.to_string())
    }
}

impl From<CheckoutError> for BuildError {
    fn from(err: CheckoutError) -> Self {
        let kind = match &err {
            CheckoutError::BranchNotFound { .. } => SetupKind::BranchNotFound,
            CheckoutError::RepositoryInaccessible { .. } => SetupKind::RepositoryInaccessible,
            CheckoutError::GitUnavailable(_) => SetupKind::Checkout,
        };
        BuildError::setup(kind, err.to_string())
    }
}

impl From<SessionError> for BuildError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Pull { .. }
            | SessionError::Create { .. }
            | SessionError::Start { .. }
            | SessionError::Exec { .. } => BuildError::Environment(err.to_string()),
            SessionError::NotRunning { .. } | SessionError::Teardown { .. } => {
                BuildError::Unknown(err.to_string())
            }
        }
    }
}

/// Result type for build operations.
pub type BuildOutcome<T = ()> = std::result::Result<T, BuildError>;
