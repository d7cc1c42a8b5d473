//! buildr core library
//!
//! Manifest model, container sessions, stage execution, progress relay and
//! job handling for the buildr build runner.

pub mod checkout;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod job;
pub mod manifest;
pub mod obs;
pub mod progress;
pub mod result;
pub mod session;
pub mod telemetry;

pub use checkout::{Checkout, CheckoutError, GitCheckout};
pub use config::{BuildrConfig, ConfigError};
pub use engine::{ContainerEngine, ContainerSpec, DockerCli, EngineError, ExecHandle};
pub use error::{BuildError, BuildOutcome, SetupKind};
pub use executor::{run_stages, StageExecutor};
pub use job::{Delivery, JobHandler, JobMessage, JobOutcome};
pub use manifest::{Manifest, ManifestError, StageDefinition};
pub use obs::job_span;
pub use progress::{
    ProgressMessage, ProgressSink, ReplyPublisher, ReplySink, StdoutSink, FINISHED_LINE,
    STARTED_LINE,
};
pub use result::{BuildResult, ResultCell};
pub use session::{ContainerSession, SessionConfig, SessionError, SessionState};
pub use telemetry::init_tracing;

/// buildr version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
