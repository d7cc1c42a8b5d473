//! Tracing initialisation for buildr binaries.
//!
//! Logs always go to stderr: stdout belongs to build output in local mode
//! and to `check`/`submit` results in the CLI.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset. The NATS client is chatty at debug.
pub fn default_directives(level: Level) -> String {
    format!("{},async_nats=warn", level.as_str().to_lowercase())
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let plain = (!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));
    let json = json.then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .ok();
}
