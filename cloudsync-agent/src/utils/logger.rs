//! Logging setup using tracing.

use crate::utils::errors::{Result, SyncError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`; an unparsable level falls back to `info`.
/// With `compact` set, events are written on a single line without targets, which
/// reads better under journald.
pub fn init(level: &str, compact: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if compact {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    installed.map_err(|e| SyncError::Config(format!("logger already initialized: {e}")))
}
