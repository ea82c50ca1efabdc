use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{ExportError, Result};

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured filter.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| ExportError::Config(format!("invalid log filter: {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_target(true))
            .try_init(),
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(fmt::layer().compact().with_target(true))
            .try_init(),
    };
    installed.map_err(|e| ExportError::Runtime(format!("failed to init tracing: {e}")))
}
