//! Process-wide log setup.
//!
//! `RUST_LOG` selects levels (default `info`). Records from the `log` facade,
//! which the library uses, are forwarded into `tracing`.

use thiserror::Error;
use tracing_subscriber::{prelude::*, EnvFilter};

use fanout::LogFormat;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to install log bridge: {0}")]
    Bridge(#[from] log::SetLoggerError),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init(format: LogFormat) -> Result<(), LoggingError> {
    tracing_log::LogTracer::init()?;

    let env_filter = build_env_filter();
    match format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .compact()
                    .with_filter(env_filter),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .json()
                    .with_current_span(true)
                    .with_filter(env_filter),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}
