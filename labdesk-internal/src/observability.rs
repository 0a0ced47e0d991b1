//! Log setup for the gateway.
//!
//! Logging is initialised before the config file is read, so `gateway.debug`
//! can only raise verbosity after the fact through [`DelayedDebugLogs`].

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use crate::error::{Error, ErrorDetails};

pub const DEFAULT_LOG_FILTER: &str = "warn,labdesk_internal=info,gateway=info";
const DEBUG_LOG_FILTER: &str = "warn,labdesk_internal=debug,gateway=debug";

#[derive(Clone, Debug, Default, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Handle for switching to debug-level logs once the config is known.
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    /// `RUST_LOG` always wins over `gateway.debug`
    from_env: bool,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.from_env {
            tracing::info!("`RUST_LOG` is set, ignoring `gateway.debug`");
            return Ok(());
        }
        self.handle
            .reload(EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

pub struct DelayedLogConfig {
    pub delayed_debug_logs: DelayedDebugLogs,
}

fn env_filter() -> (EnvFilter, bool) {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => (EnvFilter::new(directives), true),
        _ => (EnvFilter::new(DEFAULT_LOG_FILTER), false),
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedLogConfig, Error> {
    let (filter, from_env) = env_filter();
    let (filter, handle) = reload::Layer::new(filter);

    let fmt_layer = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })?;

    Ok(DelayedLogConfig {
        delayed_debug_logs: DelayedDebugLogs { handle, from_env },
    })
}
