use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(LoggingError::BadLevel(s.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("bad log level: {0} (expected one of error|info|debug)")]
    BadLevel(String),
    #[error("invalid sentry DSN: {0}")]
    InvalidDsn(#[from] sentry::types::ParseDsnError),
}

#[derive(Debug, Clone)]
pub struct SentryOptions {
    pub dsn: String,
    pub environment: Option<String>,
}

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence over
/// `level` when set.
///
/// The returned guard flushes pending Sentry events on drop; keep it alive
/// until the process exits.
pub fn init(
    level: LogLevel,
    sentry_options: Option<&SentryOptions>,
) -> Result<Option<sentry::ClientInitGuard>, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    let guard = match sentry_options {
        Some(options) => {
            let dsn: sentry::types::Dsn = options.dsn.parse()?;
            Some(sentry::init(sentry::ClientOptions {
                dsn: Some(dsn),
                environment: options.environment.clone().map(Cow::Owned),
                release: sentry::release_name!(),
                ..Default::default()
            }))
        }
        None => None,
    };
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    Ok(guard)
}
