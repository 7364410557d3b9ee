use serde::Deserialize;
use shared::logging::SentryOptions;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prefix of the request duration histogram, replacing the per-service default.
    pub namespace: Option<String>,
}

/// Optional YAML settings shared by every service process.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(namespace) = &self.metrics.namespace
            && !is_metric_prefix(namespace)
        {
            return Err(ConfigError::InvalidNamespace(namespace.clone()));
        }
        if self.logging.sentry_dsn.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::EmptySentryDsn);
        }
        Ok(())
    }

    pub fn sentry_options(&self) -> Option<SentryOptions> {
        self.logging.sentry_dsn.as_ref().map(|dsn| SentryOptions {
            dsn: dsn.clone(),
            environment: self.logging.environment.clone(),
        })
    }

    pub fn namespace<'a>(&'a self, default: &'a str) -> &'a str {
        self.metrics.namespace.as_deref().unwrap_or(default)
    }
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
fn is_metric_prefix(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("metrics.namespace is not a valid metric name prefix: {0:?}")]
    InvalidNamespace(String),
    #[error("logging.sentry_dsn must not be empty")]
    EmptySentryDsn,
}
