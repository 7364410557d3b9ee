use crate::config::ConfigError;
use authenticator::KeySetError;
use ddapi::RemoteWriteSetupError;
use proxy::ProxyError;
use shared::logging::LoggingError;
use shared::prometheus::MetricsError;

/// Anything that stops a service process from starting.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up logging: {0}")]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("could not load token verification keys: {0}")]
    KeySet(#[from] KeySetError),
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid upstream: {0}")]
    Upstream(#[from] ProxyError),
    #[error(transparent)]
    RemoteWrite(#[from] RemoteWriteSetupError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
