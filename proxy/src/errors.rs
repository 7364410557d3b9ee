use http::StatusCode;
use http::header::InvalidHeaderValue;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("upstream URL must use the http scheme, proxied upstreams do not speak TLS: {0}")]
    UnsupportedScheme(url::Url),
    #[error("upstream URL has no host: {0}")]
    MissingHost(url::Url),
    #[error("invalid upstream URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("path contains a dot segment: {0}")]
    DotSegment(String),
    #[error("tenant name is not a valid header value: {0}")]
    InvalidTenant(#[from] InvalidHeaderValue),
    #[error(transparent)]
    Upstream(#[from] hyper_util::client::legacy::Error),
    #[error("backend tried to switch protocol {offered:?} when {requested:?} was requested")]
    UnexpectedUpgrade {
        requested: Option<String>,
        offered: Option<String>,
    },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTenant(_) | ProxyError::DotSegment(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
