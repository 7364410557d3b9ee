use crate::translate::TranslateError;
use authenticator::AuthError;
use http::{Response, StatusCode};
use shared::handler::ResponseBody;
use shared::http::{error_chain, text_response};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum RemoteWriteSetupError {
    #[error("remote_write URL must use http or https: {0}")]
    UnsupportedScheme(Url),
    #[error("remote_write URL has no host: {0}")]
    MissingHost(Url),
    #[error("could not build remote_write client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("bad request: request lacks content-type header")]
    MissingContentType,
    #[error("bad request: unexpected content-type header (expecting: application/json)")]
    UnexpectedContentType,
    #[error("bad request: error while zlib-decoding request body: {0}")]
    Deflate(#[source] std::io::Error),
    #[error("bad request: error while translating body: {0}")]
    Translate(#[from] TranslateError),
    #[error("error while reading request body: {0}")]
    ReadBody(#[source] hyper::Error),
    #[error("error while constructing Prometheus protobuf message: {0}")]
    Encode(#[source] snap::Error),
    #[error("error while interacting with remote_write endpoint: {0}")]
    RemoteWrite(#[source] reqwest::Error),
    #[error("error while reading upstream response: {0}")]
    UpstreamResponse(#[source] reqwest::Error),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            IngestError::MissingContentType
            | IngestError::UnexpectedContentType
            | IngestError::Deflate(_)
            | IngestError::Translate(_) => StatusCode::BAD_REQUEST,
            IngestError::ReadBody(_)
            | IngestError::Encode(_)
            | IngestError::RemoteWrite(_)
            | IngestError::UpstreamResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<ResponseBody> {
        if let IngestError::Unauthorized(err) = self {
            return err.into_response();
        }

        let status = self.status();
        let message = error_chain(&self);
        tracing::error!(status = status.as_u16(), error = %message, "emit {}", status.as_u16());
        text_response(status, message)
    }
}
