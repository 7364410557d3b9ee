use http::StatusCode;
use jsonwebtoken::Algorithm;
use shared::handler::ResponseBody;
use shared::http::{error_chain, text_response};

/// Failures while loading verification keys. All of them are fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum KeySetError {
    #[error("{0} must be set")]
    MissingVariable(&'static str),
    #[error("{0} must not be empty")]
    EmptyVariable(&'static str),
    #[error("error while JSON-parsing {variable}: {source}")]
    InvalidJson {
        variable: &'static str,
        source: serde_json::Error,
    },
    #[error("could not parse RSA public key {key_id}: {reason}")]
    InvalidPem { key_id: String, reason: String },
    #[error("key ID from config ({configured}) does not match key ID calculated from key ({calculated})")]
    KeyIdMismatch {
        configured: String,
        calculated: String,
    },
}

/// Reasons a token is rejected. These are only ever logged; clients see
/// "bad authentication token".
#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("jwt verif: cannot decode header: {0}")]
    MalformedHeader(#[source] jsonwebtoken::errors::Error),
    #[error("jwt verif: invalid alg: {0:?}")]
    UnsupportedAlgorithm(Algorithm),
    #[error("jwt verif: unknown kid: {0}")]
    UnknownKey(String),
    #[error("jwt verif: token has no kid and no fallback key is configured")]
    NoFallbackKey,
    #[error("jwt verification failed: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("jwt verification failed: token is expired")]
    Expired,
    #[error("jwt verification failed: token is not valid yet")]
    NotYetValid,
    #[error("jwt verification failed: token used before issued")]
    IssuedInFuture,
    #[error("invalid subject (tenant- prefix missing)")]
    InvalidSubject,
}

/// A request that could not be attributed to a tenant. The display string is
/// the response body and never tells which verification stage failed.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Authorization header missing")]
    MissingAuthorizationHeader,
    #[error("Authorization header format invalid. Expecting `Authorization: Bearer <AUTHTOKEN>`")]
    MalformedAuthorizationHeader,
    #[error("DD API key missing (api_key URL query parameter)")]
    MissingApiKey,
    #[error("bad authentication token")]
    BadToken(#[source] TokenError),
    #[error("bad authentication token")]
    WrongTenant(String),
    #[error("missing test X-Scope-OrgID header specifying tenant")]
    MissingTenantHeader,
}

impl AuthError {
    pub fn into_response(self) -> http::Response<ResponseBody> {
        match &self {
            AuthError::BadToken(source) => {
                tracing::info!(reason = %error_chain(source), "emit 401");
            }
            AuthError::WrongTenant(tenant) => {
                tracing::info!(reason = "unexpected tenant", tenant = %tenant, "emit 401");
            }
            other => {
                tracing::info!(reason = %other, "emit 401");
            }
        }
        text_response(StatusCode::UNAUTHORIZED, self.to_string())
    }
}
