use crate::errors::AuthError;
use crate::token::TokenVerifier;
use http::Request;
use http::header::AUTHORIZATION;
use std::sync::Arc;

/// Header naming the tenant when API authentication is disabled.
pub const TENANT_TEST_HEADER: &str = "X-Scope-OrgID";

const BEARER_SEPARATOR: &str = "Bearer ";
const API_KEY_PARAM: &str = "api_key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantPolicy {
    /// Every request must belong to this tenant.
    Fixed(String),
    /// The tenant is taken from the request.
    Any,
}

impl TenantPolicy {
    /// An empty name means any tenant.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) if !name.is_empty() => TenantPolicy::Fixed(name.to_string()),
            _ => TenantPolicy::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `Authorization: Bearer <token>`
    AuthorizationHeader,
    /// `?api_key=<token>`, as sent by the Datadog agent.
    ApiKeyQuery,
}

/// Applies a tenant policy to incoming requests.
///
/// | policy | authentication | result |
/// |---|---|---|
/// | `Fixed(t)` | enabled | token tenant, which must equal `t` |
/// | `Fixed(t)` | disabled | `t`, the request is not inspected |
/// | `Any` | enabled | token tenant |
/// | `Any` | disabled | the `X-Scope-OrgID` header, required |
#[derive(Debug, Clone)]
pub struct TenantResolver {
    policy: TenantPolicy,
    verifier: Option<Arc<TokenVerifier>>,
    credential: CredentialSource,
}

impl TenantResolver {
    /// `verifier` is `None` when API authentication is disabled.
    pub fn new(policy: TenantPolicy, verifier: Option<Arc<TokenVerifier>>) -> Self {
        Self {
            policy,
            verifier,
            credential: CredentialSource::AuthorizationHeader,
        }
    }

    pub fn with_credential_source(mut self, credential: CredentialSource) -> Self {
        self.credential = credential;
        self
    }

    pub fn policy(&self) -> &TenantPolicy {
        &self.policy
    }

    pub fn authentication_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn resolve<B>(&self, req: &Request<B>) -> Result<String, AuthError> {
        match (&self.policy, &self.verifier) {
            (TenantPolicy::Fixed(expected), Some(verifier)) => {
                let tenant = self.verified_tenant(verifier, req)?;
                if &tenant != expected {
                    return Err(AuthError::WrongTenant(tenant));
                }
                Ok(tenant)
            }
            (TenantPolicy::Fixed(expected), None) => Ok(expected.clone()),
            (TenantPolicy::Any, Some(verifier)) => self.verified_tenant(verifier, req),
            (TenantPolicy::Any, None) => req
                .headers()
                .get(TENANT_TEST_HEADER)
                .and_then(|value| value.to_str().ok())
                .filter(|tenant| !tenant.is_empty())
                .map(str::to_string)
                .ok_or(AuthError::MissingTenantHeader),
        }
    }

    fn verified_tenant<B>(&self, verifier: &TokenVerifier, req: &Request<B>) -> Result<String, AuthError> {
        let token = match self.credential {
            CredentialSource::AuthorizationHeader => bearer_token(req)?,
            CredentialSource::ApiKeyQuery => api_key(req)?,
        };
        verifier.verify(&token).map_err(AuthError::BadToken)
    }
}

fn bearer_token<B>(req: &Request<B>) -> Result<String, AuthError> {
    let value = match req.headers().get(AUTHORIZATION) {
        None => return Err(AuthError::MissingAuthorizationHeader),
        Some(value) if value.is_empty() => return Err(AuthError::MissingAuthorizationHeader),
        Some(value) => value
            .to_str()
            .map_err(|_| AuthError::MalformedAuthorizationHeader)?,
    };

    // exactly one separator, the token is whatever follows it
    let mut parts = value.split(BEARER_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(token), None) => Ok(token.to_string()),
        _ => Err(AuthError::MalformedAuthorizationHeader),
    }
}

fn api_key<B>(req: &Request<B>) -> Result<String, AuthError> {
    req.uri()
        .query()
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, _)| name == API_KEY_PARAM)
                .map(|(_, value)| value.into_owned())
        })
        .filter(|key| !key.is_empty())
        .ok_or(AuthError::MissingApiKey)
}
