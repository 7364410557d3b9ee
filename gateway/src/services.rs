//! Route tables of the service processes. Registration order matters: the
//! router picks the first matching prefix.

use crate::errors::GatewayError;
use authenticator::{CredentialSource, TenantResolver};
use ddapi::{DatadogIngest, RemoteWriteClient, Submission};
use http::Method;
use http::header::HeaderName;
use proxy::{CortexPushRewrite, ReplacePathPrefix, Router, TenantProxy, UpstreamClient, upstream_client};
use shared::handler::Handler;
use std::sync::Arc;
use url::Url;

/// Carries the resolved tenant to every upstream.
pub const TENANT_HEADER: &str = "x-scope-orgid";

pub const CORTEX_NAMESPACE: &str = "cortex_api_proxy";
pub const LOKI_NAMESPACE: &str = "loki_api_proxy";
pub const CONFIG_NAMESPACE: &str = "config_api_proxy";
pub const DDAPI_NAMESPACE: &str = "ddapi_proxy";

/// Builds tenant proxies sharing one resolver and one connection pool.
#[derive(Clone)]
pub struct ProxyFactory {
    resolver: TenantResolver,
    client: UpstreamClient,
}

impl ProxyFactory {
    pub fn new(resolver: TenantResolver) -> Self {
        Self {
            resolver,
            client: upstream_client(),
        }
    }

    fn proxy(&self, upstream: &Url) -> Result<TenantProxy, GatewayError> {
        Ok(TenantProxy::new(
            self.resolver.clone(),
            HeaderName::from_static(TENANT_HEADER),
            upstream.clone(),
            self.client.clone(),
        )?)
    }

    fn handler(&self, upstream: &Url) -> Result<Arc<dyn Handler>, GatewayError> {
        Ok(Arc::new(self.proxy(upstream)?))
    }
}

#[derive(Debug, Clone)]
pub struct CortexUpstreams {
    pub querier: Url,
    pub distributor: Url,
    pub ruler: Url,
    pub alertmanager: Url,
    /// Forward push errors unchanged instead of remapping them.
    pub allow_push_retries: bool,
}

pub fn cortex_router(
    proxies: &ProxyFactory,
    upstreams: &CortexUpstreams,
    namespace: &str,
) -> Result<Router, GatewayError> {
    let distributor: Arc<dyn Handler> = if upstreams.allow_push_retries {
        proxies.handler(&upstreams.distributor)?
    } else {
        Arc::new(
            proxies
                .proxy(&upstreams.distributor)?
                .with_response_rewrite(CortexPushRewrite),
        )
    };
    let ruler = proxies.handler(&upstreams.ruler)?;
    let alertmanager = proxies.handler(&upstreams.alertmanager)?;
    let querier = proxies.handler(&upstreams.querier)?;

    tracing::info!(
        querier = %upstreams.querier,
        distributor = %upstreams.distributor,
        ruler = %upstreams.ruler,
        alertmanager = %upstreams.alertmanager,
        remap_push_errors = !upstreams.allow_push_retries,
        "cortex upstreams"
    );

    Ok(Router::new(namespace)
        .route("/api/v1/push", distributor.clone())
        .route("/ruler", ruler.clone())
        .route("/api/v1/rules", ruler)
        .route("/alertmanager", alertmanager.clone())
        .route("/multitenant_alertmanager", alertmanager.clone())
        .route("/api/v1/alerts", alertmanager)
        .route("/api/v1", querier)
        .route("/runtime_config", distributor.clone())
        .route("/config", distributor.clone())
        .route("/services", distributor.clone())
        .route("/distributor/ring", distributor))
}

#[derive(Debug, Clone)]
pub struct LokiUpstreams {
    pub querier: Url,
    pub distributor: Url,
}

pub fn loki_router(
    proxies: &ProxyFactory,
    upstreams: &LokiUpstreams,
    namespace: &str,
) -> Result<Router, GatewayError> {
    tracing::info!(
        querier = %upstreams.querier,
        distributor = %upstreams.distributor,
        "loki upstreams"
    );

    Ok(Router::new(namespace)
        .route("/loki/api/v1/push", proxies.handler(&upstreams.distributor)?)
        .route("/loki/api/v1", proxies.handler(&upstreams.querier)?))
}

#[derive(Debug, Clone)]
pub struct ConfigUpstreams {
    pub ruler: Url,
    pub alertmanager: Url,
}

/// Rule and alert configuration for any tenant, on behalf of the admin plane.
pub fn config_router(
    proxies: &ProxyFactory,
    upstreams: &ConfigUpstreams,
    namespace: &str,
) -> Result<Router, GatewayError> {
    let ruler_rewritten: Arc<dyn Handler> = Arc::new(
        proxies
            .proxy(&upstreams.ruler)?
            .with_path_rewrite(ReplacePathPrefix::new("/api/v1/ruler", "/ruler")),
    );
    let multitenant_alertmanager: Arc<dyn Handler> = Arc::new(
        proxies
            .proxy(&upstreams.alertmanager)?
            .with_path_rewrite(ReplacePathPrefix::new(
                "/api/v1/multitenant_alertmanager",
                "/multitenant_alertmanager",
            )),
    );
    let alertmanager = proxies.handler(&upstreams.alertmanager)?;

    tracing::info!(
        ruler = %upstreams.ruler,
        alertmanager = %upstreams.alertmanager,
        "config upstreams"
    );

    Ok(Router::new(namespace)
        .route("/api/v1/ruler", ruler_rewritten)
        .route("/api/v1/rules", proxies.handler(&upstreams.ruler)?)
        .route("/api/v1/alerts", alertmanager.clone())
        .route("/api/v1/alertmanager", alertmanager)
        .route("/api/v1/multitenant_alertmanager", multitenant_alertmanager))
}

/// Datadog agents authenticate with the `api_key` query parameter.
pub fn ddapi_router(
    resolver: TenantResolver,
    remote_write_url: &Url,
    namespace: &str,
) -> Result<Router, GatewayError> {
    let client = RemoteWriteClient::new(remote_write_url.clone())?;
    tracing::info!(remote_write_url = %remote_write_url, "ddapi upstream");

    let resolver = resolver.with_credential_source(CredentialSource::ApiKeyQuery);
    let ingest = DatadogIngest::new(resolver, client);

    Ok(Router::new(namespace)
        .route_method(Method::POST, Submission::Series.path(), ingest.handler(Submission::Series))
        .route_method(
            Method::POST,
            Submission::CheckRun.path(),
            ingest.handler(Submission::CheckRun),
        ))
}
