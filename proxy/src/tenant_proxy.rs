use crate::errors::ProxyError;
use crate::rewrites::{PathRewrite, RequestHead, ResponseRewrite};
use authenticator::TenantResolver;
use http::header::{HOST, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use shared::handler::{Handler, HandlerFuture, RequestBody, ResponseBody};
use shared::headers::{filter_hop_by_hop, set_upgrade_headers, upgrade_protocol};
use shared::http::{PeerAddr, error_chain, text_response};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

pub type UpstreamClient = Client<HttpConnector, RequestBody>;

/// The connection pool shared by every proxy binding of a process.
pub fn upstream_client() -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(30)));
    connector.set_keepalive(Some(Duration::from_secs(30)));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .build(connector)
}

/// Only plain `http://host[:port][/base]` upstreams are supported. The
/// connector has no TLS, so `https` is refused at startup.
pub fn validate_upstream(url: &Url) -> Result<(), ProxyError> {
    if url.scheme() != "http" {
        return Err(ProxyError::UnsupportedScheme(url.clone()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProxyError::MissingHost(url.clone()));
    }
    Ok(())
}

/// True when a path segment is `.` or `..`, also in percent-encoded form.
/// URL parsing resolves such segments, so the upstream would see a different
/// path than the one the request was routed on.
pub fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Joins two path segments with exactly one `/` between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn join_queries(base: Option<&str>, query: Option<&str>) -> Option<String> {
    match (base.filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(base), Some(query)) => Some(format!("{base}&{query}")),
        (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
        (None, None) => None,
    }
}

/// Reverse proxy to a single upstream that attributes every request to a
/// tenant before forwarding it.
///
/// The resolved tenant is written to `tenant_header`, replacing whatever the
/// client sent. Responses are streamed back unless a response rewrite needs
/// the whole body.
pub struct TenantProxy {
    resolver: TenantResolver,
    tenant_header: HeaderName,
    upstream: Url,
    client: UpstreamClient,
    path_rewrite: Option<Box<dyn PathRewrite>>,
    response_rewrite: Option<Box<dyn ResponseRewrite>>,
}

impl TenantProxy {
    pub fn new(
        resolver: TenantResolver,
        tenant_header: HeaderName,
        upstream: Url,
        client: UpstreamClient,
    ) -> Result<Self, ProxyError> {
        validate_upstream(&upstream)?;
        Ok(Self {
            resolver,
            tenant_header,
            upstream,
            client,
            path_rewrite: None,
            response_rewrite: None,
        })
    }

    pub fn with_path_rewrite(mut self, rewrite: impl PathRewrite) -> Self {
        self.path_rewrite = Some(Box::new(rewrite));
        self
    }

    pub fn with_response_rewrite(mut self, rewrite: impl ResponseRewrite) -> Self {
        self.response_rewrite = Some(Box::new(rewrite));
        self
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    fn upstream_uri(&self, inbound: &Uri) -> Result<Uri, ProxyError> {
        let path = match &self.path_rewrite {
            Some(rewrite) => rewrite.rewrite(inbound.path()),
            None => inbound.path().to_string(),
        };
        if has_dot_segment(inbound.path()) || has_dot_segment(&path) {
            return Err(ProxyError::DotSegment(inbound.path().to_string()));
        }

        let mut url = self.upstream.clone();
        url.set_path(&join_paths(self.upstream.path(), &path));
        url.set_query(join_queries(self.upstream.query(), inbound.query()).as_deref());
        Ok(url.as_str().parse()?)
    }

    async fn forward(&self, mut req: Request<RequestBody>) -> Response<ResponseBody> {
        let tenant = match self.resolver.resolve(&req) {
            Ok(tenant) => tenant,
            Err(e) => return e.into_response(),
        };

        let head = RequestHead {
            method: req.method().clone(),
            uri: req.uri().clone(),
        };
        let requested_protocol = upgrade_protocol(req.headers());
        let client_upgrade = requested_protocol
            .as_ref()
            .map(|_| hyper::upgrade::on(&mut req));

        let upstream_req = match self.upstream_request(req, &tenant, requested_protocol.clone()) {
            Ok(upstream_req) => upstream_req,
            Err(e) => return self.error_response(e),
        };

        tracing::debug!(
            tenant = %tenant,
            method = %head.method,
            uri = %upstream_req.uri(),
            "forwarding request"
        );

        let mut response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(e) => return self.error_response(e.into()),
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let offered = upgrade_protocol(response.headers());
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            return match (client_upgrade, requested_protocol, offered) {
                (Some(client_upgrade), Some(requested), Some(offered))
                    if requested.as_bytes().eq_ignore_ascii_case(offered.as_bytes()) =>
                {
                    spawn_tunnel(client_upgrade, upstream_upgrade);
                    let (mut parts, body) = response.into_parts();
                    filter_hop_by_hop(&mut parts.headers);
                    set_upgrade_headers(&mut parts.headers, offered);
                    Response::from_parts(parts, body.boxed())
                }
                (_, requested, offered) => self.error_response(ProxyError::UnexpectedUpgrade {
                    requested: requested.and_then(|v| v.to_str().ok().map(str::to_string)),
                    offered: offered.and_then(|v| v.to_str().ok().map(str::to_string)),
                }),
            };
        }

        let (mut parts, body) = response.into_parts();
        filter_hop_by_hop(&mut parts.headers);
        let response = Response::from_parts(parts, body.boxed());

        match &self.response_rewrite {
            Some(rewrite) => rewrite.rewrite(response, &head).await,
            None => response,
        }
    }

    fn upstream_request(
        &self,
        req: Request<RequestBody>,
        tenant: &str,
        upgrade: Option<HeaderValue>,
    ) -> Result<Request<RequestBody>, ProxyError> {
        let uri = self.upstream_uri(req.uri())?;
        let (mut parts, body) = req.into_parts();

        filter_hop_by_hop(&mut parts.headers);
        // the client derives Host from the upstream URI
        parts.headers.remove(HOST);
        if let Some(protocol) = upgrade {
            set_upgrade_headers(&mut parts.headers, protocol);
        }
        parts
            .headers
            .insert(self.tenant_header.clone(), HeaderValue::from_str(tenant)?);

        if let Some(PeerAddr(peer)) = parts.extensions.get::<PeerAddr>() {
            let prior: Vec<&str> = parts
                .headers
                .get_all(X_FORWARDED_FOR)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            let forwarded = if prior.is_empty() {
                peer.ip().to_string()
            } else {
                format!("{}, {}", prior.join(", "), peer.ip())
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                parts.headers.insert(X_FORWARDED_FOR, value);
            }
        }

        parts.uri = uri;
        parts.version = Version::HTTP_11;
        Ok(Request::from_parts(parts, body))
    }

    fn error_response(&self, err: ProxyError) -> Response<ResponseBody> {
        let message = error_chain(&err);
        tracing::warn!(upstream = %self.upstream, error = %message, "http: proxy error");
        text_response(err.status(), message)
    }
}

/// Copies bytes between the client and upstream connections once both sides
/// have switched protocols.
fn spawn_tunnel(client: OnUpgrade, upstream: OnUpgrade) {
    tokio::spawn(async move {
        match tokio::try_join!(client, upstream) {
            Ok((client, upstream)) => {
                let mut client = TokioIo::new(client);
                let mut upstream = TokioIo::new(upstream);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((sent, received)) => {
                        tracing::debug!(sent, received, "upgraded connection closed");
                    }
                    Err(e) => tracing::debug!(error = %e, "upgraded connection ended with error"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "protocol upgrade failed"),
        }
    });
}

impl Handler for TenantProxy {
    fn handle(self: Arc<Self>, req: Request<RequestBody>) -> HandlerFuture {
        Box::pin(async move { self.forward(req).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrites::{CortexPushRewrite, ReplacePathPrefix};
    use authenticator::testutils::{test_verifier, token_for};
    use authenticator::{TENANT_TEST_HEADER, TenantPolicy};
    use hyper::body::Incoming;
    use shared::http::{empty_body, full_body};
    use shared::testutils::{body_string, spawn_upstream};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Answers with `<path>?<query> <tenant header>`.
    async fn echo_upstream() -> SocketAddr {
        spawn_upstream(|req: Request<Incoming>| async move {
            let tenant = req
                .headers()
                .get_all(TENANT_TEST_HEADER)
                .iter()
                .map(|v| v.to_str().unwrap().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let target = req.uri().path_and_query().unwrap().as_str().to_string();
            text_response(StatusCode::OK, format!("{target} {tenant}"))
        })
        .await
    }

    fn proxy(resolver: TenantResolver, addr: SocketAddr) -> Arc<TenantProxy> {
        let url = Url::parse(&format!("http://{addr}")).unwrap();
        Arc::new(
            TenantProxy::new(
                resolver,
                HeaderName::from_static("x-scope-orgid"),
                url,
                upstream_client(),
            )
            .unwrap(),
        )
    }

    fn get(uri: &str) -> Request<RequestBody> {
        Request::builder().uri(uri).body(empty_body()).unwrap()
    }

    #[test]
    fn test_join_paths_and_queries() {
        assert_eq!(join_paths("/", "/api/v1/push"), "/api/v1/push");
        assert_eq!(join_paths("/base", "/api"), "/base/api");
        assert_eq!(join_paths("/base/", "api"), "/base/api");
        assert_eq!(join_paths("/base", "api"), "/base/api");

        assert_eq!(join_queries(Some("a=1"), Some("b=2")).as_deref(), Some("a=1&b=2"));
        assert_eq!(join_queries(None, Some("b=2")).as_deref(), Some("b=2"));
        assert_eq!(join_queries(Some(""), None), None);
    }

    #[test]
    fn test_has_dot_segment() {
        for path in [
            "/api/v1/rules/../../../admin",
            "/api/v1/./query",
            "/api/v1/..",
            "/api/v1/%2e%2e/admin",
            "/api/v1/%2E./admin",
            "/api/v1/.%2e",
        ] {
            assert!(has_dot_segment(path), "{path}");
        }
        for path in ["/api/v1/query", "/api/v1/rules/ns.yaml", "/a/..b/c", "/a/.../b", "/"] {
            assert!(!has_dot_segment(path), "{path}");
        }
    }

    #[tokio::test]
    async fn test_dot_segments_never_reach_upstream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let upstream_calls = calls.clone();
        let addr = spawn_upstream(move |_req: Request<Incoming>| {
            upstream_calls.fetch_add(1, Ordering::SeqCst);
            async move { text_response(StatusCode::OK, "reached") }
        })
        .await;
        let resolver = TenantResolver::new(TenantPolicy::Fixed("t".into()), None);
        let proxy = proxy(resolver, addr);

        for path in ["/api/v1/rules/../../../admin", "/api/v1/%2e%2e/admin"] {
            let response = proxy.clone().handle(get(path)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_validate_upstream() {
        assert!(validate_upstream(&Url::parse("http://querier:9009").unwrap()).is_ok());
        assert!(matches!(
            validate_upstream(&Url::parse("https://querier").unwrap()),
            Err(ProxyError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            validate_upstream(&Url::parse("unix:/tmp/sock").unwrap()),
            Err(ProxyError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_path_rewrite_and_tenant_header() {
        let addr = echo_upstream().await;
        let resolver = TenantResolver::new(TenantPolicy::Fixed("test".into()), None);
        let proxy = Arc::new(
            TenantProxy::new(
                resolver,
                HeaderName::from_static("x-scope-orgid"),
                Url::parse(&format!("http://{addr}")).unwrap(),
                upstream_client(),
            )
            .unwrap()
            .with_path_rewrite(ReplacePathPrefix::new("/replaceme", "/foo")),
        );

        let response = proxy.clone().handle(get("/replaceme/bar")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "/foo/bar test");

        let response = proxy.clone().handle(get("/other/bar?x=1")).await;
        assert_eq!(body_string(response).await, "/other/bar?x=1 test");
    }

    #[tokio::test]
    async fn test_tenant_header_is_overwritten() {
        let addr = echo_upstream().await;
        let resolver = TenantResolver::new(TenantPolicy::Any, Some(test_verifier()));
        let proxy = proxy(resolver, addr);

        let req = Request::builder()
            .uri("/api/v1/query")
            .header("authorization", format!("Bearer {}", token_for("team-a")))
            .header(TENANT_TEST_HEADER, "team-b")
            .header(TENANT_TEST_HEADER, "team-c")
            .body(empty_body())
            .unwrap();
        let response = proxy.handle(req).await;
        assert_eq!(body_string(response).await, "/api/v1/query team-a");
    }

    #[tokio::test]
    async fn test_unauthenticated_request_never_reaches_upstream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let upstream_calls = calls.clone();
        let addr = spawn_upstream(move |_req: Request<Incoming>| {
            upstream_calls.fetch_add(1, Ordering::SeqCst);
            async move { text_response(StatusCode::OK, "reached") }
        })
        .await;
        let resolver = TenantResolver::new(TenantPolicy::Fixed("prod".into()), Some(test_verifier()));
        let proxy = proxy(resolver, addr);

        let response = proxy.clone().handle(get("/api/v1/push")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Authorization header missing");

        let req = Request::builder()
            .uri("/api/v1/push")
            .header("authorization", format!("Bearer {}", token_for("dev")))
            .body(empty_body())
            .unwrap();
        let response = proxy.handle(req).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "bad authentication token");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upstream_base_path_and_query() {
        let addr = echo_upstream().await;
        let resolver = TenantResolver::new(TenantPolicy::Fixed("t".into()), None);
        let proxy = Arc::new(
            TenantProxy::new(
                resolver,
                HeaderName::from_static("x-scope-orgid"),
                Url::parse(&format!("http://{addr}/prefix?org=1")).unwrap(),
                upstream_client(),
            )
            .unwrap(),
        );

        let response = proxy.handle(get("/api/v1/query?q=up")).await;
        assert_eq!(body_string(response).await, "/prefix/api/v1/query?org=1&q=up t");
    }

    #[tokio::test]
    async fn test_hop_by_hop_and_forwarded_for() {
        let addr = spawn_upstream(|req: Request<Incoming>| async move {
            let headers = req.headers();
            let seen = format!(
                "custom={:?} keep={:?} xff={:?} kept={:?}",
                headers.get("x-custom").is_some(),
                headers.get("keep-alive").is_some(),
                headers.get(X_FORWARDED_FOR).map(|v| v.to_str().unwrap().to_string()),
                headers.get("x-kept").map(|v| v.to_str().unwrap().to_string()),
            );
            let mut response = text_response(StatusCode::OK, seen);
            response
                .headers_mut()
                .insert("keep-alive", HeaderValue::from_static("timeout=5"));
            response
        })
        .await;
        let resolver = TenantResolver::new(TenantPolicy::Fixed("t".into()), None);
        let proxy = proxy(resolver, addr);

        let mut req = Request::builder()
            .uri("/x")
            .header("connection", "x-custom")
            .header("x-custom", "1")
            .header("keep-alive", "timeout=5")
            .header("x-kept", "yes")
            .header(X_FORWARDED_FOR, "10.0.0.1")
            .body(empty_body())
            .unwrap();
        req.extensions_mut()
            .insert(PeerAddr("192.0.2.7:5555".parse().unwrap()));

        let response = proxy.handle(req).await;
        assert!(response.headers().get("keep-alive").is_none());
        assert_eq!(
            body_string(response).await,
            "custom=false keep=false xff=Some(\"10.0.0.1, 192.0.2.7\") kept=Some(\"yes\")"
        );
    }

    #[tokio::test]
    async fn test_request_body_is_streamed_upstream() {
        let addr = spawn_upstream(|req: Request<Incoming>| async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            text_response(StatusCode::OK, body)
        })
        .await;
        let resolver = TenantResolver::new(TenantPolicy::Fixed("t".into()), None);
        let proxy = proxy(resolver, addr);

        let req = Request::builder()
            .method("POST")
            .uri("/loki/api/v1/push")
            .body(full_body("payload"))
            .unwrap();
        assert_eq!(body_string(proxy.handle(req).await).await, "payload");
    }

    #[tokio::test]
    async fn test_push_response_rewrite() {
        let addr = spawn_upstream(|_req: Request<Incoming>| async move {
            text_response(StatusCode::TOO_MANY_REQUESTS, "original 429 error response")
        })
        .await;
        let resolver = TenantResolver::new(TenantPolicy::Fixed("t".into()), None);
        let proxy = Arc::new(
            TenantProxy::new(
                resolver,
                HeaderName::from_static("x-scope-orgid"),
                Url::parse(&format!("http://{addr}")).unwrap(),
                upstream_client(),
            )
            .unwrap()
            .with_response_rewrite(CortexPushRewrite),
        );

        let response = proxy.handle(get("/api/v1/push")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_string(response).await, "429-to-503: original 429 error response");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        // bind and drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resolver = TenantResolver::new(TenantPolicy::Fixed("t".into()), None);
        let proxy = proxy(resolver, addr);

        let response = proxy.handle(get("/api/v1/query")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_string(response).await;
        assert!(body.starts_with("client error (Connect)"), "{body}");
        assert!(!body.contains("Bearer"));
    }

    #[tokio::test]
    async fn test_upgrade_is_tunnelled() {
        let upstream = spawn_upstream(|mut req: Request<Incoming>| async move {
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                let upgraded = on_upgrade.await.unwrap();
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 4];
                io.read_exact(&mut buf).await.unwrap();
                io.write_all(b"pong").await.unwrap();
                io.flush().await.unwrap();
            });
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("connection", "upgrade")
                .header("upgrade", "websocket")
                .body(empty_body())
                .unwrap()
        })
        .await;

        let resolver = TenantResolver::new(TenantPolicy::Fixed("t".into()), None);
        let proxy = proxy(resolver, upstream);
        let front = spawn_upstream(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            async move { proxy.handle(req.map(|b| b.boxed())).await }
        })
        .await;

        let mut stream = tokio::net::TcpStream::connect(front).await.unwrap();
        stream
            .write_all(
                b"GET /ws HTTP/1.1\r\nhost: front\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n",
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap().to_ascii_lowercase();
        assert!(head.starts_with("http/1.1 101"), "{head}");
        assert!(head.contains("upgrade: websocket"));

        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }
}
