use crate::tenant_proxy::has_dot_segment;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::handler::{Handler, RequestBody, ResponseBody};
use shared::http::make_error_response;
use shared::telemetry::RequestDuration;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub const METRICS_PATH: &str = "/metrics";

#[derive(Clone, Debug)]
enum RouteMatch {
    /// Plain string prefix of the request path.
    Prefix(String),
    /// Exact path, and the method must match too.
    Exact { method: Method, path: String },
}

#[derive(Clone)]
struct Route {
    matcher: RouteMatch,
    handler: Arc<dyn Handler>,
}

/// Dispatches requests to the first registered route that matches, so
/// registration order decides between overlapping prefixes.
///
/// Every route handler is timed under `<namespace>_request_duration_seconds`.
/// The metrics endpoint is matched before any route and is not timed.
#[derive(Clone)]
pub struct Router {
    namespace: Arc<str>,
    routes: Arc<Vec<Route>>,
    metrics: Option<Arc<dyn Handler>>,
}

impl Router {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.into(),
            routes: Arc::new(Vec::new()),
            metrics: None,
        }
    }

    pub fn route(self, prefix: &str, handler: Arc<dyn Handler>) -> Self {
        self.push(RouteMatch::Prefix(prefix.to_string()), handler)
    }

    pub fn route_method(self, method: Method, path: &str, handler: Arc<dyn Handler>) -> Self {
        self.push(
            RouteMatch::Exact {
                method,
                path: path.to_string(),
            },
            handler,
        )
    }

    pub fn metrics_endpoint(mut self, handler: Arc<dyn Handler>) -> Self {
        self.metrics = Some(handler);
        self
    }

    fn push(mut self, matcher: RouteMatch, handler: Arc<dyn Handler>) -> Self {
        let handler: Arc<dyn Handler> = Arc::new(RequestDuration::new(handler, &self.namespace));
        Arc::make_mut(&mut self.routes).push(Route { matcher, handler });
        self
    }

    pub async fn dispatch(&self, req: Request<RequestBody>) -> Response<ResponseBody> {
        let path = req.uri().path();

        if has_dot_segment(path) {
            tracing::warn!(method = %req.method(), path = %path, "Rejected dot segment in path");
            return make_error_response(StatusCode::BAD_REQUEST);
        }

        if path == METRICS_PATH
            && let Some(metrics) = &self.metrics
        {
            return metrics.clone().handle(req).await;
        }

        let mut wrong_method = false;
        for route in self.routes.iter() {
            match &route.matcher {
                RouteMatch::Prefix(prefix) if path.starts_with(prefix.as_str()) => {
                    tracing::debug!(route = %prefix, path = %path, "Matched route");
                    return route.handler.clone().handle(req).await;
                }
                RouteMatch::Exact { method, path: exact } if path == exact => {
                    if req.method() == method {
                        tracing::debug!(route = %exact, method = %method, "Matched route");
                        return route.handler.clone().handle(req).await;
                    }
                    wrong_method = true;
                }
                _ => {}
            }
        }

        tracing::warn!(
            method = %req.method(),
            path = %path,
            "No route matched"
        );
        if wrong_method {
            make_error_response(StatusCode::METHOD_NOT_ALLOWED)
        } else {
            make_error_response(StatusCode::NOT_FOUND)
        }
    }
}

impl Service<Request<Incoming>> for Router {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let router = self.clone();
        Box::pin(async move { Ok(router.dispatch(req.map(|body| body.boxed())).await) })
    }
}
