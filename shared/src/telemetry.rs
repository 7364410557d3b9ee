//! Request-duration histogram for every routed endpoint.

use crate::handler::{Handler, HandlerFuture, RequestBody, ResponseBody};
use crate::metrics_defs::REQUEST_DURATION;
use http_body_util::BodyExt;
use hyper::Request;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// `/api/v1/push` becomes `api_v1_push`.
pub fn route_label(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).replace('/', "_")
}

/// Wraps a handler and observes `<namespace>_request_duration_seconds` once
/// the response body has been fully sent (or dropped).
///
/// The status label is the status the handler answered with, so a tunnelled
/// protocol switch is reported as 101.
pub struct RequestDuration {
    inner: Arc<dyn Handler>,
    metric_name: Arc<str>,
}

impl RequestDuration {
    pub fn new(inner: Arc<dyn Handler>, namespace: &str) -> Self {
        Self {
            inner,
            metric_name: REQUEST_DURATION.namespaced(namespace).into(),
        }
    }
}

impl Handler for RequestDuration {
    fn handle(self: Arc<Self>, req: Request<RequestBody>) -> HandlerFuture {
        let start = Instant::now();
        let method = req.method().to_string();
        let route = route_label(req.uri().path());

        Box::pin(async move {
            let response = self.inner.clone().handle(req).await;
            let observation = Observation {
                metric_name: self.metric_name.clone(),
                method,
                route,
                status_code: response.status().as_u16().to_string(),
                start,
            };
            response.map(|inner| TimedBody { inner, observation }.boxed())
        })
    }
}

struct Observation {
    metric_name: Arc<str>,
    method: String,
    route: String,
    status_code: String,
    start: Instant,
}

impl Drop for Observation {
    fn drop(&mut self) {
        metrics::histogram!(
            self.metric_name.to_string(),
            "method" => std::mem::take(&mut self.method),
            "route" => std::mem::take(&mut self.route),
            "status_code" => std::mem::take(&mut self.status_code)
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

struct TimedBody {
    inner: ResponseBody,
    observation: Observation,
}

impl Body for TimedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
