use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Body of a request once it has been accepted by a listener.
pub type RequestBody = BoxBody<Bytes, hyper::Error>;

/// Body of every response produced by a handler.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<ResponseBody>> + Send + 'static>>;

/// An endpoint that can be mounted on a router.
///
/// Handlers do not fail: any error is rendered into the returned response
/// (401 for authentication, 400 for bad input, 5xx for upstream trouble).
pub trait Handler: Send + Sync + 'static {
    fn handle(self: Arc<Self>, req: Request<RequestBody>) -> HandlerFuture;
}
