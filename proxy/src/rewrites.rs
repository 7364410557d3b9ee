//! Hooks a [`TenantProxy`](crate::tenant_proxy::TenantProxy) applies around
//! the upstream call.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HeaderValue};
use http::{Method, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use shared::handler::ResponseBody;
use shared::http::full_body;

/// Maps the inbound request path to the path sent upstream. The query string
/// is not part of the input and is always preserved.
pub trait PathRewrite: Send + Sync + 'static {
    fn rewrite(&self, path: &str) -> String;
}

impl<F> PathRewrite for F
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    fn rewrite(&self, path: &str) -> String {
        self(path)
    }
}

/// Replaces a leading `from` with `to`, once. Paths without the prefix pass
/// through, so applying the rewrite to its own output is a no-op as long as
/// `to` does not itself start with `from`.
#[derive(Debug, Clone)]
pub struct ReplacePathPrefix {
    from: String,
    to: String,
}

impl ReplacePathPrefix {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl PathRewrite for ReplacePathPrefix {
    fn rewrite(&self, path: &str) -> String {
        match path.strip_prefix(self.from.as_str()) {
            Some(rest) => format!("{}{rest}", self.to),
            None => path.to_string(),
        }
    }
}

/// Method and URI of the inbound request, before any path rewrite.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
}

#[async_trait]
pub trait ResponseRewrite: Send + Sync + 'static {
    async fn rewrite(
        &self,
        response: Response<ResponseBody>,
        request: &RequestHead,
    ) -> Response<ResponseBody>;
}

pub const PUSH_PATH_PREFIX: &str = "/api/v1/push";

/// Keeps remote-write clients from retrying pushes Cortex will keep
/// rejecting: on `/api/v1/push`, 429 becomes 503 and any 5xx becomes 409.
/// The body is prefixed with `<original>-to-<new>: `.
#[derive(Debug, Default, Clone, Copy)]
pub struct CortexPushRewrite;

#[async_trait]
impl ResponseRewrite for CortexPushRewrite {
    async fn rewrite(
        &self,
        response: Response<ResponseBody>,
        request: &RequestHead,
    ) -> Response<ResponseBody> {
        if !request.uri.path().starts_with(PUSH_PATH_PREFIX) {
            return response;
        }

        let original = response.status();
        let remapped = match original {
            StatusCode::TOO_MANY_REQUESTS => StatusCode::SERVICE_UNAVAILABLE,
            status if status.is_server_error() => StatusCode::CONFLICT,
            _ => return response,
        };

        let (mut parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(collected) => {
                let upstream_body = collected.to_bytes();
                let mut rewritten =
                    format!("{}-to-{}: ", original.as_u16(), remapped.as_u16()).into_bytes();
                rewritten.extend_from_slice(&upstream_body);
                Bytes::from(rewritten)
            }
            Err(e) => {
                tracing::warn!(error = %e, status = %original, "could not read push response body");
                Bytes::new()
            }
        };

        tracing::debug!(from = original.as_u16(), to = remapped.as_u16(), "remapped push response status");
        parts.status = remapped;
        parts
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Response::from_parts(parts, full_body(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::http::text_response;
    use shared::testutils::body_string;

    fn head(path: &str) -> RequestHead {
        RequestHead {
            method: Method::POST,
            uri: path.parse().unwrap(),
        }
    }

    #[test]
    fn test_replace_path_prefix() {
        let rewrite = ReplacePathPrefix::new("/api/v1/ruler", "/ruler");
        assert_eq!(rewrite.rewrite("/api/v1/ruler/rules/ns"), "/ruler/rules/ns");
        assert_eq!(rewrite.rewrite("/api/v1/rules"), "/api/v1/rules");
        // only a leading match is replaced
        assert_eq!(rewrite.rewrite("/x/api/v1/ruler"), "/x/api/v1/ruler");

        let once = rewrite.rewrite("/api/v1/ruler/api/v1/ruler");
        assert_eq!(once, "/ruler/api/v1/ruler");
        assert_eq!(rewrite.rewrite(&once), once);
    }

    #[test]
    fn test_closure_rewrite() {
        let rewrite = |path: &str| path.to_uppercase();
        assert_eq!(PathRewrite::rewrite(&rewrite, "/a"), "/A");
    }

    #[tokio::test]
    async fn test_push_rewrite_statuses() {
        let cases = [
            (429, 503, "429-to-503: original 429 error response"),
            (500, 409, "500-to-409: original 500 error response"),
            (503, 409, "503-to-409: original 503 error response"),
        ];
        for (upstream, expected, body) in cases {
            let upstream = StatusCode::from_u16(upstream).unwrap();
            let response = text_response(
                upstream,
                format!("original {} error response", upstream.as_u16()),
            );
            let response = CortexPushRewrite.rewrite(response, &head("/api/v1/push")).await;
            assert_eq!(response.status().as_u16(), expected);
            assert_eq!(
                response.headers().get(CONTENT_LENGTH).unwrap(),
                &body.len().to_string()
            );
            assert_eq!(body_string(response).await, body);
        }
    }

    #[tokio::test]
    async fn test_push_rewrite_passthrough() {
        for status in [200, 202, 400, 499] {
            let status = StatusCode::from_u16(status).unwrap();
            let response = text_response(status, "unchanged");
            let response = CortexPushRewrite.rewrite(response, &head("/api/v1/push")).await;
            assert_eq!(response.status(), status);
            assert_eq!(body_string(response).await, "unchanged");
        }

        // other paths are never remapped
        let response = text_response(StatusCode::TOO_MANY_REQUESTS, "slow down");
        let response = CortexPushRewrite.rewrite(response, &head("/api/v1/query")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(response).await, "slow down");
    }
}
