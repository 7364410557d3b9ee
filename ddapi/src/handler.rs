use crate::errors::IngestError;
use crate::prompb::{TimeSeries, WriteRequest};
use crate::remote_write::RemoteWriteClient;
use crate::translate::{TranslateError, translate_check_runs, translate_series};
use authenticator::TenantResolver;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use shared::handler::{Handler, HandlerFuture, RequestBody, ResponseBody};
use shared::http::full_body;
use std::io::Read;
use std::sync::Arc;

pub const SERIES_PATH: &str = "/api/v1/series";
pub const CHECK_RUN_PATH: &str = "/api/v1/check_run";

const ACCEPTED_BODY: &str = r#"{"status": "ok"}"#;

/// The Datadog agent submission endpoints served by [`DatadogHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Series,
    CheckRun,
}

impl Submission {
    pub const fn path(self) -> &'static str {
        match self {
            Submission::Series => SERIES_PATH,
            Submission::CheckRun => CHECK_RUN_PATH,
        }
    }

    fn translate(self, doc: &[u8]) -> Result<Vec<TimeSeries>, TranslateError> {
        match self {
            Submission::Series => translate_series(doc),
            Submission::CheckRun => translate_check_runs(doc),
        }
    }
}

/// State shared by the submission handlers of one process.
#[derive(Debug)]
pub struct DatadogIngest {
    resolver: TenantResolver,
    remote_write: RemoteWriteClient,
}

impl DatadogIngest {
    pub fn new(resolver: TenantResolver, remote_write: RemoteWriteClient) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            remote_write,
        })
    }

    pub fn handler(self: &Arc<Self>, submission: Submission) -> Arc<dyn Handler> {
        Arc::new(DatadogHandler {
            ingest: self.clone(),
            submission,
        })
    }

    async fn ingest(
        &self,
        submission: Submission,
        req: Request<RequestBody>,
    ) -> Result<Response<ResponseBody>, IngestError> {
        let tenant = self.resolver.resolve(&req)?;
        check_json_content_type(req.headers())?;

        let deflated = req
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|encoding| encoding == "deflate");
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(IngestError::ReadBody)?
            .to_bytes();
        let body = if deflated { inflate(&body)? } else { body };

        let timeseries = submission.translate(&body).inspect_err(|_| {
            if submission == Submission::CheckRun {
                tracing::info!(body = %String::from_utf8_lossy(&body), "rejected check_run body");
            }
        })?;
        tracing::debug!(
            tenant = %tenant,
            path = submission.path(),
            series = timeseries.len(),
            "translated submission"
        );

        self.remote_write
            .write(&tenant, &WriteRequest { timeseries })
            .await?;

        let mut response = Response::new(full_body(ACCEPTED_BODY));
        *response.status_mut() = StatusCode::ACCEPTED;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    }
}

pub struct DatadogHandler {
    ingest: Arc<DatadogIngest>,
    submission: Submission,
}

impl Handler for DatadogHandler {
    fn handle(self: Arc<Self>, req: Request<RequestBody>) -> HandlerFuture {
        Box::pin(async move {
            self.ingest
                .ingest(self.submission, req)
                .await
                .unwrap_or_else(IngestError::into_response)
        })
    }
}

/// Passes if any comma-separated part of the header is `application/json`.
/// Scanning stops at the first part that is not a media type.
fn check_json_content_type(headers: &HeaderMap) -> Result<(), IngestError> {
    let value = match headers.get(CONTENT_TYPE) {
        None => return Err(IngestError::MissingContentType),
        Some(value) if value.is_empty() => return Err(IngestError::MissingContentType),
        Some(value) => value
            .to_str()
            .map_err(|_| IngestError::UnexpectedContentType)?,
    };

    for part in value.split(',') {
        let Ok(media_type) = part.trim().parse::<mime::Mime>() else {
            break;
        };
        if media_type
            .essence_str()
            .eq_ignore_ascii_case(mime::APPLICATION_JSON.essence_str())
        {
            return Ok(());
        }
    }
    Err(IngestError::UnexpectedContentType)
}

fn inflate(body: &[u8]) -> Result<Bytes, IngestError> {
    let mut decoded = Vec::new();
    ZlibDecoder::new(body)
        .read_to_end(&mut decoded)
        .map_err(IngestError::Deflate)?;
    Ok(Bytes::from(decoded))
}
