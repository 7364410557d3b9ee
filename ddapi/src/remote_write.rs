use crate::errors::{IngestError, RemoteWriteSetupError};
use crate::prompb::WriteRequest;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use prost::Message;
use std::time::Duration;
use url::Url;

const REMOTE_WRITE_VERSION_HEADER: &str = "X-Prometheus-Remote-Write-Version";
const REMOTE_WRITE_VERSION: &str = "0.1.0";
const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Protobuf-encodes and snappy-compresses (block format) a write request.
pub fn encode_write_request(request: &WriteRequest) -> Result<Vec<u8>, snap::Error> {
    snap::raw::Encoder::new().compress_vec(&request.encode_to_vec())
}

/// Posts write requests to a Prometheus remote-write endpoint on behalf of
/// a tenant. Built once per process; the connection pool is shared by all
/// handlers.
#[derive(Debug, Clone)]
pub struct RemoteWriteClient {
    client: reqwest::Client,
    url: Url,
}

impl RemoteWriteClient {
    /// Accepts `http` and `https` endpoints.
    pub fn new(url: Url) -> Result<Self, RemoteWriteSetupError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RemoteWriteSetupError::UnsupportedScheme(url));
        }
        if url.host().is_none() {
            return Err(RemoteWriteSetupError::MissingHost(url));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Succeeds once any response was received. A non-2xx answer is logged,
    /// not returned.
    pub async fn write(&self, tenant: &str, request: &WriteRequest) -> Result<(), IngestError> {
        let body = encode_write_request(request).map_err(IngestError::Encode)?;

        let response = self
            .client
            .post(self.url.clone())
            .header(REMOTE_WRITE_VERSION_HEADER, REMOTE_WRITE_VERSION)
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(TENANT_HEADER, tenant)
            .body(body)
            .send()
            .await
            .map_err(IngestError::RemoteWrite)?;

        let status = response.status();
        let text = response
            .bytes()
            .await
            .map_err(IngestError::UpstreamResponse)?;

        if !status.is_success() {
            tracing::info!(
                status = status.as_u16(),
                tenant = %tenant,
                body = %String::from_utf8_lossy(&text),
                "remote_write endpoint returned an error"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                series = request.timeseries.len(),
                "remote_write succeeded"
            );
        }
        Ok(())
    }
}
