//! Datadog agent ingest: accepts `/api/v1/series` and `/api/v1/check_run`
//! submissions, translates them to Prometheus time series and pushes them to
//! a remote-write endpoint for the request's tenant.

pub mod errors;
pub mod handler;
pub mod prompb;
pub mod remote_write;
pub mod translate;

pub use errors::{IngestError, RemoteWriteSetupError};
pub use handler::{CHECK_RUN_PATH, DatadogHandler, DatadogIngest, SERIES_PATH, Submission};
pub use remote_write::{RemoteWriteClient, encode_write_request};
pub use translate::{TranslateError, translate_check_runs, translate_series};
