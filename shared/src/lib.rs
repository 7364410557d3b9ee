pub mod handler;
pub mod headers;
pub mod http;
pub mod logging;
pub mod metrics_defs;
pub mod prometheus;
pub mod telemetry;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
