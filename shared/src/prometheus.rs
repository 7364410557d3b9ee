use crate::handler::{Handler, HandlerFuture, RequestBody};
use crate::http::full_body;
use crate::metrics_defs::ALL_METRICS;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not configure prometheus exporter: {0}")]
    Build(#[source] BuildError),
    #[error("could not install prometheus recorder: {0}")]
    Install(#[source] BuildError),
}

/// Exporter configuration shared by the installed recorder and tests.
pub fn exporter_builder(namespace: &str) -> Result<PrometheusBuilder, MetricsError> {
    ALL_METRICS.iter().try_fold(PrometheusBuilder::new(), |builder, def| {
        builder
            .set_buckets_for_metric(Matcher::Full(def.namespaced(namespace)), def.buckets)
            .map_err(MetricsError::Build)
    })
}

pub fn describe_metrics(namespace: &str) {
    for def in ALL_METRICS {
        metrics::describe_histogram!(def.namespaced(namespace), def.description);
    }
}

/// The process-wide Prometheus recorder, served on `/metrics`.
pub struct PrometheusExporter {
    handle: PrometheusHandle,
    process: metrics_process::Collector,
}

impl PrometheusExporter {
    pub fn install(namespace: &str) -> Result<Self, MetricsError> {
        let handle = exporter_builder(namespace)?
            .install_recorder()
            .map_err(MetricsError::Install)?;
        describe_metrics(namespace);

        let process = metrics_process::Collector::default();
        process.describe();

        Ok(Self { handle, process })
    }

    /// Periodically drains histogram buffers so memory stays bounded between scrapes.
    pub fn spawn_upkeep(&self) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
            loop {
                interval.tick().await;
                handle.run_upkeep();
            }
        });
    }

    pub fn render(&self) -> String {
        self.process.collect();
        self.handle.render()
    }
}

impl Handler for PrometheusExporter {
    fn handle(self: Arc<Self>, _req: Request<RequestBody>) -> HandlerFuture {
        Box::pin(async move {
            let mut response = Response::new(full_body(self.render()));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static(EXPOSITION_CONTENT_TYPE),
            );
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_and_render() {
        let recorder = exporter_builder("described").unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_metrics("described");
            metrics::histogram!("described_request_duration_seconds", "route" => "x").record(0.2);
        });

        let rendered = handle.render();
        assert!(rendered.contains("# HELP described_request_duration_seconds Duration of HTTP requests"));
        assert!(rendered.contains("# TYPE described_request_duration_seconds histogram"));
        assert!(rendered.contains("described_request_duration_seconds_bucket{route=\"x\",le=\"0.25\"} 1"));
        assert!(rendered.contains("described_request_duration_seconds_bucket{route=\"x\",le=\"0.1\"} 0"));
    }
}
