//! Datadog agent payloads to Prometheus time series.

use crate::prompb::{Label, Sample, TimeSeries};
use serde::de::{self, Deserializer, IgnoredAny, SeqAccess, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

pub const JOB: &str = "ddagent";
const TAG_LABEL_PREFIX: &str = "ddtag_";
/// The agent marks metrics it wants kept out of its own index with this prefix.
const NO_INDEX_PREFIX: &str = "n_o_i_n_d_e_x.";

#[derive(thiserror::Error, Debug)]
pub enum TranslateError {
    #[error("invalid JSON doc: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct SeriesSubmission {
    #[serde(default)]
    series: Option<Vec<SeriesFragment>>,
}

#[derive(Debug, Deserialize)]
struct SeriesFragment {
    metric: Option<String>,
    points: Option<Vec<Point>>,
    tags: Option<Vec<String>>,
    host: Option<String>,
    device: Option<String>,
    #[serde(rename = "type")]
    metric_type: Option<String>,
    interval: Option<i64>,
    source_type_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceCheck {
    check: Option<String>,
    host_name: Option<String>,
    timestamp: Option<i64>,
    status: Option<i64>,
    message: Option<String>,
    tags: Option<Vec<String>>,
}

/// `[epochSeconds, value]`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    timestamp: i64,
    value: f64,
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(PointVisitor)
    }
}

struct PointVisitor;

impl<'de> Visitor<'de> for PointVisitor {
    type Value = Point;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a [timestamp, value] array of length 2")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Point, A::Error> {
        let timestamp: i64 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let value: f64 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

        let mut len = 2;
        while seq.next_element::<IgnoredAny>()?.is_some() {
            len += 1;
        }
        if len != 2 {
            return Err(de::Error::invalid_length(len, &self));
        }
        Ok(Point { timestamp, value })
    }
}

/// Replaces every character outside `[A-Za-z0-9_:]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn insert_tags(labels: &mut BTreeMap<String, String>, tags: &[String], subject: &str) {
    for tag in tags {
        match tag.split_once(':') {
            Some((name, value)) => {
                labels.insert(
                    format!("{TAG_LABEL_PREFIX}{}", sanitize_name(name)),
                    value.to_string(),
                );
            }
            None => tracing::warn!(tag = %tag, metric = %subject, "Invalid tag"),
        }
    }
}

fn to_labels(labels: BTreeMap<String, String>) -> Vec<Label> {
    labels
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| Label { name, value })
        .collect()
}

fn base_labels(metric: &str, instance: Option<String>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("__name__".to_string(), sanitize_name(metric));
    labels.insert("instance".to_string(), instance.unwrap_or_default());
    labels.insert("job".to_string(), JOB.to_string());
    labels
}

/// Translates a `/api/v1/series` body. Fragments without points produce
/// no series.
pub fn translate_series(doc: &[u8]) -> Result<Vec<TimeSeries>, TranslateError> {
    let submission: Option<SeriesSubmission> = serde_json::from_slice(doc)?;
    let fragments = submission.unwrap_or_default().series.unwrap_or_default();

    let mut timeseries = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let metric = fragment.metric.unwrap_or_default();
        let mut points = fragment.points.unwrap_or_default();
        if points.is_empty() {
            tracing::debug!(metric = %metric, "skipping series fragment without points");
            continue;
        }

        let name = metric.strip_prefix(NO_INDEX_PREFIX).unwrap_or(&metric);
        let mut labels = base_labels(name, fragment.host);
        if let Some(interval) = fragment.interval.filter(|interval| *interval != 0) {
            labels.insert("interval".to_string(), interval.to_string());
        }
        labels.insert("device".to_string(), fragment.device.unwrap_or_default());
        labels.insert("type".to_string(), fragment.metric_type.unwrap_or_default());
        labels.insert(
            "source_type_name".to_string(),
            fragment.source_type_name.unwrap_or_default(),
        );
        insert_tags(&mut labels, &fragment.tags.unwrap_or_default(), &metric);

        points.sort_by_key(|point| point.timestamp);
        let samples = points
            .into_iter()
            .map(|point| Sample {
                value: point.value,
                timestamp: point.timestamp.saturating_mul(1000),
            })
            .collect();

        timeseries.push(TimeSeries {
            labels: to_labels(labels),
            samples,
        });
    }
    Ok(timeseries)
}

/// Translates a `/api/v1/check_run` body into one single-sample series per
/// check, the sample value being the check status.
pub fn translate_check_runs(doc: &[u8]) -> Result<Vec<TimeSeries>, TranslateError> {
    let checks: Option<Vec<ServiceCheck>> = serde_json::from_slice(doc)?;

    let checks = checks.unwrap_or_default();
    let mut timeseries = Vec::with_capacity(checks.len());
    for check in checks {
        let name = check.check.unwrap_or_default();
        let status = check.status.unwrap_or_default();
        let timestamp = check.timestamp.unwrap_or_default();

        if let Some(message) = check.message.as_deref().filter(|m| !m.is_empty())
            && status > 0
        {
            tracing::info!(
                check = %name,
                status,
                timestamp,
                message = %message,
                "Message for check"
            );
        }

        let mut labels = base_labels(&name, check.host_name);
        insert_tags(&mut labels, &check.tags.unwrap_or_default(), &name);

        timeseries.push(TimeSeries {
            labels: to_labels(labels),
            samples: vec![Sample {
                value: status as f64,
                timestamp: timestamp.saturating_mul(1000),
            }],
        });
    }
    Ok(timeseries)
}
