//! Common types for metrics definitions.

/// A histogram emitted by every service process. The exported name is the
/// process namespace joined to `name` with an underscore.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub description: &'static str,
    pub buckets: &'static [f64],
}

impl MetricDef {
    pub fn namespaced(&self, namespace: &str) -> String {
        if namespace.is_empty() {
            self.name.to_string()
        } else {
            format!("{namespace}_{}", self.name)
        }
    }
}

pub const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0,
];

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request_duration_seconds",
    description: "Duration of HTTP requests in seconds. Tagged with method, route, status_code.",
    buckets: REQUEST_DURATION_BUCKETS,
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced() {
        assert_eq!(
            REQUEST_DURATION.namespaced("cortex_api_proxy"),
            "cortex_api_proxy_request_duration_seconds"
        );
        assert_eq!(REQUEST_DURATION.namespaced(""), "request_duration_seconds");
    }

    #[test]
    fn test_buckets_ascending() {
        for def in ALL_METRICS {
            assert!(!def.buckets.is_empty(), "{}", def.name);
            assert!(def.buckets.windows(2).all(|w| w[0] < w[1]), "{}", def.name);
        }
    }
}
