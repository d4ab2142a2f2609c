use metrics::{counter, histogram, with_local_recorder};
use metrics_exporter_prometheus::{
    Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use std::time::Duration;

pub const REQUESTS_TOTAL: &str = "api_requests_total";
pub const REQUEST_LATENCY: &str = "api_request_latency_seconds";

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Request count and latency, rendered in the Prometheus text format.
///
/// The recorder is owned here rather than installed globally, so every router
/// built in a process keeps its own numbers.
pub struct RequestMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl RequestMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(REQUEST_LATENCY.to_string()), LATENCY_BUCKETS)?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self { recorder, handle })
    }

    pub fn observe(&self, method: &str, status: u16, elapsed: Duration) {
        let method = method.to_string();
        let status = status.to_string();
        with_local_recorder(&self.recorder, || {
            counter!(REQUESTS_TOTAL, "method" => method.clone(), "status" => status).increment(1);
            histogram!(REQUEST_LATENCY, "method" => method).record(elapsed.as_secs_f64());
        });
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}
