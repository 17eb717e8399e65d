//! Controller metrics
//!
//! The recorder is owned by [`ControllerMetrics`] and never installed as the
//! global `metrics` recorder; the HTTP server renders it directly.

use metrics::{Counter, Gauge, Key, KeyName, Level, Metadata, Recorder, SharedString};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

pub const LAST_SYNC_TIMESTAMP: &str = "kube_static_egress_controller_last_sync_timestamp_seconds";
pub const ENSURE_FAILURES: &str = "kube_static_egress_controller_ensure_failures_total";

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

pub struct ControllerMetrics {
    recorder: PrometheusRecorder,
    last_sync: Gauge,
    ensure_failures: Counter,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();

        recorder.describe_gauge(
            KeyName::from_const_str(LAST_SYNC_TIMESTAMP),
            None,
            SharedString::const_str("Timestamp of the last successful infrastructure sync"),
        );
        recorder.describe_counter(
            KeyName::from_const_str(ENSURE_FAILURES),
            None,
            SharedString::const_str("Number of failed infrastructure syncs"),
        );

        let last_sync =
            recorder.register_gauge(&Key::from_static_name(LAST_SYNC_TIMESTAMP), &METADATA);
        let ensure_failures =
            recorder.register_counter(&Key::from_static_name(ENSURE_FAILURES), &METADATA);

        Self {
            recorder,
            last_sync,
            ensure_failures,
        }
    }

    pub fn record_sync(&self) {
        self.last_sync.set(chrono::Utc::now().timestamp() as f64);
    }

    pub fn record_failure(&self) {
        self.ensure_failures.increment(1);
    }

    /// Prometheus text exposition of all metrics.
    pub fn render(&self) -> String {
        self.recorder.handle().render()
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rendered: &str, name: &str) -> Option<f64> {
        rendered
            .lines()
            .filter(|line| !line.starts_with('#'))
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().parse().ok())
    }

    #[test]
    fn test_sync_sets_timestamp() {
        let metrics = ControllerMetrics::new();
        let before = chrono::Utc::now().timestamp() as f64;

        metrics.record_sync();

        let value = sample(&metrics.render(), LAST_SYNC_TIMESTAMP).unwrap();
        assert!(value >= before);
    }

    #[test]
    fn test_failures_are_counted() {
        let metrics = ControllerMetrics::new();
        metrics.record_failure();
        metrics.record_failure();

        assert_eq!(sample(&metrics.render(), ENSURE_FAILURES), Some(2.0));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ControllerMetrics::new();
        let b = ControllerMetrics::new();
        a.record_failure();

        assert_eq!(sample(&a.render(), ENSURE_FAILURES), Some(1.0));
        assert_eq!(sample(&b.render(), ENSURE_FAILURES), Some(0.0));
    }
}
