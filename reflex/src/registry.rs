//! Explicit registry of the consumer metrics and of consumer liveness.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{Counter, Gauge, Histogram, Key, Label, Recorder, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

pub const CONSUMER_LABEL: &str = "consumer";
pub const LAG_GAUGE: &str = "reflex_consumer_lag_seconds";
pub const LAG_ALERT_GAUGE: &str = "reflex_consumer_lag_alert";
pub const ERROR_COUNTER: &str = "reflex_consumer_error_count";
pub const LATENCY_HISTOGRAM: &str = "reflex_consumer_latency_seconds";
pub const ACTIVITY_GAUGE: &str = "reflex_consumer_active";

/// Registry owning the metric handles of every consumer built against it.
///
/// The underlying Prometheus recorder is not installed as the global
/// `metrics` recorder; hosts expose [`MetricsRegistry::render`] themselves.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    activity: Mutex<HashMap<String, Activity>>,
}

struct Activity {
    ttl: Duration,
    last_active: Option<Instant>,
    gauge: Gauge,
    registrations: usize,
}

impl Activity {
    fn is_active(&self) -> bool {
        self.last_active.is_some_and(|at| at.elapsed() < self.ttl)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        MetricsRegistry::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> MetricsRegistry {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        recorder.describe_gauge(
            LAG_GAUGE.into(),
            Some(Unit::Seconds),
            "Age of the last consumed event".into(),
        );
        recorder.describe_gauge(
            LAG_ALERT_GAUGE.into(),
            None,
            "1 if the consumer lag exceeds its alert threshold".into(),
        );
        recorder.describe_counter(
            ERROR_COUNTER.into(),
            None,
            "Number of events the handler failed to consume".into(),
        );
        recorder.describe_histogram(
            LATENCY_HISTOGRAM.into(),
            Some(Unit::Seconds),
            "Handler latency".into(),
        );
        recorder.describe_gauge(
            ACTIVITY_GAUGE.into(),
            None,
            "1 if the consumer consumed an event within its activity ttl".into(),
        );

        MetricsRegistry {
            inner: Arc::new(RegistryInner {
                recorder,
                handle,
                activity: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn key(name: &'static str, consumer: &str) -> Key {
        Key::from_parts(name, vec![Label::new(CONSUMER_LABEL, consumer.to_string())])
    }

    pub fn gauge(&self, name: &'static str, consumer: &str) -> Gauge {
        self.inner.recorder.register_gauge(&Self::key(name, consumer))
    }

    pub fn counter(&self, name: &'static str, consumer: &str) -> Counter {
        self.inner.recorder.register_counter(&Self::key(name, consumer))
    }

    pub fn histogram(&self, name: &'static str, consumer: &str) -> Histogram {
        self.inner.recorder.register_histogram(&Self::key(name, consumer))
    }

    fn activity(&self) -> MutexGuard<'_, HashMap<String, Activity>> {
        self.inner
            .activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts tracking liveness of `consumer`. It is reported inactive until
    /// the first [`set_active`](Self::set_active) and again once `ttl` passes
    /// without one.
    pub fn register_activity(&self, consumer: &str, ttl: Duration) {
        let gauge = self.gauge(ACTIVITY_GAUGE, consumer);
        let mut activity = self.activity();
        let entry = activity
            .entry(consumer.to_string())
            .or_insert_with(|| Activity {
                ttl,
                last_active: None,
                gauge,
                registrations: 0,
            });
        entry.ttl = ttl;
        entry.registrations += 1;
    }

    pub fn set_active(&self, consumer: &str) {
        if let Some(entry) = self.activity().get_mut(consumer) {
            entry.last_active = Some(Instant::now());
            entry.gauge.set(1.0);
        }
    }

    pub fn is_active(&self, consumer: &str) -> bool {
        self.activity()
            .get(consumer)
            .is_some_and(Activity::is_active)
    }

    pub fn deregister_activity(&self, consumer: &str) {
        let mut activity = self.activity();
        if let Some(entry) = activity.get_mut(consumer) {
            entry.registrations -= 1;
            if entry.registrations == 0 {
                entry.gauge.set(0.0);
                activity.remove(consumer);
            }
        }
    }

    /// Renders all metrics in the Prometheus text format,
    /// refreshing the activity gauges first.
    pub fn render(&self) -> String {
        for entry in self.activity().values() {
            entry
                .gauge
                .set(if entry.is_active() { 1.0 } else { 0.0 });
        }
        self.inner.handle.render()
    }
}

/// Reads the value of a labelled sample from rendered metrics.
#[cfg(test)]
pub(crate) fn sample(rendered: &str, name: &str, consumer: &str) -> Option<f64> {
    let prefix = format!("{name}{{{CONSUMER_LABEL}=\"{consumer}\"}} ");
    rendered
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .and_then(|value| value.trim().parse().ok())
}
