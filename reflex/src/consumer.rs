//! A module representing the logic behind consuming events.
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{Counter, Gauge, Histogram};

use crate::event::EventRecord;
use crate::registry::{
    MetricsRegistry, ERROR_COUNTER, LAG_ALERT_GAUGE, LAG_GAUGE, LATENCY_HISTOGRAM,
};

const DEFAULT_LAG_ALERT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_ACTIVITY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Trait used to represent a user-defined callback
/// processing events read from the log.
///
/// Delivery is at-least-once: after a failure the same event
/// may be handed to the handler again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()>;
}

/// [`EventHandler`] backed by an async closure, see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Turns an async closure receiving an owned event into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(EventRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// An instrumented event handler.
///
/// Records lag, lag alerts, errors and latency of every consumed event
/// and keeps the consumer's liveness heartbeat fresh. It never alters the
/// outcome of the handler.
pub struct Consumer {
    name: String,
    handler: Arc<dyn EventHandler>,
    lag_alert: Option<Duration>,
    registry: MetricsRegistry,
    tracks_activity: bool,

    lag_gauge: Gauge,
    lag_alert_gauge: Gauge,
    error_counter: Counter,
    latency: Histogram,
}

impl Consumer {
    pub fn builder(name: &str, handler: Arc<dyn EventHandler>) -> ConsumerBuilder {
        ConsumerBuilder {
            name: name.to_string(),
            handler,
            lag_alert: Some(DEFAULT_LAG_ALERT),
            lag_alert_gauge: None,
            activity_ttl: Some(DEFAULT_ACTIVITY_TTL),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Passes `event` to the handler and returns the handler's result unchanged.
    pub async fn consume(&self, event: &EventRecord) -> anyhow::Result<()> {
        let _timer = LatencyTimer {
            histogram: &self.latency,
            start: Instant::now(),
        };

        if self.tracks_activity {
            self.registry.set_active(&self.name);
        }

        // Events from the future count as no lag.
        let lag = (chrono::Utc::now() - event.timestamp)
            .to_std()
            .unwrap_or_default();
        self.lag_gauge.set(lag.as_secs_f64());

        let alert = self.lag_alert.is_some_and(|threshold| lag > threshold);
        self.lag_alert_gauge.set(if alert { 1.0 } else { 0.0 });

        let result = self.handler.handle(event).await;
        if result.is_err() {
            self.error_counter.increment(1);
        }

        result
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.tracks_activity {
            self.registry.deregister_activity(&self.name);
        }
    }
}

// Records on every exit path, including cancellation of `consume`.
struct LatencyTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        self.histogram.record(self.start.elapsed().as_secs_f64());
    }
}

pub struct ConsumerBuilder {
    name: String,
    handler: Arc<dyn EventHandler>,
    lag_alert: Option<Duration>,
    lag_alert_gauge: Option<Gauge>,
    activity_ttl: Option<Duration>,
}

impl ConsumerBuilder {
    /// Sets the lag above which the lag alert gauge is raised (default 30 minutes).
    /// A zero threshold disables the alert.
    pub fn lag_alert(mut self, threshold: Duration) -> Self {
        self.lag_alert = (!threshold.is_zero()).then_some(threshold);
        self
    }

    pub fn without_lag_alert(mut self) -> Self {
        self.lag_alert = None;
        self
    }

    /// Reports lag alerts to `gauge` instead of the registry's gauge,
    /// e.g. one carrying extra alert labels.
    pub fn lag_alert_gauge(mut self, gauge: Gauge) -> Self {
        self.lag_alert_gauge = Some(gauge);
        self
    }

    /// The consumer is reported inactive if it consumes nothing for `ttl`
    /// (default 24 hours).
    pub fn activity_ttl(mut self, ttl: Duration) -> Self {
        self.activity_ttl = Some(ttl);
        self
    }

    pub fn without_activity_ttl(mut self) -> Self {
        self.activity_ttl = None;
        self
    }

    pub fn build(self, registry: &MetricsRegistry) -> Consumer {
        let name = self.name;

        if let Some(ttl) = self.activity_ttl {
            registry.register_activity(&name, ttl);
        }

        Consumer {
            lag_gauge: registry.gauge(LAG_GAUGE, &name),
            lag_alert_gauge: self
                .lag_alert_gauge
                .unwrap_or_else(|| registry.gauge(LAG_ALERT_GAUGE, &name)),
            error_counter: registry.counter(ERROR_COUNTER, &name),
            latency: registry.histogram(LATENCY_HISTOGRAM, &name),
            handler: self.handler,
            lag_alert: self.lag_alert,
            registry: registry.clone(),
            tracks_activity: self.activity_ttl.is_some(),
            name,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;
    use crate::event::EventKind;
    use crate::registry::{sample, ACTIVITY_GAUGE};

    struct FailingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, event: &EventRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("cannot handle event {}", event.id))
        }
    }

    fn event_aged(age: chrono::Duration) -> EventRecord {
        EventRecord {
            id: "1".to_string(),
            foreign_id: "f".to_string(),
            event_type: EventKind(1),
            timestamp: chrono::Utc::now() - age,
            metadata: None,
        }
    }

    fn ok_handler() -> Arc<dyn EventHandler> {
        Arc::new(handler_fn(|_| async { Ok(()) }))
    }

    #[tokio::test]
    async fn test_errors_are_propagated_and_counted() {
        for lag_alert in [true, false] {
            let registry = MetricsRegistry::new();
            let handler = Arc::new(FailingHandler {
                calls: AtomicUsize::new(0),
            });
            let mut builder = Consumer::builder("failing", handler.clone());
            if !lag_alert {
                builder = builder.without_lag_alert();
            }
            let consumer = builder.build(&registry);

            for i in 1..=3 {
                let err = consumer
                    .consume(&event_aged(chrono::Duration::hours(2)))
                    .await
                    .unwrap_err();
                assert_eq!(err.to_string(), "cannot handle event 1");
                assert_eq!(
                    sample(&registry.render(), ERROR_COUNTER, "failing"),
                    Some(i as f64)
                );
            }
            assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

            let rendered = registry.render();
            assert_eq!(
                sample(&rendered, &format!("{LATENCY_HISTOGRAM}_count"), "failing"),
                Some(3.0)
            );
        }
    }

    #[tokio::test]
    async fn test_lag_alert() {
        let registry = MetricsRegistry::new();
        let consumer = Consumer::builder("lagging", ok_handler())
            .lag_alert(Duration::from_secs(60))
            .build(&registry);

        consumer
            .consume(&event_aged(chrono::Duration::minutes(5)))
            .await
            .unwrap();
        let rendered = registry.render();
        assert_eq!(sample(&rendered, LAG_ALERT_GAUGE, "lagging"), Some(1.0));
        let lag = sample(&rendered, LAG_GAUGE, "lagging").unwrap();
        assert!((299.0..310.0).contains(&lag), "lag {lag}");

        consumer
            .consume(&event_aged(chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(
            sample(&registry.render(), LAG_ALERT_GAUGE, "lagging"),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_lag_alert_disabled() {
        let registry = MetricsRegistry::new();
        let consumer = Consumer::builder("relaxed", ok_handler())
            .without_lag_alert()
            .build(&registry);

        consumer
            .consume(&event_aged(chrono::Duration::days(3)))
            .await
            .unwrap();
        assert_eq!(
            sample(&registry.render(), LAG_ALERT_GAUGE, "relaxed"),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_zero_lag_alert_threshold_disables_alert() {
        let registry = MetricsRegistry::new();
        let consumer = Consumer::builder("zero", ok_handler())
            .lag_alert(Duration::ZERO)
            .build(&registry);

        consumer
            .consume(&event_aged(chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(
            sample(&registry.render(), LAG_ALERT_GAUGE, "zero"),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn test_custom_lag_alert_gauge() {
        let registry = MetricsRegistry::new();
        let custom = registry.gauge("custom_lag_alert", "custom");
        let consumer = Consumer::builder("custom", ok_handler())
            .lag_alert_gauge(custom)
            .build(&registry);

        consumer
            .consume(&event_aged(chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(
            sample(&registry.render(), "custom_lag_alert", "custom"),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_activity_heartbeat() {
        let registry = MetricsRegistry::new();
        let consumer = Consumer::builder("alive", ok_handler()).build(&registry);
        assert!(!registry.is_active("alive"));

        consumer
            .consume(&event_aged(chrono::Duration::zero()))
            .await
            .unwrap();
        assert!(registry.is_active("alive"));
        assert_eq!(sample(&registry.render(), ACTIVITY_GAUGE, "alive"), Some(1.0));

        drop(consumer);
        assert!(!registry.is_active("alive"));
    }

    #[tokio::test]
    async fn test_activity_disabled() {
        let registry = MetricsRegistry::new();
        let consumer = Consumer::builder("silent", ok_handler())
            .without_activity_ttl()
            .build(&registry);

        consumer
            .consume(&event_aged(chrono::Duration::zero()))
            .await
            .unwrap();
        assert!(!registry.is_active("silent"));
        assert_eq!(sample(&registry.render(), ACTIVITY_GAUGE, "silent"), None);
    }
}
