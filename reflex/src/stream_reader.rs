//! The fetch-and-consume loop of a single named consumer.
//!
//! Each cycle reads the consumer's cursor, fetches the next batch after it,
//! hands the events to the consumer in ascending id order and advances the
//! cursor after every event the consumer accepted. The first failing event
//! ends the cycle; it is delivered again on the next one.
use std::fmt;
use std::sync::Arc;
use std::time;

use anyhow::Context;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::consumer::Consumer;
use crate::cursors::CursorStore;
use crate::errors::Error;
use crate::events_table::EventsTable;

const DEFAULT_SLEEP_INTERVAL: time::Duration = time::Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: time::Duration = time::Duration::from_secs(60);

pub struct StreamReader {
    events: EventsTable,
    cursors: Arc<dyn CursorStore>,
    consumer: Arc<Consumer>,
    lag: time::Duration,
}

impl StreamReader {
    pub fn new(
        events: EventsTable,
        cursors: Arc<dyn CursorStore>,
        consumer: Arc<Consumer>,
        lag: time::Duration,
    ) -> StreamReader {
        StreamReader {
            events,
            cursors,
            consumer,
            lag,
        }
    }

    /// Runs one fetch-and-consume cycle.
    /// Returns the number of events consumed and acknowledged.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let name = self.consumer.name();
        let cursor = self.cursors.get(name).await?;
        let after = cursor.parse::<i64>().map_err(|e| Error::InvalidCursor {
            consumer: name.to_string(),
            cursor: cursor.clone(),
            reason: e.to_string(),
        })?;

        let events = self.events.next_batch(after, self.lag).await?;
        debug!("Consumer {} fetched {} events after {}", name, events.len(), after);

        let mut consumed = 0;
        for event in &events {
            self.consumer
                .consume(event)
                .await
                .with_context(|| HandlerFailed {
                    consumer: name.to_string(),
                    event_id: event.id.clone(),
                })?;
            self.cursors.advance(name, &event.id).await?;
            consumed += 1;
        }

        Ok(consumed)
    }

    async fn run(
        &self,
        mut stop: watch::Receiver<bool>,
        sleep_interval: time::Duration,
        max_backoff: time::Duration,
    ) -> anyhow::Result<()> {
        let name = self.consumer.name();
        debug!("Consumer {} started", name);

        let mut backoff = sleep_interval;
        loop {
            // A closed channel means the handle was dropped.
            let stopped = *stop.borrow() || stop.has_changed().is_err();
            if stopped {
                break;
            }

            let pause = match self.poll_once().await {
                Ok(0) => {
                    backoff = sleep_interval;
                    sleep_interval
                }
                Ok(_) => {
                    backoff = sleep_interval;
                    continue;
                }
                Err(err) if is_retryable(&err) => {
                    warn!("Consumer {} failed, retrying in {:?}: {:#}", name, backoff, err);
                    let pause = backoff;
                    backoff = (backoff * 2).min(max_backoff);
                    pause
                }
                Err(err) => {
                    error!("Consumer {} stopped: {:#}", name, err);
                    return Err(err);
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Consumer {} stopped", name);
        Ok(())
    }
}

#[derive(Debug)]
struct HandlerFailed {
    consumer: String,
    event_id: String,
}

impl fmt::Display for HandlerFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "consumer {} failed on event {}",
            self.consumer, self.event_id
        )
    }
}

// Handler failures are always redelivered. Storage failures are retried
// only when the error says so.
fn is_retryable(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<HandlerFailed>().is_some() {
        return true;
    }
    err.downcast_ref::<Error>()
        .map_or(true, Error::is_retryable)
}

/// Stops a running [`StreamReader`].
/// Dropping the handle stops the reader as well.
pub struct StreamHandle {
    stop: watch::Sender<bool>,
}

impl StreamHandle {
    /// Tells the loop to stop after the cycle in flight.
    pub fn stop(&mut self) {
        let _ = self.stop.send(true);
    }
}

pub struct StreamReaderBuilder {
    events: Option<EventsTable>,
    cursors: Option<Arc<dyn CursorStore>>,
    consumer: Option<Arc<Consumer>>,
    lag: time::Duration,
    sleep_interval: time::Duration,
    max_backoff: time::Duration,
}

impl Default for StreamReaderBuilder {
    fn default() -> Self {
        StreamReaderBuilder::new()
    }
}

impl StreamReaderBuilder {
    pub fn new() -> StreamReaderBuilder {
        StreamReaderBuilder {
            events: None,
            cursors: None,
            consumer: None,
            lag: time::Duration::ZERO,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    pub fn events(mut self, events: EventsTable) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cursors(mut self, cursors: Arc<dyn CursorStore>) -> Self {
        self.cursors = Some(cursors);
        self
    }

    pub fn consumer(mut self, consumer: Arc<Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Skips events younger than `lag`. Disabled by default.
    pub fn lag(mut self, lag: time::Duration) -> Self {
        self.lag = lag;
        self
    }

    /// Pause after an empty batch, and the initial backoff after a failure.
    pub fn sleep_interval(mut self, interval: time::Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    pub fn max_backoff(mut self, max_backoff: time::Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Creates the reader and runs it immediately.
    pub fn build(self) -> anyhow::Result<(StreamHandle, RemoteHandle<anyhow::Result<()>>)> {
        let reader = StreamReader::new(
            self.events.context("events table not set")?,
            self.cursors.context("cursor store not set")?,
            self.consumer.context("consumer not set")?,
            self.lag,
        );
        let sleep_interval = self.sleep_interval;
        let max_backoff = self.max_backoff.max(sleep_interval);

        let (stop, receiver) = watch::channel(false);
        let (fut, handle) =
            async move { reader.run(receiver, sleep_interval, max_backoff).await }.remote_handle();
        tokio::task::spawn(fut);

        Ok((StreamHandle { stop }, handle))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use reflex_test_utils::{
        get_create_cursors_table_query, get_create_events_table_query, prepare_db, unique_name,
    };
    use tokio::sync::Mutex;

    use super::*;
    use crate::consumer::{handler_fn, EventHandler};
    use crate::cursors::{CursorsSchema, TableBackedCursorStore};
    use crate::db::Db;
    use crate::event::{EventKind, EventRecord};
    use crate::events_table::EventsSchema;
    use crate::registry::MetricsRegistry;

    const SLEEP_INTERVAL: time::Duration = time::Duration::from_millis(20);

    fn setup() -> (EventsTable, Arc<TableBackedCursorStore>) {
        let events = unique_name();
        let cursors = unique_name();
        let conn = prepare_db(&[
            get_create_events_table_query(&events, false),
            get_create_cursors_table_query(&cursors, true, true),
        ])
        .unwrap();
        let db = Db::from_connection(conn).unwrap();

        (
            EventsTable::new(db.clone(), EventsSchema::builder(&events).build().unwrap()),
            Arc::new(TableBackedCursorStore::new(
                db,
                CursorsSchema::builder(&cursors).build().unwrap(),
            )),
        )
    }

    async fn insert_events(events: &EventsTable, n: usize) {
        for i in 0..n {
            events
                .insert(&format!("entity_{i}"), &EventKind(1), None)
                .await
                .unwrap();
        }
    }

    // Fails on the event with the given id, and only the first time.
    struct FailOnceHandler {
        fail_on: String,
        failed: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for FailOnceHandler {
        async fn handle(&self, event: &EventRecord) -> anyhow::Result<()> {
            self.seen.lock().await.push(event.id.clone());
            if event.id == self.fail_on && self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient handler failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poll_once_stops_at_first_failure() {
        let (events, cursors) = setup();
        insert_events(&events, 5).await;

        let handler = Arc::new(FailOnceHandler {
            fail_on: "3".to_string(),
            failed: AtomicUsize::new(0),
            seen: Mutex::new(vec![]),
        });
        let registry = MetricsRegistry::new();
        let consumer = Arc::new(Consumer::builder("reader", handler.clone()).build(&registry));
        let reader = StreamReader::new(events, cursors.clone(), consumer, time::Duration::ZERO);

        let err = reader.poll_once().await.unwrap_err();
        assert!(err.to_string().contains("event 3"));
        assert_eq!(cursors.get("reader").await.unwrap(), "2");

        assert_eq!(reader.poll_once().await.unwrap(), 3);
        assert_eq!(cursors.get("reader").await.unwrap(), "5");
        assert_eq!(reader.poll_once().await.unwrap(), 0);

        let seen = handler.seen.lock().await.clone();
        assert_eq!(seen, vec!["1", "2", "3", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_invalid_stored_cursor_is_fatal() {
        let table = unique_name();
        let conn = prepare_db(&[
            get_create_events_table_query(&table, false),
            get_create_cursors_table_query("text_cursors", false, true),
        ])
        .unwrap();
        let db = Db::from_connection(conn).unwrap();
        let cursors = Arc::new(TableBackedCursorStore::new(
            db.clone(),
            CursorsSchema::builder("text_cursors")
                .cursor_type(crate::cursors::CursorType::Text)
                .build()
                .unwrap(),
        ));
        cursors.advance("reader", "abc").await.unwrap();

        let registry = MetricsRegistry::new();
        let consumer = Arc::new(
            Consumer::builder("reader", Arc::new(handler_fn(|_| async { Ok(()) })))
                .build(&registry),
        );
        let (_handle, join) = StreamReaderBuilder::new()
            .events(EventsTable::new(db, EventsSchema::builder(&table).build().unwrap()))
            .cursors(cursors)
            .consumer(consumer)
            .sleep_interval(SLEEP_INTERVAL)
            .build()
            .unwrap();

        let err = join.await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidCursor { .. })
        ));
    }

    #[tokio::test]
    async fn test_reader_consumes_until_stopped() {
        let (events, cursors) = setup();
        insert_events(&events, 10).await;

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let registry = MetricsRegistry::new();
        let consumer = Arc::new(
            Consumer::builder(
                "counter",
                Arc::new(handler_fn(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })),
            )
            .build(&registry),
        );

        let (mut handle, join) = StreamReaderBuilder::new()
            .events(events.clone())
            .cursors(cursors.clone())
            .consumer(consumer)
            .sleep_interval(SLEEP_INTERVAL)
            .build()
            .unwrap();

        insert_events(&events, 5).await;
        tokio::time::timeout(time::Duration::from_secs(10), async {
            while cursors.get("counter").await.unwrap() != "15" {
                sleep(SLEEP_INTERVAL).await;
            }
        })
        .await
        .unwrap();

        handle.stop();
        join.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_busy_reader() {
        let (events, cursors) = setup();
        insert_events(&events, 1).await;

        // Every consumed event appends another, so batches are never empty.
        let log = events.clone();
        let registry = MetricsRegistry::new();
        let consumer = Arc::new(
            Consumer::builder(
                "feeder",
                Arc::new(handler_fn(move |event| {
                    let log = log.clone();
                    async move {
                        log.insert(&event.foreign_id, &EventKind(1), None).await?;
                        Ok(())
                    }
                })),
            )
            .build(&registry),
        );

        let (handle, join) = StreamReaderBuilder::new()
            .events(events)
            .cursors(cursors.clone())
            .consumer(consumer)
            .sleep_interval(SLEEP_INTERVAL)
            .build()
            .unwrap();

        tokio::time::timeout(time::Duration::from_secs(10), async {
            while cursors.get("feeder").await.unwrap() == "0" {
                sleep(SLEEP_INTERVAL).await;
            }
        })
        .await
        .unwrap();

        drop(handle);
        tokio::time::timeout(time::Duration::from_secs(10), join)
            .await
            .unwrap()
            .unwrap();
    }
}
