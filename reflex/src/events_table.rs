//! Append-only events table: insert, latest id and ranged batch fetch.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rusqlite::types::Type;
use rusqlite::{params_from_iter, Connection, Row, ToSql};

use crate::db::{Db, NOW_FUNCTION};
use crate::errors::{Error, ErrorClassifier, Result, SqliteErrorClassifier};
use crate::event::{EventKind, EventRecord, EventType};

/// Maximum number of events returned by a single [`EventsTable::next_batch`].
pub const BATCH_SIZE: usize = 1000;

const DEFAULT_FOREIGN_ID_FIELD: &str = "foreign_id";
const DEFAULT_TIME_FIELD: &str = "timestamp";
const DEFAULT_TYPE_FIELD: &str = "type";

/// Column layout of an events table. The id column is always `id`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EventsSchema {
    pub(crate) table: String,
    pub(crate) foreign_id_field: String,
    pub(crate) time_field: String,
    pub(crate) type_field: String,
    // None disables metadata.
    pub(crate) metadata_field: Option<String>,
}

impl EventsSchema {
    pub fn builder(table: &str) -> EventsSchemaBuilder {
        EventsSchemaBuilder {
            schema: EventsSchema {
                table: table.to_string(),
                foreign_id_field: DEFAULT_FOREIGN_ID_FIELD.to_string(),
                time_field: DEFAULT_TIME_FIELD.to_string(),
                type_field: DEFAULT_TYPE_FIELD.to_string(),
                metadata_field: None,
            },
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn metadata_enabled(&self) -> bool {
        self.metadata_field.is_some()
    }

    fn insert_query(&self) -> String {
        let mut columns = vec![
            self.foreign_id_field.as_str(),
            self.time_field.as_str(),
            self.type_field.as_str(),
        ];
        let now = format!("{NOW_FUNCTION}()");
        let mut values = vec!["?1", now.as_str(), "?2"];
        if let Some(metadata) = &self.metadata_field {
            columns.push(metadata);
            values.push("?3");
        }

        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.iter().join(", "),
            values.iter().join(", ")
        )
    }

    fn next_batch_query(&self, with_lag: bool) -> String {
        let metadata = self.metadata_field.as_deref().unwrap_or("NULL");
        let mut query = format!(
            "SELECT id, {}, {}, {}, {} FROM {} WHERE id > ?1",
            self.foreign_id_field, self.time_field, self.type_field, metadata, self.table
        );
        if with_lag {
            query += &format!(" AND {} < {NOW_FUNCTION}() - ?2", self.time_field);
        }
        query += &format!(" ORDER BY id ASC LIMIT {BATCH_SIZE}");
        query
    }
}

pub struct EventsSchemaBuilder {
    schema: EventsSchema,
}

impl EventsSchemaBuilder {
    pub fn foreign_id_field(mut self, field: &str) -> Self {
        self.schema.foreign_id_field = field.to_string();
        self
    }

    pub fn time_field(mut self, field: &str) -> Self {
        self.schema.time_field = field.to_string();
        self
    }

    pub fn type_field(mut self, field: &str) -> Self {
        self.schema.type_field = field.to_string();
        self
    }

    /// Enables the metadata column.
    pub fn metadata_field(mut self, field: &str) -> Self {
        self.schema.metadata_field = Some(field.to_string());
        self
    }

    pub fn build(self) -> Result<EventsSchema> {
        let schema = self.schema;
        [
            &schema.table,
            &schema.foreign_id_field,
            &schema.time_field,
            &schema.type_field,
        ]
        .into_iter()
        .chain(schema.metadata_field.as_ref())
        .try_for_each(|name| validate_identifier(name))?;

        Ok(schema)
    }
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSchema(name.to_string()))
    }
}

/// Accessor of an append-only events table.
#[derive(Clone)]
pub struct EventsTable {
    db: Db,
    schema: Arc<EventsSchema>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl EventsTable {
    pub fn new(db: Db, schema: EventsSchema) -> EventsTable {
        EventsTable::with_classifier(db, schema, Arc::new(SqliteErrorClassifier))
    }

    pub fn with_classifier(
        db: Db,
        schema: EventsSchema,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> EventsTable {
        EventsTable {
            db,
            schema: Arc::new(schema),
            classifier,
        }
    }

    pub fn schema(&self) -> &EventsSchema {
        &self.schema
    }

    /// Appends one event. Its id and timestamp are assigned by the database.
    pub async fn insert(
        &self,
        foreign_id: &str,
        event_type: &dyn EventType,
        metadata: Option<&[u8]>,
    ) -> Result<()> {
        if metadata.is_some() && !self.schema.metadata_enabled() {
            return Err(Error::MetadataDisabled {
                table: self.schema.table.clone(),
            });
        }

        let query = self.schema.insert_query();
        let foreign_id = foreign_id.to_string();
        let code = event_type.event_code();
        let metadata = metadata.map(<[u8]>::to_vec);
        let with_metadata = self.schema.metadata_enabled();

        let context = format!("table {}, foreign id {}", self.schema.table, foreign_id);
        let result = self
            .call("insert event", &context, move |conn| {
                let mut args: Vec<&dyn ToSql> = vec![&foreign_id as &dyn ToSql, &code];
                if with_metadata {
                    args.push(&metadata);
                }
                conn.execute(&query, args.as_slice())
            })
            .await?;

        result
            .map(|_| ())
            .map_err(|e| self.storage_error("insert event", context, e))
    }

    /// Returns the greatest id in the table, or 0 if the table is empty.
    pub async fn latest_id(&self) -> Result<i64> {
        let query = format!("SELECT MAX(id) FROM {}", self.schema.table);
        let context = format!("table {}", self.schema.table);

        self.call("get latest id", &context, move |conn| {
            conn.query_row(&query, [], |row| row.get::<_, Option<i64>>(0))
        })
        .await?
        .map(|id| id.unwrap_or(0))
        .map_err(|e| self.storage_error("get latest id", context, e))
    }

    /// Returns up to [`BATCH_SIZE`] events with an id greater than `after`,
    /// in ascending id order.
    ///
    /// A non-zero `lag` excludes events younger than `lag`, giving concurrent
    /// writers time to commit lower ids before a reader moves past them.
    pub async fn next_batch(&self, after: i64, lag: Duration) -> Result<Vec<EventRecord>> {
        let with_lag = !lag.is_zero();
        let query = self.schema.next_batch_query(with_lag);
        let lag_micros = i64::try_from(lag.as_micros()).unwrap_or(i64::MAX);
        let context = format!("table {}, after {}", self.schema.table, after);

        self.call("get next events", &context, move |conn| {
            fetch_events(conn, &query, after, with_lag.then_some(lag_micros))
        })
        .await?
        .map_err(|e| self.storage_error("get next events", context, e))
    }

    async fn call<T, F>(&self, op: &'static str, context: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.db.call(f).await.ok_or_else(|| Error::Cancelled {
            op,
            context: context.to_string(),
        })
    }

    fn storage_error(&self, op: &'static str, context: String, err: rusqlite::Error) -> Error {
        Error::storage(self.classifier.as_ref(), op, context, err)
    }
}

fn fetch_events(
    conn: &Connection,
    query: &str,
    after: i64,
    lag_micros: Option<i64>,
) -> rusqlite::Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare_cached(query)?;
    let args = std::iter::once(after).chain(lag_micros);

    // A single malformed row fails the whole batch.
    let rows = stmt.query_map(params_from_iter(args), scan)?;
    rows.collect()
}

fn scan(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let id: i64 = row.get(0)?;
    let micros: i64 = row.get(2)?;
    let timestamp = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Integer,
            format!("timestamp {micros} out of range").into(),
        )
    })?;

    Ok(EventRecord {
        id: id.to_string(),
        foreign_id: row.get(1)?,
        event_type: EventKind(row.get(3)?),
        timestamp,
        metadata: row.get(4)?,
    })
}
