//! A module representing the logic behind saving consumer progress.
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::db::{Db, NOW_FUNCTION};
use crate::errors::{Error, ErrorClassifier, Result, SqliteErrorClassifier};
use crate::events_table::validate_identifier;

const DEFAULT_ID_FIELD: &str = "id";
const DEFAULT_CURSOR_FIELD: &str = "cursor";
const DEFAULT_TIME_FIELD: &str = "timestamp";

/// Representation in which stored cursors are compared.
///
/// Event ids are strings on the wire. Stored cursors are cast to this type
/// before the comparison whatever the column's declared type, otherwise
/// "10" would sort before "9".
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum CursorType {
    #[default]
    Integer,
    Text,
}

impl CursorType {
    /// Casts a cursor string into the value bound in comparisons.
    pub fn cast(&self, cursor: &str) -> Result<Value, String> {
        match self {
            CursorType::Integer => cursor
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| e.to_string()),
            CursorType::Text => Ok(Value::Text(cursor.to_string())),
        }
    }

    fn sql_type(&self) -> &'static str {
        match self {
            CursorType::Integer => "INTEGER",
            CursorType::Text => "TEXT",
        }
    }

    /// Cursor of a consumer that never advanced.
    pub fn zero(&self) -> String {
        match self {
            CursorType::Integer => "0".to_string(),
            CursorType::Text => String::new(),
        }
    }
}

/// Column layout of a cursors table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CursorsSchema {
    table: String,
    id_field: String,
    cursor_field: String,
    time_field: String,
    cursor_type: CursorType,
}

impl CursorsSchema {
    pub fn builder(table: &str) -> CursorsSchemaBuilder {
        CursorsSchemaBuilder {
            schema: CursorsSchema {
                table: table.to_string(),
                id_field: DEFAULT_ID_FIELD.to_string(),
                cursor_field: DEFAULT_CURSOR_FIELD.to_string(),
                time_field: DEFAULT_TIME_FIELD.to_string(),
                cursor_type: CursorType::default(),
            },
        }
    }

    pub fn cursor_type(&self) -> CursorType {
        self.cursor_type
    }

    fn get_query(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            self.cursor_field, self.table, self.id_field
        )
    }

    fn update_query(&self) -> String {
        format!(
            "UPDATE {} SET {cursor} = ?1, {} = {NOW_FUNCTION}() \
             WHERE {} = ?2 AND CAST({cursor} AS {}) < ?1",
            self.table,
            self.time_field,
            self.id_field,
            self.cursor_type.sql_type(),
            cursor = self.cursor_field,
        )
    }

    fn insert_query(&self) -> String {
        format!(
            "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, {NOW_FUNCTION}())",
            self.table, self.id_field, self.cursor_field, self.time_field
        )
    }
}

pub struct CursorsSchemaBuilder {
    schema: CursorsSchema,
}

impl CursorsSchemaBuilder {
    pub fn id_field(mut self, field: &str) -> Self {
        self.schema.id_field = field.to_string();
        self
    }

    pub fn cursor_field(mut self, field: &str) -> Self {
        self.schema.cursor_field = field.to_string();
        self
    }

    pub fn time_field(mut self, field: &str) -> Self {
        self.schema.time_field = field.to_string();
        self
    }

    pub fn cursor_type(mut self, cursor_type: CursorType) -> Self {
        self.schema.cursor_type = cursor_type;
        self
    }

    pub fn build(self) -> Result<CursorsSchema> {
        for name in [
            &self.schema.table,
            &self.schema.id_field,
            &self.schema.cursor_field,
            &self.schema.time_field,
        ] {
            validate_identifier(name)?;
        }
        Ok(self.schema)
    }
}

/// Durable per-consumer checkpoint.
///
/// A stored cursor never moves backward: advancing to a value that is not
/// greater than the stored one fails with [`Error::CursorRegression`].
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Loads the cursor of `consumer`, or the zero cursor if it never advanced.
    async fn get(&self, consumer: &str) -> Result<String>;
    /// Moves the cursor of `consumer` forward to `cursor`.
    async fn advance(&self, consumer: &str, cursor: &str) -> Result<()>;
}

/// Default implementation of [`CursorStore`].
/// Keeps one row per consumer in a cursors table.
#[derive(Clone)]
pub struct TableBackedCursorStore {
    db: Db,
    schema: Arc<CursorsSchema>,
    classifier: Arc<dyn ErrorClassifier>,
}

enum AdvanceOutcome {
    Updated(usize),
    Inserted,
    InsertFailed(rusqlite::Error),
}

impl TableBackedCursorStore {
    pub fn new(db: Db, schema: CursorsSchema) -> TableBackedCursorStore {
        TableBackedCursorStore::with_classifier(db, schema, Arc::new(SqliteErrorClassifier))
    }

    pub fn with_classifier(
        db: Db,
        schema: CursorsSchema,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> TableBackedCursorStore {
        TableBackedCursorStore {
            db,
            schema: Arc::new(schema),
            classifier,
        }
    }

    fn storage_error(&self, op: &'static str, context: String, err: rusqlite::Error) -> Error {
        Error::storage(self.classifier.as_ref(), op, context, err)
    }
}

// Update guarded by `cursor < new`; when nothing matched, the row either
// does not exist yet or already holds a cursor >= new, and the insert tells
// the two apart.
fn advance_cursor(
    conn: &Connection,
    update_query: &str,
    insert_query: &str,
    consumer: &str,
    cursor: &Value,
) -> rusqlite::Result<AdvanceOutcome> {
    let rows = conn.execute(update_query, params![cursor, consumer])?;
    if rows > 0 {
        return Ok(AdvanceOutcome::Updated(rows));
    }

    match conn.execute(insert_query, params![consumer, cursor]) {
        Ok(_) => Ok(AdvanceOutcome::Inserted),
        Err(err) => Ok(AdvanceOutcome::InsertFailed(err)),
    }
}

fn cursor_to_string(value: Value) -> Option<String> {
    match value {
        Value::Integer(i) => Some(i.to_string()),
        Value::Text(s) => Some(s),
        Value::Real(f) => Some(f.to_string()),
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        Value::Null => None,
    }
}

#[async_trait]
impl CursorStore for TableBackedCursorStore {
    async fn get(&self, consumer: &str) -> Result<String> {
        let query = self.schema.get_query();
        let id = consumer.to_string();
        let context = format!("consumer {consumer}");

        let result = self
            .db
            .call(move |conn| {
                conn.query_row(&query, params![id], |row| row.get::<_, Value>(0))
                    .optional()
            })
            .await
            .ok_or_else(|| Error::Cancelled {
                op: "get cursor",
                context: context.clone(),
            })?;

        result
            .map(|value| {
                value
                    .and_then(cursor_to_string)
                    .unwrap_or_else(|| self.schema.cursor_type.zero())
            })
            .map_err(|e| self.storage_error("get cursor", context, e))
    }

    async fn advance(&self, consumer: &str, cursor: &str) -> Result<()> {
        let value = self
            .schema
            .cursor_type
            .cast(cursor)
            .map_err(|reason| Error::InvalidCursor {
                consumer: consumer.to_string(),
                cursor: cursor.to_string(),
                reason,
            })?;
        let update_query = self.schema.update_query();
        let insert_query = self.schema.insert_query();
        let id = consumer.to_string();
        let context = format!("consumer {consumer}, cursor {cursor}");

        let outcome = self
            .db
            .call(move |conn| advance_cursor(conn, &update_query, &insert_query, &id, &value))
            .await
            .ok_or_else(|| Error::Cancelled {
                op: "set cursor",
                context: context.clone(),
            })?
            .map_err(|e| self.storage_error("set cursor", context.clone(), e))?;

        match outcome {
            AdvanceOutcome::Updated(1) | AdvanceOutcome::Inserted => Ok(()),
            AdvanceOutcome::Updated(rows) => Err(Error::InvalidCursorState {
                consumer: consumer.to_string(),
                cursor: cursor.to_string(),
                rows,
            }),
            AdvanceOutcome::InsertFailed(err) if self.classifier.is_duplicate_key(&err) => {
                warn!(
                    "Cursor of consumer {} not moved to {}: stored cursor is not behind",
                    consumer, cursor
                );
                Err(Error::CursorRegression {
                    consumer: consumer.to_string(),
                    cursor: cursor.to_string(),
                    source: err,
                })
            }
            AdvanceOutcome::InsertFailed(err) => {
                Err(self.storage_error("insert cursor", context, err))
            }
        }
    }
}
