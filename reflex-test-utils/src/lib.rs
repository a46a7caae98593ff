use std::sync::atomic::{AtomicUsize, Ordering};

use rusqlite::Connection;

static UNIQUE_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn now() -> chrono::Duration {
    chrono::Duration::milliseconds(chrono::Local::now().timestamp_millis())
}

pub fn unique_name() -> String {
    let cnt = UNIQUE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let name = format!("test_rust_{}_{}", now().num_seconds(), cnt);
    println!("unique_name: {name}");
    name
}

/// Events table with an auto-assigned, never reused id
/// and timestamps stored as microseconds since the epoch.
pub fn get_create_events_table_query(table: &str, with_metadata: bool) -> String {
    let metadata_column = if with_metadata {
        ", metadata BLOB"
    } else {
        ""
    };

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            foreign_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            type INTEGER NOT NULL{metadata_column})"
    )
}

/// Cursors table keyed by consumer name. Without `unique` the consumer
/// name is not a key, which only tests of broken tables want.
pub fn get_create_cursors_table_query(table: &str, numeric: bool, unique: bool) -> String {
    let cursor_type = if numeric { "INTEGER" } else { "TEXT" };
    let id_constraint = if unique { " PRIMARY KEY" } else { "" };

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT NOT NULL{id_constraint},
            cursor {cursor_type} NOT NULL,
            timestamp INTEGER NOT NULL)"
    )
}

/// Opens an in-memory database and runs the given schema statements.
pub fn prepare_db(schema: &[String]) -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    for query in schema {
        conn.execute(query, [])?;
    }
    Ok(conn)
}
