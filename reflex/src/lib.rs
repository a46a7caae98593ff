//! Change-data-capture style event log on top of a relational table.
//!
//! Producers append immutable events to an [`EventsTable`](events_table::EventsTable).
//! Every named [`Consumer`](consumer::Consumer) replays the log from its own
//! durable cursor kept by a [`CursorStore`](cursors::CursorStore), with
//! at-least-once delivery. [`StreamReader`](stream_reader::StreamReader) ties
//! the pieces together.
pub mod consumer;
pub mod cursors;
pub mod db;
pub mod errors;
pub mod event;
pub mod events_table;
pub mod registry;
pub mod stream_reader;

pub use errors::{Error, Result};
