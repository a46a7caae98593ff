//! Value types flowing through the event log.
use std::fmt;
use std::num::ParseIntError;

use chrono::{DateTime, Utc};

/// A type that reports an integer event-kind code.
///
/// Applications keep their own registry of kinds, usually an enum with an
/// explicit `#[repr(i32)]`, and implement this trait for it.
pub trait EventType: Send + Sync {
    fn event_code(&self) -> i32;
}

/// Event kind as stored in the events table.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EventKind(pub i32);

impl EventType for EventKind {
    fn event_code(&self) -> i32 {
        self.0
    }
}

impl EventType for i32 {
    fn event_code(&self) -> i32 {
        *self
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single immutable row of the events table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EventRecord {
    /// Decimal string of the row id. Ids increase strictly in fetch order
    /// but may have gaps.
    pub id: String,
    /// Identifies the entity the event is about.
    pub foreign_id: String,
    pub event_type: EventKind,
    /// Assigned by the database on insert, microsecond resolution.
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Vec<u8>>,
}

impl EventRecord {
    pub fn id_int(&self) -> Result<i64, ParseIntError> {
        self.id.parse()
    }

    /// Returns true if the event kind equals any of `types`.
    pub fn is_type(&self, types: &[&dyn EventType]) -> bool {
        types
            .iter()
            .any(|t| t.event_code() == self.event_type.event_code())
    }
}
