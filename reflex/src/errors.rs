//! Error taxonomy of the event log and cursor store,
//! and the classification of storage-engine error codes.
use std::error::Error as StdError;

use rusqlite::ErrorCode;

/// Errors returned by [`EventsTable`](crate::events_table::EventsTable),
/// the cursor stores and the stream reader.
///
/// Nothing is retried internally. Every storage failure is wrapped with
/// the operation that failed and enough context (table, consumer, cursor)
/// to be diagnosed from the error alone.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connectivity, locking or any other storage failure the caller may retry.
    #[error("{op} failed ({context})")]
    TransientStorage {
        op: &'static str,
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The backend refused the write (read-only replica or missing permission).
    /// Retrying against the same database will not help.
    #[error("{op} rejected by storage ({context})")]
    WriteRejected {
        op: &'static str,
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("metadata not enabled on events table {table}")]
    MetadataDisabled { table: String },

    /// Another writer of the same consumer already stored a cursor that is
    /// greater than or equal to the one being set. Re-read before retrying.
    #[error("attempted to set cursor <= existing cursor (consumer {consumer}, cursor {cursor})")]
    CursorRegression {
        consumer: String,
        cursor: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A guarded cursor update touched more than one row.
    #[error("invalid rows affected {rows} (consumer {consumer}, cursor {cursor})")]
    InvalidCursorState {
        consumer: String,
        cursor: String,
        rows: usize,
    },

    #[error("{op} cancelled ({context})")]
    Cancelled { op: &'static str, context: String },

    #[error("malformed row in {op} ({context})")]
    MalformedRow {
        op: &'static str,
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid cursor {cursor:?} for consumer {consumer}: {reason}")]
    InvalidCursor {
        consumer: String,
        cursor: String,
        reason: String,
    },

    #[error("invalid identifier {0:?} in table schema")]
    InvalidSchema(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Returns true for failures that may succeed when the same call is repeated
    /// (possibly after re-reading the cursor).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientStorage { .. }
                | Error::Cancelled { .. }
                | Error::CursorRegression { .. }
        )
    }

    /// Returns true for failures that repeating the call can never fix.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Wraps a driver error of `op`, using `classifier` to tell rejected writes apart.
    pub(crate) fn storage(
        classifier: &dyn ErrorClassifier,
        op: &'static str,
        context: impl Into<String>,
        source: rusqlite::Error,
    ) -> Error {
        let context = context.into();
        if is_interrupted(&source) {
            Error::Cancelled { op, context }
        } else if is_decode_failure(&source) {
            Error::MalformedRow {
                op,
                context,
                source,
            }
        } else if classifier.is_write_rejected(&source) {
            Error::WriteRejected {
                op,
                context,
                source,
            }
        } else {
            Error::TransientStorage {
                op,
                context,
                source,
            }
        }
    }
}

fn is_interrupted(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted)
}

fn is_decode_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

/// Maps storage-engine specific error codes to the failure kinds
/// the event log and cursor stores act upon.
///
/// Implementations inspect the whole `source()` chain and must return
/// `false` for errors that carry no recognizable code.
pub trait ErrorClassifier: Send + Sync {
    /// The backend refused the write because it is read-only
    /// or the credentials lack permission.
    fn is_write_rejected(&self, err: &(dyn StdError + 'static)) -> bool;

    /// The write violated a uniqueness constraint.
    fn is_duplicate_key(&self, err: &(dyn StdError + 'static)) -> bool;
}

fn error_chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// Default classifier for SQLite result codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteErrorClassifier;

impl SqliteErrorClassifier {
    fn sqlite_failure(err: &(dyn StdError + 'static)) -> Option<rusqlite::ffi::Error> {
        error_chain(err).find_map(|e| match e.downcast_ref::<rusqlite::Error>() {
            Some(rusqlite::Error::SqliteFailure(failure, _)) => Some(*failure),
            _ => e.downcast_ref::<rusqlite::ffi::Error>().copied(),
        })
    }
}

impl ErrorClassifier for SqliteErrorClassifier {
    fn is_write_rejected(&self, err: &(dyn StdError + 'static)) -> bool {
        Self::sqlite_failure(err).is_some_and(|failure| {
            matches!(
                failure.code,
                ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
                    | ErrorCode::AuthorizationForStatementDenied
            )
        })
    }

    fn is_duplicate_key(&self, err: &(dyn StdError + 'static)) -> bool {
        Self::sqlite_failure(err).is_some_and(|failure| {
            failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        })
    }
}

/// Table-driven classifier for engines that report numeric error codes.
///
/// `extract` pulls the engine code out of a single error in the chain.
pub struct CodeClassifier<F> {
    extract: F,
    write_rejected: Vec<i64>,
    duplicate_key: Vec<i64>,
}

impl<F> CodeClassifier<F>
where
    F: Fn(&(dyn StdError + 'static)) -> Option<i64> + Send + Sync,
{
    pub fn new(extract: F, write_rejected: Vec<i64>, duplicate_key: Vec<i64>) -> Self {
        CodeClassifier {
            extract,
            write_rejected,
            duplicate_key,
        }
    }

    /// MySQL server codes:
    ///  - 1290: ER_OPTION_PREVENTS_STATEMENT (read only)
    ///  - 1142, 1143, 1370: table, column and routine access denied
    ///  - 1062: ER_DUP_ENTRY
    pub fn mysql(extract: F) -> Self {
        CodeClassifier::new(extract, vec![1290, 1142, 1143, 1370], vec![1062])
    }

    fn matches(&self, err: &(dyn StdError + 'static), codes: &[i64]) -> bool {
        error_chain(err)
            .filter_map(|e| (self.extract)(e))
            .any(|code| codes.contains(&code))
    }
}

impl<F> ErrorClassifier for CodeClassifier<F>
where
    F: Fn(&(dyn StdError + 'static)) -> Option<i64> + Send + Sync,
{
    fn is_write_rejected(&self, err: &(dyn StdError + 'static)) -> bool {
        self.matches(err, &self.write_rejected)
    }

    fn is_duplicate_key(&self, err: &(dyn StdError + 'static)) -> bool {
        self.matches(err, &self.duplicate_key)
    }
}
