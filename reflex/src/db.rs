//! A shared SQLite connection whose blocking calls run off the async runtime.
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, InterruptHandle, OpenFlags};

/// Name of the SQL function returning the current UTC time in microseconds.
/// Registered on every connection opened through [`Db`]; event and cursor
/// timestamps are always assigned by it, never by the caller.
pub const NOW_FUNCTION: &str = "now_micros";

/// Cheaply cloneable handle to a single SQLite connection.
///
/// Calls are serialized on the connection. Dropping the future returned by
/// a call interrupts the statement that call is running, and only that one.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    // Id of the call currently executing on the connection.
    running: Mutex<Option<u64>>,
    next_call: AtomicU64,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Db> {
        Db::from_connection(Connection::open(path)?)
    }

    pub fn open_with_flags(path: impl AsRef<Path>, flags: OpenFlags) -> rusqlite::Result<Db> {
        Db::from_connection(Connection::open_with_flags(path, flags)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Db> {
        Db::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an already configured connection.
    pub fn from_connection(conn: Connection) -> rusqlite::Result<Db> {
        conn.create_scalar_function(NOW_FUNCTION, 0, FunctionFlags::SQLITE_UTF8, |_| {
            Ok(chrono::Utc::now().timestamp_micros())
        })?;
        let interrupt = conn.get_interrupt_handle();

        Ok(Db {
            inner: Arc::new(DbInner {
                conn: Mutex::new(conn),
                interrupt,
                running: Mutex::new(None),
                next_call: AtomicU64::new(0),
            }),
        })
    }

    /// Runs `f` on the connection in a blocking task.
    ///
    /// Returns `None` only if the call never ran, which happens when the
    /// blocking task could not complete (runtime shutdown).
    pub(crate) async fn call<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Connection) -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let guard = InterruptOnDrop {
            inner: &self.inner,
            id,
            cancelled: cancelled.clone(),
            armed: true,
        };

        let inner = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = lock(&inner.conn);
            if cancelled.load(Ordering::Acquire) {
                return None;
            }
            *lock(&inner.running) = Some(id);
            let result = f(&mut conn);
            *lock(&inner.running) = None;
            Some(result)
        });

        let result = match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => None,
        };
        guard.disarm();
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InterruptOnDrop<'a> {
    inner: &'a DbInner,
    id: u64,
    cancelled: Arc<AtomicBool>,
    armed: bool,
}

impl InterruptOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        // Held while interrupting so the call cannot finish and hand the
        // connection to another call in between.
        let running = lock(&self.inner.running);
        if *running == Some(self.id) {
            self.inner.interrupt.interrupt();
        }
    }
}
