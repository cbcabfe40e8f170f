//! `SQLite`-backed [`EventStore`].

use super::{acquire_lock, configure_connection, record_operation_metrics};
use crate::models::{EventId, MessageId, NewEvent, StoredEmail, StoredEvent};
use crate::storage::traits::EventStore;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::instrument;

const EVENT_COLUMNS: &str = "id, title, date_time, location, organizer, duration_minutes, \
                             source_received_at, source_message_id, thread_root";

const EMAIL_COLUMNS: &str = "message_id, in_reply_to, thread_root, subject, sender, received_at";

/// Durable event store in a single `SQLite` file.
///
/// # Concurrency Model
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
/// Each call holds the lock only for its own statement; statements are short
/// and never span an await point.
///
/// # Schema
///
/// - `emails`: one row per processed message, keyed by message ID
/// - `events`: one row per stored event, `INTEGER PRIMARY KEY` IDs
///
/// Timestamps are stored as RFC 3339 text with nanosecond precision, so a
/// value reads back exactly as it was written.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Opens (creating if needed) a store at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::operation("create_store_dir", e))?;
        }
        let conn = Connection::open(&db_path).map_err(|e| Error::operation("open_sqlite", e))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Creates an in-memory store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::operation("open_sqlite_in_memory", e))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Opens the store at `path`, or in memory when `path` is `:memory:`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == ":memory:" {
            Self::in_memory()
        } else {
            Self::new(path)
        }
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        configure_connection(&conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS emails (
                message_id TEXT PRIMARY KEY,
                in_reply_to TEXT,
                thread_root TEXT NOT NULL,
                subject TEXT NOT NULL,
                sender TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                date_time TEXT NOT NULL,
                location TEXT NOT NULL,
                organizer TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                source_received_at TEXT NOT NULL,
                source_message_id TEXT NOT NULL,
                thread_root TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_thread_root ON events(thread_root);",
        )
        .map_err(|e| Error::operation("create_schema", e))
    }

    /// Runs `op` against the connection and records its metrics.
    fn with_conn<T>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = {
            let conn = acquire_lock(&self.conn);
            op(&conn).map_err(|e| Error::operation(operation, e))
        };
        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics(operation, start, status);
        result
    }
}

fn to_sql_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn time_from_row(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    let duration: i64 = row.get(5)?;
    Ok(StoredEvent {
        id: EventId::new(row.get(0)?),
        title: row.get(1)?,
        date_time: time_from_row(row, 2)?,
        location: row.get(3)?,
        organizer: row.get(4)?,
        duration_minutes: u32::try_from(duration)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(5, duration))?,
        source_received_at: time_from_row(row, 6)?,
        source_message_id: MessageId::new(row.get::<_, String>(7)?),
        thread_root: MessageId::new(row.get::<_, String>(8)?),
    })
}

fn email_from_row(row: &Row<'_>) -> rusqlite::Result<StoredEmail> {
    Ok(StoredEmail {
        message_id: MessageId::new(row.get::<_, String>(0)?),
        in_reply_to: row.get::<_, Option<String>>(1)?.map(MessageId::new),
        thread_root: MessageId::new(row.get::<_, String>(2)?),
        subject: row.get(3)?,
        sender: row.get(4)?,
        received_at: time_from_row(row, 5)?,
    })
}

#[async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(skip(self), fields(backend = "sqlite", message_id = %message_id))]
    async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Option<StoredEmail>> {
        self.with_conn("find_by_message_id", |conn| {
            conn.query_row(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE message_id = ?1"),
                params![message_id.as_str()],
                email_from_row,
            )
            .optional()
        })
    }

    #[instrument(skip(self), fields(backend = "sqlite", thread_root = %root))]
    async fn find_events_by_root(&self, root: &MessageId) -> Result<Vec<StoredEvent>> {
        self.with_conn("find_events_by_root", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE thread_root = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![root.as_str()], event_from_row)?;
            rows.collect()
        })
    }

    #[instrument(skip(self, email), fields(backend = "sqlite", message_id = %email.message_id))]
    async fn insert_email(&self, email: &StoredEmail) -> Result<()> {
        self.with_conn("insert_email", |conn| {
            conn.execute(
                "INSERT INTO emails (message_id, in_reply_to, thread_root, subject, sender, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    email.message_id.as_str(),
                    email.in_reply_to.as_ref().map(MessageId::as_str),
                    email.thread_root.as_str(),
                    email.subject,
                    email.sender,
                    to_sql_time(&email.received_at),
                ],
            )
            .map(|_| ())
        })
    }

    #[instrument(skip(self), fields(backend = "sqlite", event_id = %id))]
    async fn get_event(&self, id: EventId) -> Result<Option<StoredEvent>> {
        self.with_conn("get_event", |conn| {
            conn.query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.get()],
                event_from_row,
            )
            .optional()
        })
    }

    #[instrument(skip(self, event), fields(backend = "sqlite", title = %event.title))]
    async fn create_event(&self, event: NewEvent) -> Result<StoredEvent> {
        let id = self.with_conn("create_event", |conn| {
            conn.execute(
                "INSERT INTO events (title, date_time, location, organizer, duration_minutes,
                                     source_received_at, source_message_id, thread_root)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.title,
                    to_sql_time(&event.date_time),
                    event.location,
                    event.organizer,
                    i64::from(event.duration_minutes),
                    to_sql_time(&event.source_received_at),
                    event.source_message_id.as_str(),
                    event.thread_root.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(event.with_id(EventId::new(id)))
    }

    #[instrument(skip(self, event), fields(backend = "sqlite", event_id = %event.id))]
    async fn update_event(&self, event: &StoredEvent) -> Result<()> {
        let changed = self.with_conn("update_event", |conn| {
            conn.execute(
                "UPDATE events SET title = ?2, date_time = ?3, location = ?4, organizer = ?5,
                        duration_minutes = ?6, source_received_at = ?7, source_message_id = ?8,
                        thread_root = ?9
                 WHERE id = ?1",
                params![
                    event.id.get(),
                    event.title,
                    to_sql_time(&event.date_time),
                    event.location,
                    event.organizer,
                    i64::from(event.duration_minutes),
                    to_sql_time(&event.source_received_at),
                    event.source_message_id.as_str(),
                    event.thread_root.as_str(),
                ],
            )
        })?;
        if changed == 0 {
            return Err(Error::operation(
                "update_event",
                format!("event {} not found", event.id),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "sqlite", event_id = %id))]
    async fn delete_event(&self, id: EventId) -> Result<bool> {
        let deleted = self.with_conn("delete_event", |conn| {
            conn.execute("DELETE FROM events WHERE id = ?1", params![id.get()])
        })?;
        Ok(deleted > 0)
    }
}
