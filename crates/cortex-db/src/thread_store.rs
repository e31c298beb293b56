use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortex_common::{Error, Message, Mime, Result, Role};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::info;

/// Persisted message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub thread: String,
    pub role: Role,
    pub user: Option<String>,
    pub tool_name: Option<String>,
    pub tool_id: Option<String>,
    pub mime: Mime,
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Rebuild the portable message for the engine.
    pub fn into_message(self) -> Message {
        Message {
            role: self.role,
            user: self.user,
            tool_name: self.tool_name,
            tool_id: self.tool_id,
            content: cortex_common::Content {
                data: self.content,
                mime: self.mime,
            },
        }
    }
}

/// Aggregate row for the thread listing.
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub thread: String,
    pub messages: i64,
    pub updated_at: DateTime<Utc>,
}

/// Narrow archive contract the engine depends on. Any store with per-call
/// atomicity satisfies it.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Write all messages in one transaction; either every message lands or
    /// none do.
    async fn append(&self, thread: &str, messages: &[Message]) -> Result<()>;

    /// Most recent `limit` messages, newest first.
    async fn recent(&self, thread: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

/// SQLite-backed archive, indexed by thread and user.
pub struct SqliteThreadStore {
    conn: Mutex<Connection>,
}

impl SqliteThreadStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening thread store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Store(format!("failed to open database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Store(format!("failed to set pragmas: {e}")))?;

        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("failed to open in-memory database: {e}")))?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All threads with message counts, most recently touched first.
    pub async fn threads(&self) -> Result<Vec<ThreadSummary>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT thread, COUNT(*), MAX(updated_at) FROM messages
                 GROUP BY thread ORDER BY MAX(id) DESC",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| Error::Store(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (thread, messages, updated_at) = row.map_err(|e| Error::Store(e.to_string()))?;
            out.push(ThreadSummary {
                thread,
                messages,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(out)
    }

    /// One page of a thread in insertion order.
    pub async fn thread_page(
        &self,
        thread: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, thread, role, user, tool_name, tool_id, mime, content, created_at, updated_at
                 FROM messages WHERE thread = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![thread, limit as i64, offset as i64], row_to_stored)
            .map_err(|e| Error::Store(e.to_string()))?;
        collect_rows(rows)
    }

    pub async fn delete_message(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ThreadStore for SqliteThreadStore {
    async fn append(&self, thread: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Store(format!("begin transaction: {e}")))?;
        let now = Utc::now().to_rfc3339();
        for msg in messages {
            tx.execute(
                "INSERT INTO messages (thread, role, user, tool_name, tool_id, mime, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    thread,
                    msg.role.as_str(),
                    msg.user,
                    msg.tool_name,
                    msg.tool_id,
                    msg.content.mime.as_str(),
                    msg.content.data,
                    now,
                ],
            )
            .map_err(|e| Error::Store(format!("insert message: {e}")))?;
        }
        tx.commit()
            .map_err(|e| Error::Store(format!("commit transaction: {e}")))
    }

    async fn recent(&self, thread: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, thread, role, user, tool_name, tool_id, mime, content, created_at, updated_at
                 FROM messages WHERE thread = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![thread, limit as i64], row_to_stored)
            .map_err(|e| Error::Store(e.to_string()))?;
        collect_rows(rows)
    }
}

type RawRow = (
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Vec<u8>,
    String,
    String,
);

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<RawRow>>,
) -> Result<Vec<StoredMessage>> {
    let mut out = Vec::new();
    for row in rows {
        let (id, thread, role, user, tool_name, tool_id, mime, content, created_at, updated_at) =
            row.map_err(|e| Error::Store(e.to_string()))?;
        out.push(StoredMessage {
            id,
            thread,
            role: Role::from_str(&role).map_err(|e| Error::Store(e.to_string()))?,
            user,
            tool_name,
            tool_id,
            mime: Mime::from_str(&mime).map_err(|e| Error::Store(e.to_string()))?,
            content,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        });
    }
    Ok(out)
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread TEXT NOT NULL,
            role TEXT NOT NULL,
            user TEXT,
            tool_name TEXT,
            tool_id TEXT,
            mime TEXT NOT NULL DEFAULT 'text/plain',
            content BLOB NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread);
        CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user);",
    )
    .map_err(|e| Error::Store(format!("failed to run migrations: {e}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp {value:?}: {e}")))
}
