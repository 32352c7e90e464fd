//! SQLite backend shared by every process of a fleet.

use crate::backend::{LockBackend, QueueBackend};
use crate::error::{BackendError, BackendResult};
use crate::types::{ItemState, LockRow, QueueItem, QueueStats};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queues (
    name TEXT PRIMARY KEY,
    created_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS queue_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    queue_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL,
    visible_from_ms INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_items_lease
    ON queue_items (queue_name, state, visible_from_ms);
CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    holder_id TEXT NOT NULL,
    acquired_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
";

const ITEM_COLUMNS: &str =
    "id, queue_name, payload, state, visible_from_ms, attempts, created_at_ms, updated_at_ms";

/// A queue and lock store backed by one SQLite database file.
///
/// Several processes may open the same file. Leases are taken inside
/// `BEGIN IMMEDIATE` transactions and lock acquisition is a single upsert
/// statement, so both stay atomic across processes. Timestamps are stored as
/// Unix milliseconds.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            BackendError::Unavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> BackendResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> BackendResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> BackendResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| BackendError::Corrupted(format!("timestamp out of range: {}", ms)))
}

/// Raw column values of a `queue_items` row.
struct ItemRow {
    id: String,
    queue_name: String,
    payload: String,
    state: String,
    visible_from_ms: i64,
    attempts: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl ItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            queue_name: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            visible_from_ms: row.get(4)?,
            attempts: row.get(5)?,
            created_at_ms: row.get(6)?,
            updated_at_ms: row.get(7)?,
        })
    }

    fn into_item(self) -> BackendResult<QueueItem> {
        let state = ItemState::parse(&self.state)
            .ok_or_else(|| BackendError::Corrupted(format!("unknown item state: {}", self.state)))?;
        Ok(QueueItem {
            id: self.id,
            queue_name: self.queue_name,
            payload: serde_json::from_str(&self.payload)?,
            state,
            visible_from: from_ms(self.visible_from_ms)?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| BackendError::Corrupted(format!("bad attempts: {}", self.attempts)))?,
            created_at: from_ms(self.created_at_ms)?,
            updated_at: from_ms(self.updated_at_ms)?,
        })
    }
}

fn lock_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

impl QueueBackend for SqliteBackend {
    fn ensure_queue(&self, queue: &str) -> BackendResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO queues (name, created_at_ms) VALUES (?1, ?2)",
            params![queue, to_ms(Utc::now())],
        )?;
        Ok(())
    }

    fn insert(&self, item: QueueItem) -> BackendResult<()> {
        let payload = serde_json::to_string(&item.payload)?;
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO queue_items
                (id, queue_name, payload, state, visible_from_ms, attempts, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.id,
                item.queue_name,
                payload,
                item.state.as_str(),
                to_ms(item.visible_from),
                item.attempts,
                to_ms(item.created_at),
                to_ms(item.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(BackendError::DuplicateId(item.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        visible_until: DateTime<Utc>,
    ) -> BackendResult<Option<QueueItem>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let selected = tx
            .query_row(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM queue_items
                     WHERE queue_name = ?1
                       AND state IN ('pending', 'inflight')
                       AND visible_from_ms <= ?2
                     ORDER BY created_at_ms, seq
                     LIMIT 1"
                ),
                params![queue, to_ms(now)],
                ItemRow::from_row,
            )
            .optional()?;

        let Some(row) = selected else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue_items
             SET state = 'inflight', visible_from_ms = ?2, attempts = attempts + 1, updated_at_ms = ?3
             WHERE id = ?1",
            params![row.id, to_ms(visible_until), to_ms(now)],
        )?;
        tx.commit()?;

        let mut item = row.into_item()?;
        item.state = ItemState::Inflight;
        item.visible_from = visible_until;
        item.attempts += 1;
        item.updated_at = now;
        Ok(Some(item))
    }

    fn complete(
        &self,
        queue: &str,
        id: &str,
        state: ItemState,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE queue_items SET state = ?3, updated_at_ms = ?4
             WHERE queue_name = ?1 AND id = ?2 AND state IN ('pending', 'inflight')",
            params![queue, id, state.as_str(), to_ms(now)],
        )?;
        Ok(changed > 0)
    }

    fn prune(&self, queue: &str, older_than: DateTime<Utc>) -> BackendResult<u64> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM queue_items
             WHERE queue_name = ?1 AND state IN ('done', 'failed') AND updated_at_ms < ?2",
            params![queue, to_ms(older_than)],
        )?;
        Ok(removed as u64)
    }

    fn item(&self, queue: &str, id: &str) -> BackendResult<Option<QueueItem>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE queue_name = ?1 AND id = ?2"),
                params![queue, id],
                ItemRow::from_row,
            )
            .optional()?;
        row.map(ItemRow::into_item).transpose()
    }

    fn stats(&self, queue: &str) -> BackendResult<QueueStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM queue_items WHERE queue_name = ?1 GROUP BY state",
        )?;
        let rows = stmt.query_map(params![queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (state, count) = row?;
            let count = count.max(0) as u64;
            match ItemState::parse(&state) {
                Some(ItemState::Pending) => stats.pending = count,
                Some(ItemState::Inflight) => stats.inflight = count,
                Some(ItemState::Done) => stats.done = count,
                Some(ItemState::Failed) => stats.failed = count,
                None => {
                    return Err(BackendError::Corrupted(format!(
                        "unknown item state: {}",
                        state
                    )))
                }
            }
        }
        Ok(stats)
    }

    fn queue_names(&self) -> BackendResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM queues ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

impl LockBackend for SqliteBackend {
    fn try_acquire(&self, row: &LockRow, now: DateTime<Utc>) -> BackendResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO locks (name, holder_id, acquired_at_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (name) DO UPDATE SET
                holder_id = excluded.holder_id,
                acquired_at_ms = excluded.acquired_at_ms,
                expires_at_ms = excluded.expires_at_ms
             WHERE locks.expires_at_ms <= ?5",
            params![
                row.name,
                row.holder_id,
                to_ms(row.acquired_at),
                to_ms(row.expires_at),
                to_ms(now),
            ],
        )?;
        Ok(changed > 0)
    }

    fn extend(
        &self,
        name: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE locks SET expires_at_ms = ?3
             WHERE name = ?1 AND holder_id = ?2 AND expires_at_ms > ?4",
            params![name, holder_id, to_ms(expires_at), to_ms(now)],
        )?;
        Ok(changed > 0)
    }

    fn release(&self, name: &str, holder_id: &str) -> BackendResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND holder_id = ?2",
            params![name, holder_id],
        )?;
        Ok(removed > 0)
    }

    fn force_release(&self, name: &str) -> BackendResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM locks WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    fn lock_row(&self, name: &str) -> BackendResult<Option<LockRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, holder_id, acquired_at_ms, expires_at_ms FROM locks WHERE name = ?1",
                params![name],
                lock_from_row,
            )
            .optional()?;

        row.map(|(name, holder_id, acquired_at_ms, expires_at_ms)| {
            Ok(LockRow {
                name,
                holder_id,
                acquired_at: from_ms(acquired_at_ms)?,
                expires_at: from_ms(expires_at_ms)?,
            })
        })
        .transpose()
    }
}
