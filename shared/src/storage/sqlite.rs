//! SQLite backend. One encrypted row per record; moves between the queue and
//! the dead-letter table run in a single transaction.
//!
//! A database file that fails its integrity check at open is renamed to
//! `<name>.corrupt-<ms>`, a fresh database takes its place, and the old file
//! is recorded in the quarantine table.
//!
//! Calls block on SQLite I/O and are offloaded with `spawn_blocking`. The
//! connection mutex is never held across an await point.

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

use super::{
    decode_cbor, encode_cbor, LoadedState, QuarantinedRecord, QueueStorage, StorageError,
    CURRENT_SCHEMA_VERSION,
};
use crate::crypto::{CryptoProvider, StoreContext};
use crate::dead_letter::DeadLetterRecord;
use crate::model::{ItemId, MutationItem, UnixTimeMs};

const SCHEMA_SQL: &str = "
    PRAGMA synchronous = FULL;
    CREATE TABLE IF NOT EXISTS queue_items (
        id TEXT PRIMARY KEY NOT NULL,
        idempotency_key TEXT NOT NULL,
        priority TEXT NOT NULL,
        state TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        data BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_queue_items_key ON queue_items(idempotency_key);
    CREATE TABLE IF NOT EXISTS dead_letters (
        id TEXT PRIMARY KEY NOT NULL,
        entity_type TEXT NOT NULL,
        dead_at INTEGER NOT NULL,
        data BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS quarantine (
        key TEXT NOT NULL,
        reason TEXT NOT NULL,
        at INTEGER NOT NULL,
        data BLOB NOT NULL
    );
";

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

struct SqliteInner {
    conn: Mutex<Connection>,
    crypto: Arc<dyn CryptoProvider>,
    ctx: StoreContext,
}

#[derive(Clone)]
pub struct SqliteStorage {
    inner: Arc<SqliteInner>,
}

impl SqliteStorage {
    pub fn open(
        path: impl AsRef<Path>,
        crypto: Arc<dyn CryptoProvider>,
        ctx: StoreContext,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let Some(problem) = integrity_problem(&conn)? else {
            return Self::with_connection(conn, crypto, ctx);
        };
        drop(conn);

        let now = UnixTimeMs::now();
        let aside = move_aside(path, now)?;
        error!(problem = %problem, moved_to = %aside.display(), "queue database unreadable, starting empty");

        let storage = Self::with_connection(Connection::open(path)?, crypto, ctx)?;
        storage.inner.lock()?.execute(
            "INSERT INTO quarantine (key, reason, at, data) VALUES (?1, ?2, ?3, ?4)",
            params![aside.display().to_string(), problem, now.0 as i64, Vec::<u8>::new()],
        )?;
        Ok(storage)
    }

    pub fn in_memory(crypto: Arc<dyn CryptoProvider>, ctx: StoreContext) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, crypto, ctx)
    }

    fn with_connection(
        conn: Connection,
        crypto: Arc<dyn CryptoProvider>,
        ctx: StoreContext,
    ) -> Result<Self, StorageError> {
        let found: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if found > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::FutureSchema {
                found,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        conn.execute_batch(SCHEMA_SQL)?;
        if found < CURRENT_SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
            info!(from = found, to = CURRENT_SCHEMA_VERSION, "queue database schema initialised");
        }

        Ok(Self {
            inner: Arc::new(SqliteInner {
                conn: Mutex::new(conn),
                crypto,
                ctx,
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteInner) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl SqliteInner {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Rows are bound to their table and id, so a row copied elsewhere will
    /// not decrypt.
    fn aad(&self, table: &str, id: &str) -> Result<Vec<u8>, StorageError> {
        Ok(self
            .ctx
            .aad(&format!("{table}/{id}"), CURRENT_SCHEMA_VERSION)?)
    }

    fn seal<T: serde::Serialize>(&self, table: &str, id: &ItemId, value: &T) -> Result<Vec<u8>, StorageError> {
        let plain = encode_cbor(value)?;
        Ok(self.crypto.encrypt(&plain, &self.aad(table, id.as_str())?)?)
    }

    fn open<T: serde::de::DeserializeOwned>(&self, table: &str, id: &str, data: &[u8]) -> Result<T, StorageError> {
        let plain = self.crypto.decrypt(data, &self.aad(table, id)?)?;
        decode_cbor(&plain)
    }

    fn upsert_item(&self, tx: &Transaction<'_>, item: &MutationItem) -> Result<(), StorageError> {
        let data = self.seal("queue_items", &item.id, item)?;
        tx.execute(
            "INSERT INTO queue_items (id, idempotency_key, priority, state, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                idempotency_key = excluded.idempotency_key,
                priority = excluded.priority,
                state = excluded.state,
                data = excluded.data",
            params![
                item.id.as_str(),
                item.idempotency_key.as_str(),
                item.priority.as_str(),
                item.state.name(),
                item.created_at.0 as i64,
                data
            ],
        )?;
        Ok(())
    }

    fn load(&self) -> Result<LoadedState, StorageError> {
        let now = UnixTimeMs::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut loaded = LoadedState::default();
        let mut bad: Vec<(&'static str, QuarantinedRecord)> = Vec::new();

        {
            let mut stmt = tx.prepare("SELECT id, data FROM queue_items ORDER BY created_at, id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (id, data) in rows {
                match self.open::<MutationItem>("queue_items", &id, &data) {
                    Ok(item) => loaded.items.push(item),
                    Err(e) => bad.push(("queue_items", quarantined(id, &e, data, now))),
                }
            }
        }
        {
            let mut stmt = tx.prepare("SELECT id, data FROM dead_letters ORDER BY dead_at, id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (id, data) in rows {
                match self.open::<DeadLetterRecord>("dead_letters", &id, &data) {
                    Ok(record) => loaded.dead_letters.push(record),
                    Err(e) => bad.push(("dead_letters", quarantined(id, &e, data, now))),
                }
            }
        }

        for (table, record) in &bad {
            tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![record.key])?;
            tx.execute(
                "INSERT INTO quarantine (key, reason, at, data) VALUES (?1, ?2, ?3, ?4)",
                params![record.key, record.reason, record.at.0 as i64, record.raw],
            )?;
        }

        {
            let mut stmt = tx.prepare("SELECT key, reason, at, data FROM quarantine ORDER BY at")?;
            loaded.quarantined = stmt
                .query_map([], |row| {
                    Ok(QuarantinedRecord {
                        key: row.get(0)?,
                        reason: row.get(1)?,
                        at: UnixTimeMs(row.get::<_, i64>(2)? as u64),
                        raw: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }
        tx.commit()?;

        info!(
            items = loaded.items.len(),
            dead_letters = loaded.dead_letters.len(),
            quarantined = loaded.quarantined.len(),
            "queue database loaded"
        );
        Ok(loaded)
    }
}

fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

/// `None` when the file reads back cleanly. Other errors, such as a locked
/// database, are not corruption and are returned as-is.
fn integrity_problem(conn: &Connection) -> Result<Option<String>, StorageError> {
    match conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0)) {
        Ok(verdict) if verdict == "ok" => Ok(None),
        Ok(verdict) => Ok(Some(verdict)),
        Err(e) if is_corruption(&e) => Ok(Some(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Renames the database and any journal files next to it.
fn move_aside(path: &Path, now: UnixTimeMs) -> Result<PathBuf, StorageError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "queue.db".to_string());
    let aside = path.with_file_name(format!("{name}.corrupt-{}", now.0));
    std::fs::rename(path, &aside)?;

    for suffix in ["-journal", "-wal", "-shm"] {
        let companion = path.with_file_name(format!("{name}{suffix}"));
        match std::fs::rename(&companion, aside.with_file_name(format!("{name}.corrupt-{}{suffix}", now.0))) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(aside)
}

fn quarantined(key: String, err: &StorageError, raw: Vec<u8>, now: UnixTimeMs) -> QuarantinedRecord {
    warn!(key = %key, error = %err, "quarantining unreadable row");
    QuarantinedRecord {
        key,
        reason: err.to_string(),
        at: now,
        raw,
    }
}

#[async_trait]
impl QueueStorage for SqliteStorage {
    async fn load_all(&self) -> Result<LoadedState, StorageError> {
        self.blocking(|inner| inner.load()).await
    }

    async fn append(&self, item: &MutationItem) -> Result<(), StorageError> {
        let item = item.clone();
        self.blocking(move |inner| {
            let mut conn = inner.lock()?;
            let tx = conn.transaction()?;
            inner.upsert_item(&tx, &item)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update(&self, item: &MutationItem) -> Result<(), StorageError> {
        let item = item.clone();
        self.blocking(move |inner| {
            let mut conn = inner.lock()?;
            let tx = conn.transaction()?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM queue_items WHERE id = ?1",
                    params![item.id.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Err(StorageError::NotFound(item.id));
            }
            inner.upsert_item(&tx, &item)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: &ItemId) -> Result<(), StorageError> {
        let id = id.clone();
        self.blocking(move |inner| {
            inner
                .lock()?
                .execute("DELETE FROM queue_items WHERE id = ?1", params![id.as_str()])?;
            Ok(())
        })
        .await
    }

    async fn store_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.blocking(move |inner| {
            let data = inner.seal("dead_letters", &record.item.id, &record)?;
            let mut conn = inner.lock()?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM queue_items WHERE id = ?1",
                params![record.item.id.as_str()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO dead_letters (id, entity_type, dead_at, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.item.id.as_str(),
                    record.item.entity_type,
                    record.dead_at.0 as i64,
                    data
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn requeue_dead_letter(&self, item: &MutationItem) -> Result<(), StorageError> {
        let item = item.clone();
        self.blocking(move |inner| {
            let mut conn = inner.lock()?;
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM dead_letters WHERE id = ?1",
                params![item.id.as_str()],
            )?;
            if removed == 0 {
                return Err(StorageError::NotFound(item.id));
            }
            inner.upsert_item(&tx, &item)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_dead_letters(&self, ids: &[ItemId]) -> Result<(), StorageError> {
        let ids = ids.to_vec();
        self.blocking(move |inner| {
            let mut conn = inner.lock()?;
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute("DELETE FROM dead_letters WHERE id = ?1", params![id.as_str()])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn persist_snapshot(&self) -> Result<(), StorageError> {
        // Every call above commits on its own.
        Ok(())
    }
}
