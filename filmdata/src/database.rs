//! SQLite persistence for the crawl
//!
//! Two tables: a singleton `crawl_cursor` row holding the year the back-fill
//! has reached, and `tasks`, a durable at-least-once queue of crawl tasks.
//! Uses r2d2 connection pooling so the API, the worker and the CLI can share it.

use crate::crawler::CrawlTask;
use parking_lot::Mutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Task payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Durable "current year" state of the year scheduler
pub trait CursorStore: Send + Sync {
    fn read(&self) -> DatabaseResult<Option<i32>>;
    fn write(&self, year: i32) -> DatabaseResult<()>;
    fn clear(&self) -> DatabaseResult<()>;
}

/// At-least-once task delivery
pub trait TaskDispatcher: Send + Sync {
    fn enqueue(&self, task: &CrawlTask) -> DatabaseResult<()>;
}

/// A task handed to a worker, exclusively until its lease runs out
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub id: i64,
    pub task: CrawlTask,
    /// Failed attempts before this delivery
    pub attempts: u32,
}

/// Thread-safe database wrapper using connection pooling
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open or create a database at the given path with connection pooling
    pub fn open<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| {
                conn.execute_batch("
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                ")?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (tests, one-shot CLI runs)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let manager = SqliteConnectionManager::memory();

        // In-memory needs single connection to maintain state
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        Ok(db)
    }

    /// Get a connection from the pool
    fn get_conn(&self) -> DatabaseResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn setup_schema(&self) -> DatabaseResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS crawl_cursor (
                singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
                currentYear INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                notBefore INTEGER NOT NULL,
                leaseExpires INTEGER,
                createdAt INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(notBefore, id);
        "#)?;

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue `task`, runnable from `not_before_ms` on
    pub fn enqueue_at(&self, task: &CrawlTask, not_before_ms: i64) -> DatabaseResult<i64> {
        let payload = serde_json::to_string(task)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO tasks (target, payload, notBefore, createdAt) VALUES (?1, ?2, ?3, ?4)",
            params![task.target(), payload, not_before_ms, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Lease the oldest due task.
    ///
    /// A task is due when its `notBefore` has passed and it is not leased, or
    /// its lease expired (the worker holding it died). Rows whose payload no
    /// longer decodes are dropped with a warning.
    pub fn claim_next(&self, now_ms: i64, lease: Duration) -> DatabaseResult<Option<LeasedTask>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let lease_expires = now_ms + lease.as_millis() as i64;

        let claimed = loop {
            let row: Option<(i64, String, u32)> = tx
                .query_row(
                    r#"SELECT id, payload, attempts FROM tasks
                       WHERE notBefore <= ?1 AND (leaseExpires IS NULL OR leaseExpires <= ?1)
                       ORDER BY notBefore ASC, id ASC
                       LIMIT 1"#,
                    [now_ms],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((id, payload, attempts)) = row else {
                break None;
            };

            match serde_json::from_str::<CrawlTask>(&payload) {
                Ok(task) => {
                    tx.execute(
                        "UPDATE tasks SET leaseExpires = ?1 WHERE id = ?2",
                        params![lease_expires, id],
                    )?;
                    break Some(LeasedTask { id, task, attempts });
                }
                Err(e) => {
                    tracing::warn!(task_id = id, error = %e, "Dropping undecodable task");
                    tx.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
                }
            }
        };

        tx.commit()?;
        Ok(claimed)
    }

    /// Remove a finished task
    pub fn complete(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Release a failed task for redelivery after `backoff`
    pub fn fail(&self, id: i64, now_ms: i64, backoff: Duration) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"UPDATE tasks
               SET attempts = attempts + 1, leaseExpires = NULL, notBefore = ?1
               WHERE id = ?2"#,
            params![now_ms + backoff.as_millis() as i64, id],
        )?;
        Ok(())
    }

    /// Tasks waiting or in flight
    pub fn pending_count(&self) -> DatabaseResult<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Targets of all queued tasks in delivery order
    pub fn pending_targets(&self) -> DatabaseResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT target FROM tasks ORDER BY notBefore ASC, id ASC")?;
        let targets = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(targets)
    }
}

impl CursorStore for Database {
    fn read(&self) -> DatabaseResult<Option<i32>> {
        let conn = self.get_conn()?;
        let year = conn
            .query_row("SELECT currentYear FROM crawl_cursor WHERE singleton = 1", [], |row| row.get(0))
            .optional()?;
        Ok(year)
    }

    fn write(&self, year: i32) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO crawl_cursor (singleton, currentYear) VALUES (1, ?1)
               ON CONFLICT(singleton) DO UPDATE SET currentYear = excluded.currentYear"#,
            [year],
        )?;
        Ok(())
    }

    fn clear(&self) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM crawl_cursor", [])?;
        Ok(())
    }
}

impl TaskDispatcher for Database {
    fn enqueue(&self, task: &CrawlTask) -> DatabaseResult<()> {
        self.enqueue_at(task, now_ms())?;
        Ok(())
    }
}

/// Cursor store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    year: Mutex<Option<i32>>,
}

impl MemoryCursorStore {
    pub fn with_year(year: i32) -> Self {
        Self { year: Mutex::new(Some(year)) }
    }
}

impl CursorStore for MemoryCursorStore {
    fn read(&self) -> DatabaseResult<Option<i32>> {
        Ok(*self.year.lock())
    }

    fn write(&self, year: i32) -> DatabaseResult<()> {
        *self.year.lock() = Some(year);
        Ok(())
    }

    fn clear(&self) -> DatabaseResult<()> {
        *self.year.lock() = None;
        Ok(())
    }
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
