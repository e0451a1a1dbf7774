use anyhow::Context;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod catalog;
mod crafting;
pub mod efficiency;
mod error;
pub mod events;
pub mod queue;
pub mod refund;
pub mod scheduler;
pub mod store;

pub use catalog::BlueprintCatalog;
pub use crafting::{
    CancelOutcome, LearnOutcome, NewNode, RunOutcome, StartOutcome, SweepReport,
};
pub use error::{CraftError, CraftResult, RuleViolation};
pub use events::{CollectingSink, EventSink, NullSink};
pub use scheduler::{DueIndex, NoopScheduler, RecordingScheduler, Scheduler};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn now_ms() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    nanos.try_into().unwrap_or(i64::MAX)
}

fn new_id(prefix: &str, ts: i64) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts}-{c}")
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_ms()
    }
}

/// Clock driven by hand, for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct Engine {
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    events: Arc<dyn EventSink>,
    catalog: BlueprintCatalog,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("db_path", &self.db_path)
            .field("catalog_ttl_ms", &self.catalog.ttl_ms())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(NoopScheduler),
            events: Arc::new(NullSink),
            catalog: BlueprintCatalog::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_catalog_ttl(mut self, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.catalog = BlueprintCatalog::new(ttl_ms);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn catalog(&self) -> &BlueprintCatalog {
        &self.catalog
    }

    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // Durable + fast defaults.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Push timer, sweep and requests all write; wait for the lock instead of failing.
        conn.busy_timeout(Duration::from_secs(5))?;

        migrate(&conn)?;
        Ok(conn)
    }

    /// Open a connection and take the write lock up front, so the
    /// read-modify-write of a node runs as one unit.
    pub(crate) fn write_tx<T, E>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<anyhow::Error> + From<rusqlite::Error>,
    {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn get_rev(&self) -> anyhow::Result<i64> {
        let conn = self.open()?;
        let rev: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM event_log", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }

    pub fn events_since(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<hexforge_protocol::LoggedEvent>> {
        let conn = self.open()?;
        events::events_since(&conn, after_seq, limit)
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    // Lightweight migrations. We use `user_version` + IF NOT EXISTS + best-effort ALTERs,
    // because the schema is still young and we want installs to be resilient.
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
-- Monotonic revision source for broadcast consumers.
CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  node_id TEXT,
  session_id TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts_ms);
CREATE INDEX IF NOT EXISTS idx_event_log_session ON event_log(session_id);

-- Storage and queue are one consistency unit; queue_version is bumped on every write.
CREATE TABLE IF NOT EXISTS nodes (
  id TEXT PRIMARY KEY,
  node_type TEXT NOT NULL,
  tier INTEGER NOT NULL DEFAULT 0,
  owner_player_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  installed_core_id TEXT,
  storage_json TEXT NOT NULL DEFAULT '{}',
  queue_json TEXT NOT NULL DEFAULT '[]',
  queue_version INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS node_kinds (
  node_type TEXT PRIMARY KEY,
  requires_core INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS production_cores (
  id TEXT PRIMARY KEY,
  efficiency REAL NOT NULL DEFAULT 1.0
);

CREATE TABLE IF NOT EXISTS blueprints (
  id TEXT PRIMARY KEY,
  inputs_json TEXT NOT NULL DEFAULT '[]',
  outputs_json TEXT NOT NULL DEFAULT '[]',
  craft_time_seconds REAL NOT NULL,
  node_types_json TEXT NOT NULL DEFAULT '[]',
  node_tier_required INTEGER NOT NULL DEFAULT 0,
  learned INTEGER NOT NULL DEFAULT 0,
  unlock_item_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_blueprints_tier ON blueprints(node_tier_required);
CREATE INDEX IF NOT EXISTS idx_blueprints_unlock ON blueprints(unlock_item_id);

CREATE TABLE IF NOT EXISTS learned_blueprints (
  player_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  blueprint_id TEXT NOT NULL,
  learned_at_ms INTEGER NOT NULL,
  PRIMARY KEY (player_id, session_id, blueprint_id)
);

-- Pull-path completion index: one row per node with an active item.
CREATE TABLE IF NOT EXISTS craft_due (
  node_id TEXT PRIMARY KEY,
  due_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_craft_due_at ON craft_due(due_at_ms);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    // Best-effort column additions for existing DBs.
    ensure_column(conn, "nodes", "queue_version", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, "blueprints", "unlock_item_id", "TEXT")?;

    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, col: &str, decl: &str) -> anyhow::Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {col} {decl}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(e) => {
            // Ignore "duplicate column name".
            if e.to_string().to_lowercase().contains("duplicate column") {
                return Ok(());
            }
            Err(e).with_context(|| format!("ensure column {table}.{col}"))
        }
    }
}
