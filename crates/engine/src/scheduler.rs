//! Completion delivery.
//!
//! Two independent paths fire the run-completion handler for a node:
//!
//! - push: a one-shot [`Scheduler`] registration per node, replaced whenever
//!   the head item or its `completes_at` changes;
//! - pull: the durable `craft_due` index (score = `completes_at`), scanned by
//!   a periodic sweep.
//!
//! Both may fire for the same run. The handler re-reads the queue inside its
//! own transaction and does nothing when the head is not yet due, so delivery
//! is at-least-once while the effect is applied once.

use rusqlite::Connection;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Push-path registration keyed by node id.
pub trait Scheduler: Send + Sync {
    /// Fire the completion handler for `node_id` at `fires_at_ms`, replacing
    /// any earlier registration for the node.
    fn schedule_once(&self, node_id: &str, fires_at_ms: i64);

    /// Drop the registration for `node_id`, if any.
    fn cancel(&self, node_id: &str);
}

/// Push path disabled; the sweep alone delivers completions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn schedule_once(&self, _node_id: &str, _fires_at_ms: i64) {}
    fn cancel(&self, _node_id: &str) {}
}

/// Keeps the latest registration per node in memory.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    registrations: Mutex<BTreeMap<String, i64>>,
}

impl RecordingScheduler {
    pub fn registration(&self, node_id: &str) -> Option<i64> {
        self.lock().get(node_id).copied()
    }

    pub fn registrations(&self) -> BTreeMap<String, i64> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, i64>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule_once(&self, node_id: &str, fires_at_ms: i64) {
        self.lock().insert(node_id.to_string(), fires_at_ms);
    }

    fn cancel(&self, node_id: &str) {
        self.lock().remove(node_id);
    }
}

/// Pull-path index. All writes happen inside the caller's transaction so the
/// index never disagrees with the committed queue.
pub struct DueIndex;

impl DueIndex {
    pub fn insert(conn: &Connection, node_id: &str, due_at_ms: i64) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO craft_due (node_id, due_at_ms) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET due_at_ms = excluded.due_at_ms",
            (node_id, due_at_ms),
        )?;
        Ok(())
    }

    pub fn remove(conn: &Connection, node_id: &str) -> anyhow::Result<()> {
        conn.execute("DELETE FROM craft_due WHERE node_id = ?1", [node_id])?;
        Ok(())
    }

    pub fn get(conn: &Connection, node_id: &str) -> anyhow::Result<Option<i64>> {
        use rusqlite::OptionalExtension;
        Ok(conn
            .query_row(
                "SELECT due_at_ms FROM craft_due WHERE node_id = ?1",
                [node_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Nodes whose score is `<= now_ms`, earliest first, at most `limit`.
    pub fn due(conn: &Connection, now_ms: i64, limit: usize) -> anyhow::Result<Vec<(String, i64)>> {
        let mut stmt = conn.prepare(
            "SELECT node_id, due_at_ms FROM craft_due WHERE due_at_ms <= ?1
             ORDER BY due_at_ms ASC, node_id ASC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map((now_ms, limit), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn all(conn: &Connection) -> anyhow::Result<Vec<(String, i64)>> {
        let mut stmt =
            conn.prepare("SELECT node_id, due_at_ms FROM craft_due ORDER BY due_at_ms ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
