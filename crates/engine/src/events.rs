use hexforge_protocol::{CraftEvent, LoggedEvent};
use rusqlite::{Connection, Transaction};
use std::sync::Mutex;

/// Receives events after the transaction that produced them has committed.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &CraftEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &CraftEvent) {}
}

#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<CraftEvent>>,
}

impl CollectingSink {
    pub fn take(&self) -> Vec<CraftEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: &CraftEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
    }
}

pub(crate) fn append_event_tx(
    tx: &Transaction<'_>,
    ts_ms: i64,
    event: &CraftEvent,
) -> anyhow::Result<i64> {
    let payload_json = serde_json::to_string(event)?;
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, node_id, session_id, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (
            ts_ms,
            event.kind(),
            event.node_id(),
            event.session_id(),
            payload_json,
        ),
    )?;
    Ok(tx.last_insert_rowid())
}

pub(crate) fn events_since(
    conn: &Connection,
    after_seq: i64,
    limit: usize,
) -> anyhow::Result<Vec<LoggedEvent>> {
    let mut stmt = conn.prepare(
        "SELECT seq, ts_ms, kind, node_id, session_id, payload_json FROM event_log
         WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map((after_seq, limit), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (seq, ts_ms, kind, node_id, session_id, payload_json) = row?;
        out.push(LoggedEvent {
            seq,
            ts_ms,
            kind,
            node_id,
            session_id,
            payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        });
    }
    Ok(out)
}
