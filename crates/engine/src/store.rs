//! Typed records over the SQLite tables.
//!
//! Storage and queue columns hold JSON, decoded here into strongly typed
//! values. Queue blobs carry a schema version; bare arrays written by older
//! builds are accepted and normalised.

use anyhow::Context;
use hexforge_protocol::{Blueprint, CraftingQueueItem, ItemStack, ItemStorage};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::queue::reconstruct_time_per_run;

pub const QUEUE_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub node_type: String,
    pub tier: u32,
    pub owner_player_id: String,
    pub session_id: String,
    pub installed_core_id: Option<String>,
    pub storage: ItemStorage,
    pub queue: Vec<CraftingQueueItem>,
    pub queue_version: i64,
}

#[derive(Serialize, Deserialize)]
struct QueueEnvelope {
    v: u32,
    items: Vec<CraftingQueueItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyQueueItem {
    id: String,
    #[serde(alias = "blueprint_id")]
    blueprint_id: String,
    #[serde(default, alias = "output_item_id")]
    output_item_id: String,
    quantity: u32,
    #[serde(default, alias = "completed_runs")]
    completed_runs: Option<u32>,
    #[serde(default, alias = "time_per_run")]
    time_per_run: Option<i64>,
    #[serde(alias = "started_at")]
    started_at: i64,
    #[serde(alias = "completes_at")]
    completes_at: i64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredQueue {
    Current(QueueEnvelope),
    Legacy(Vec<LegacyQueueItem>),
}

impl From<LegacyQueueItem> for CraftingQueueItem {
    fn from(old: LegacyQueueItem) -> Self {
        let completed_runs = old.completed_runs.unwrap_or(0);
        let time_per_run = match old.time_per_run {
            Some(t) if t > 0 => t,
            _ => reconstruct_time_per_run(
                old.started_at,
                old.completes_at,
                old.quantity,
                completed_runs,
            ),
        };
        Self {
            id: old.id,
            blueprint_id: old.blueprint_id,
            output_item_id: old.output_item_id,
            quantity: old.quantity,
            completed_runs,
            time_per_run,
            started_at: old.started_at,
            completes_at: old.started_at.saturating_add(time_per_run),
            stalled: false,
        }
    }
}

pub fn decode_queue(json: &str) -> anyhow::Result<Vec<CraftingQueueItem>> {
    let stored: StoredQueue = serde_json::from_str(json).context("decode crafting queue")?;
    match stored {
        StoredQueue::Current(env) if env.v <= QUEUE_SCHEMA_VERSION => Ok(env.items),
        StoredQueue::Current(env) => {
            anyhow::bail!("crafting queue schema v{} is newer than supported", env.v)
        }
        StoredQueue::Legacy(items) => Ok(items.into_iter().map(Into::into).collect()),
    }
}

pub fn encode_queue(items: &[CraftingQueueItem]) -> anyhow::Result<String> {
    Ok(serde_json::to_string(&QueueEnvelope {
        v: QUEUE_SCHEMA_VERSION,
        items: items.to_vec(),
    })?)
}

pub fn decode_storage(json: &str) -> anyhow::Result<ItemStorage> {
    serde_json::from_str(json).context("decode node storage")
}

pub fn load_node(conn: &Connection, node_id: &str) -> anyhow::Result<Option<NodeRecord>> {
    let row = conn
        .query_row(
            "SELECT id, node_type, tier, owner_player_id, session_id, installed_core_id,
                    storage_json, queue_json, queue_version
             FROM nodes WHERE id = ?1",
            [node_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()?;
    let Some((id, node_type, tier, owner, session, core, storage_json, queue_json, version)) = row
    else {
        return Ok(None);
    };
    Ok(Some(NodeRecord {
        storage: decode_storage(&storage_json).with_context(|| format!("node {id}"))?,
        queue: decode_queue(&queue_json).with_context(|| format!("node {id}"))?,
        id,
        node_type,
        tier,
        owner_player_id: owner,
        session_id: session,
        installed_core_id: core,
        queue_version: version,
    }))
}

/// Write storage + queue back, guarded by the version read in `load_node`.
pub fn save_node(conn: &Connection, node: &NodeRecord, now_ms: i64) -> anyhow::Result<i64> {
    let next_version = node.queue_version + 1;
    let n = conn.execute(
        "UPDATE nodes SET storage_json = ?1, queue_json = ?2, queue_version = ?3, updated_at_ms = ?4
         WHERE id = ?5 AND queue_version = ?6",
        (
            serde_json::to_string(&node.storage)?,
            encode_queue(&node.queue)?,
            next_version,
            now_ms,
            &node.id,
            node.queue_version,
        ),
    )?;
    if n != 1 {
        anyhow::bail!("node {} changed concurrently (version {})", node.id, node.queue_version);
    }
    Ok(next_version)
}

pub fn insert_node(conn: &Connection, node: &NodeRecord, now_ms: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO nodes (id, node_type, tier, owner_player_id, session_id, installed_core_id,
                            storage_json, queue_json, queue_version, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        rusqlite::params![
            node.id,
            node.node_type,
            node.tier,
            node.owner_player_id,
            node.session_id,
            node.installed_core_id,
            serde_json::to_string(&node.storage)?,
            encode_queue(&node.queue)?,
            node.queue_version,
            now_ms,
        ],
    )
    .with_context(|| format!("insert node {}", node.id))?;
    Ok(())
}

const BLUEPRINT_COLUMNS: &str = "id, inputs_json, outputs_json, craft_time_seconds, node_types_json,
     node_tier_required, learned, unlock_item_id";

fn blueprint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Blueprint, [String; 3])> {
    Ok((
        Blueprint {
            id: row.get(0)?,
            inputs: Vec::new(),
            outputs: Vec::new(),
            craft_time_seconds: row.get(3)?,
            node_types: Vec::new(),
            node_tier_required: row.get(5)?,
            learned: row.get(6)?,
            unlock_item_id: row.get(7)?,
        },
        [row.get(1)?, row.get(2)?, row.get(4)?],
    ))
}

fn finish_blueprint((mut bp, [inputs, outputs, node_types]): (Blueprint, [String; 3])) -> anyhow::Result<Blueprint> {
    bp.inputs = serde_json::from_str::<Vec<ItemStack>>(&inputs)
        .with_context(|| format!("blueprint {} inputs", bp.id))?;
    bp.outputs = serde_json::from_str::<Vec<ItemStack>>(&outputs)
        .with_context(|| format!("blueprint {} outputs", bp.id))?;
    bp.node_types = serde_json::from_str::<Vec<String>>(&node_types)
        .with_context(|| format!("blueprint {} node types", bp.id))?;
    Ok(bp)
}

pub fn load_blueprint(conn: &Connection, id: &str) -> anyhow::Result<Option<Blueprint>> {
    let sql = format!("SELECT {BLUEPRINT_COLUMNS} FROM blueprints WHERE id = ?1");
    conn.query_row(&sql, [id], blueprint_from_row)
        .optional()?
        .map(finish_blueprint)
        .transpose()
}

pub fn blueprint_by_unlock_item(conn: &Connection, item_id: &str) -> anyhow::Result<Option<Blueprint>> {
    let sql = format!(
        "SELECT {BLUEPRINT_COLUMNS} FROM blueprints WHERE unlock_item_id = ?1 ORDER BY id LIMIT 1"
    );
    conn.query_row(&sql, [item_id], blueprint_from_row)
        .optional()?
        .map(finish_blueprint)
        .transpose()
}

/// Every blueprint craftable at `node_type` up to `tier`, ignoring learned gating.
pub fn candidate_blueprints(conn: &Connection, node_type: &str, tier: u32) -> anyhow::Result<Vec<Blueprint>> {
    let sql = format!(
        "SELECT {BLUEPRINT_COLUMNS} FROM blueprints WHERE node_tier_required <= ?1 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([tier], blueprint_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        let bp = finish_blueprint(row?)?;
        if bp.node_types.iter().any(|t| t == node_type) {
            out.push(bp);
        }
    }
    Ok(out)
}

pub fn upsert_blueprint(conn: &Connection, bp: &Blueprint) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO blueprints (id, inputs_json, outputs_json, craft_time_seconds, node_types_json,
                                 node_tier_required, learned, unlock_item_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
           inputs_json = excluded.inputs_json,
           outputs_json = excluded.outputs_json,
           craft_time_seconds = excluded.craft_time_seconds,
           node_types_json = excluded.node_types_json,
           node_tier_required = excluded.node_tier_required,
           learned = excluded.learned,
           unlock_item_id = excluded.unlock_item_id",
        rusqlite::params![
            bp.id,
            serde_json::to_string(&bp.inputs)?,
            serde_json::to_string(&bp.outputs)?,
            bp.craft_time_seconds,
            serde_json::to_string(&bp.node_types)?,
            bp.node_tier_required,
            bp.learned,
            bp.unlock_item_id,
        ],
    )
    .with_context(|| format!("upsert blueprint {}", bp.id))?;
    Ok(())
}

pub fn learned_set(conn: &Connection, player_id: &str, session_id: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT blueprint_id FROM learned_blueprints WHERE player_id = ?1 AND session_id = ?2",
    )?;
    let rows = stmt.query_map((player_id, session_id), |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn has_learned(
    conn: &Connection,
    player_id: &str,
    session_id: &str,
    blueprint_id: &str,
) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM learned_blueprints
             WHERE player_id = ?1 AND session_id = ?2 AND blueprint_id = ?3",
            (player_id, session_id, blueprint_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

pub fn record_learned(
    conn: &Connection,
    player_id: &str,
    session_id: &str,
    blueprint_id: &str,
    now_ms: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO learned_blueprints (player_id, session_id, blueprint_id, learned_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        (player_id, session_id, blueprint_id, now_ms),
    )?;
    Ok(())
}

pub fn node_kind_requires_core(conn: &Connection, node_type: &str) -> anyhow::Result<bool> {
    let v: Option<bool> = conn
        .query_row(
            "SELECT requires_core FROM node_kinds WHERE node_type = ?1",
            [node_type],
            |row| row.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or(false))
}

/// First input the storage cannot cover, as `(item, needed, available)`.
pub fn first_shortfall(storage: &ItemStorage, needed: &ItemStorage) -> Option<(String, u64, u64)> {
    needed.iter().find_map(|(item, &qty)| {
        let have = storage.get(item).copied().unwrap_or(0);
        (have < qty).then(|| (item.clone(), qty, have))
    })
}

/// Everything missing to cover `needed`.
pub fn shortfall(storage: &ItemStorage, needed: &ItemStorage) -> ItemStorage {
    needed
        .iter()
        .filter_map(|(item, &qty)| {
            let have = storage.get(item).copied().unwrap_or(0);
            (have < qty).then(|| (item.clone(), qty - have))
        })
        .collect()
}

/// Caller must have checked `first_shortfall` first.
pub fn deduct(storage: &mut ItemStorage, amounts: &ItemStorage) {
    for (item, &qty) in amounts {
        if let Some(slot) = storage.get_mut(item) {
            *slot = slot.saturating_sub(qty);
            if *slot == 0 {
                storage.remove(item);
            }
        }
    }
}

pub fn credit(storage: &mut ItemStorage, amounts: &ItemStorage) {
    for (item, &qty) in amounts {
        if qty == 0 {
            continue;
        }
        let slot = storage.entry(item.clone()).or_insert(0);
        *slot = slot.saturating_add(qty);
    }
}
