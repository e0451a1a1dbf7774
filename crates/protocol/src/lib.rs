use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Item id -> count held by a node.
pub type ItemStorage = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item_id: String,
    pub quantity: u64,
}

impl ItemStack {
    pub fn new(item_id: impl Into<String>, quantity: u64) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<ItemStack>,
    #[serde(default)]
    pub outputs: Vec<ItemStack>,
    pub craft_time_seconds: f64,
    pub node_types: Vec<String>,
    #[serde(default)]
    pub node_tier_required: u32,
    /// Gated behind a per-player, per-session unlock.
    #[serde(default)]
    pub learned: bool,
    /// Storage item consumed by `learn_blueprint` to unlock this recipe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_item_id: Option<String>,
}

impl Blueprint {
    /// Inputs for a single run, with repeated item ids summed.
    pub fn inputs_per_run(&self) -> ItemStorage {
        group_stacks(&self.inputs)
    }

    /// Outputs for `runs` runs, with repeated item ids summed.
    pub fn outputs_for(&self, runs: u64) -> ItemStorage {
        let mut out = group_stacks(&self.outputs);
        for qty in out.values_mut() {
            *qty = qty.saturating_mul(runs);
        }
        out
    }

    pub fn primary_output(&self) -> Option<&str> {
        self.outputs.first().map(|s| s.item_id.as_str())
    }
}

pub fn group_stacks(stacks: &[ItemStack]) -> ItemStorage {
    let mut out = ItemStorage::new();
    for s in stacks {
        let slot = out.entry(s.item_id.clone()).or_insert(0);
        *slot = slot.saturating_add(s.quantity);
    }
    out
}

/// One batch of `quantity` identical runs. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CraftingQueueItem {
    pub id: String,
    pub blueprint_id: String,
    pub output_item_id: String,
    pub quantity: u32,
    pub completed_runs: u32,
    pub time_per_run: i64,
    pub started_at: i64,
    pub completes_at: i64,
    #[serde(default)]
    pub stalled: bool,
}

impl CraftingQueueItem {
    pub fn remaining_runs(&self) -> u32 {
        self.quantity.saturating_sub(self.completed_runs)
    }

    /// Wall time from `started_at` until the whole remaining batch is done.
    pub fn remaining_ms(&self) -> i64 {
        i64::from(self.remaining_runs()).saturating_mul(self.time_per_run)
    }

    pub fn is_done(&self) -> bool {
        self.completed_runs >= self.quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    NotFound,
    Rule,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCraftRequest {
    pub player_id: String,
    pub session_id: String,
    pub blueprint_id: String,
    /// Kept as a raw JSON number so fractional values reach validation.
    pub quantity: serde_json::Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelCraftRequest {
    pub player_id: String,
    pub queue_item_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnBlueprintRequest {
    pub player_id: String,
    pub session_id: String,
    pub blueprint_item_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub items: Vec<ItemStack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CraftResponse {
    pub success: bool,
    pub queue: Vec<CraftingQueueItem>,
    pub storage: ItemStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub queue: Vec<CraftingQueueItem>,
    pub storage: ItemStorage,
    pub refunded: ItemStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnResponse {
    pub success: bool,
    pub storage: ItemStorage,
    pub learned_blueprint_id: String,
    pub already_learned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub kind: ErrorKind,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPayload {
    pub node_id: String,
    pub session_id: String,
    pub queue_item_id: String,
    pub blueprint_id: String,
    pub quantity: u32,
    pub outputs: ItemStorage,
    pub storage: ItemStorage,
    pub queue: Vec<CraftingQueueItem>,
}

/// Session-scoped notifications for real-time broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CraftEvent {
    Started {
        node_id: String,
        session_id: String,
        queue_item_id: String,
        blueprint_id: String,
        quantity: u32,
        queue: Vec<CraftingQueueItem>,
        storage: ItemStorage,
    },
    Cancelled {
        node_id: String,
        session_id: String,
        queue_item_id: String,
        refunded: ItemStorage,
        queue: Vec<CraftingQueueItem>,
        storage: ItemStorage,
    },
    RunCompleted {
        node_id: String,
        session_id: String,
        queue_item_id: String,
        completed_runs: u32,
        quantity: u32,
        queue: Vec<CraftingQueueItem>,
        storage: ItemStorage,
    },
    Completed(CompletionPayload),
    Stalled {
        node_id: String,
        session_id: String,
        queue_item_id: String,
        missing: ItemStorage,
    },
    Learned {
        node_id: String,
        session_id: String,
        player_id: String,
        blueprint_id: String,
    },
    /// Items credited to a node. `resumed` is set when a stalled head was re-armed.
    Deposited {
        node_id: String,
        session_id: String,
        deposited: ItemStorage,
        storage: ItemStorage,
        resumed: bool,
    },
}

impl CraftEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "craft.started",
            Self::Cancelled { .. } => "craft.cancelled",
            Self::RunCompleted { .. } => "craft.run_completed",
            Self::Completed(_) => "craft.completed",
            Self::Stalled { .. } => "craft.stalled",
            Self::Learned { .. } => "blueprint.learned",
            Self::Deposited { .. } => "storage.deposited",
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Self::Started { node_id, .. }
            | Self::Cancelled { node_id, .. }
            | Self::RunCompleted { node_id, .. }
            | Self::Stalled { node_id, .. }
            | Self::Learned { node_id, .. }
            | Self::Deposited { node_id, .. } => node_id,
            Self::Completed(p) => &p.node_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Started { session_id, .. }
            | Self::Cancelled { session_id, .. }
            | Self::RunCompleted { session_id, .. }
            | Self::Stalled { session_id, .. }
            | Self::Learned { session_id, .. }
            | Self::Deposited { session_id, .. } => session_id,
            Self::Completed(p) => &p.session_id,
        }
    }
}

/// One row of the durable event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub seq: i64,
    pub ts_ms: i64,
    pub kind: String,
    pub node_id: Option<String>,
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
}
