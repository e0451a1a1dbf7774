//! Crafting queue operations.
//!
//! Every mutation (start, cancel, run completion, learning, deposits) is one
//! `BEGIN IMMEDIATE` transaction over the node row: the queue, the storage and
//! the node's `craft_due` entry are read and written together. Push-timer
//! updates and event fan-out happen only after commit and always describe the
//! post-mutation head.

use hexforge_protocol::{
    Blueprint, CompletionPayload, CraftEvent, CraftingQueueItem, ItemStack, ItemStorage,
};
use rusqlite::Transaction;

use crate::efficiency::{resolve_efficiency, time_per_run_ms};
use crate::error::{CraftError, CraftResult, RuleViolation};
use crate::events::append_event_tx;
use crate::queue;
use crate::refund::{refund_for, QueuePosition};
use crate::scheduler::DueIndex;
use crate::store::{self, NodeRecord};
use crate::{new_id, Engine};

/// A node whose completion keeps failing is retried after this long.
const SWEEP_RETRY_BACKOFF_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub id: String,
    pub node_type: String,
    pub tier: u32,
    pub owner_player_id: String,
    pub session_id: String,
    pub installed_core_id: Option<String>,
    pub storage: ItemStorage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub item: CraftingQueueItem,
    pub queue: Vec<CraftingQueueItem>,
    pub storage: ItemStorage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub queue: Vec<CraftingQueueItem>,
    pub storage: ItemStorage,
    pub refunded: ItemStorage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnOutcome {
    pub storage: ItemStorage,
    pub learned_blueprint_id: String,
    pub already_learned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Node gone or queue empty.
    Idle,
    /// Head is not due yet; a racing invocation already handled this run.
    NotDue { completes_at: i64 },
    /// A run finished and the next run of the same item started.
    Advanced {
        queue_item_id: String,
        completed_runs: u32,
        completes_at: i64,
    },
    /// The last run finished; outputs were credited and the item removed.
    Finished {
        queue_item_id: String,
        outputs: ItemStorage,
        next_head: Option<String>,
    },
    /// The next run cannot be paid for; the item waits for storage.
    Stalled {
        queue_item_id: String,
        missing: ItemStorage,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub idle: usize,
    pub not_due: usize,
    pub advanced: usize,
    pub finished: usize,
    pub stalled: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Keep,
    Arm(i64),
    Disarm,
}

struct Committed<T> {
    value: T,
    push: Push,
    events: Vec<CraftEvent>,
}

impl<T> Committed<T> {
    fn new(value: T, push: Push, events: Vec<CraftEvent>) -> Self {
        Self {
            value,
            push,
            events,
        }
    }
}

fn require_id(what: &str, value: &str) -> CraftResult<()> {
    if value.trim().is_empty() {
        return Err(CraftError::Validation(format!("{what} is required")));
    }
    Ok(())
}

fn validate_quantity(quantity: i64) -> CraftResult<u32> {
    match u32::try_from(quantity) {
        Ok(q) if q > 0 => Ok(q),
        _ => Err(CraftError::Validation(
            "quantity must be a positive integer".to_string(),
        )),
    }
}

fn load_node_or_404(tx: &Transaction<'_>, node_id: &str) -> CraftResult<NodeRecord> {
    store::load_node(tx, node_id)?.ok_or_else(|| CraftError::NotFound(format!("node {node_id}")))
}

fn check_owner(node: &NodeRecord, player_id: &str) -> CraftResult<()> {
    if node.owner_player_id != player_id {
        return Err(CraftError::Unauthorized(format!(
            "player {player_id} does not own node {}",
            node.id
        )));
    }
    Ok(())
}

fn check_session(node: &NodeRecord, player_id: &str, session_id: &str) -> CraftResult<()> {
    if node.session_id != session_id {
        return Err(CraftError::NotFound(format!(
            "player {player_id} in session {session_id}"
        )));
    }
    Ok(())
}

fn load_blueprint_or_404(tx: &Transaction<'_>, id: &str) -> CraftResult<Blueprint> {
    store::load_blueprint(tx, id)?.ok_or_else(|| CraftError::NotFound(format!("blueprint {id}")))
}

/// Point the pull index at the post-mutation head and report the push update.
fn sync_due(tx: &Transaction<'_>, node: &NodeRecord) -> anyhow::Result<Push> {
    match node.queue.first() {
        Some(head) if !head.stalled => {
            DueIndex::insert(tx, &node.id, head.completes_at)?;
            Ok(Push::Arm(head.completes_at))
        }
        _ => {
            DueIndex::remove(tx, &node.id)?;
            Ok(Push::Disarm)
        }
    }
}

/// Make a stalled head due at `now` once storage covers its next run.
fn resume_if_affordable(
    tx: &Transaction<'_>,
    node: &NodeRecord,
    now: i64,
) -> anyhow::Result<Option<Push>> {
    let Some(head) = node.queue.first().filter(|h| h.stalled) else {
        return Ok(None);
    };
    // An unknown blueprint is left to the completion handler to report.
    if let Some(bp) = store::load_blueprint(tx, &head.blueprint_id)? {
        if store::first_shortfall(&node.storage, &bp.inputs_per_run()).is_some() {
            return Ok(None);
        }
    }
    DueIndex::insert(tx, &node.id, now)?;
    tracing::debug!(node_id = %node.id, queue_item_id = %head.id, "stalled craft re-armed");
    Ok(Some(Push::Arm(now)))
}

impl Engine {
    fn publish<T>(&self, node_id: &str, committed: Committed<T>) -> T {
        match committed.push {
            Push::Keep => {}
            Push::Arm(at) => self.scheduler.schedule_once(node_id, at),
            Push::Disarm => self.scheduler.cancel(node_id),
        }
        for event in &committed.events {
            self.events.publish(event);
        }
        committed.value
    }

    /// `startCrafting`: validate, pre-pay one run, append and chain.
    pub fn start_crafting(
        &self,
        node_id: &str,
        player_id: &str,
        session_id: &str,
        blueprint_id: &str,
        quantity: i64,
    ) -> CraftResult<StartOutcome> {
        let quantity = validate_quantity(quantity)?;
        require_id("node_id", node_id)?;
        require_id("player_id", player_id)?;
        require_id("session_id", session_id)?;
        require_id("blueprint_id", blueprint_id)?;

        let now = self.now();
        let committed = self.write_tx(|tx| -> CraftResult<_> {
            let mut node = load_node_or_404(tx, node_id)?;
            check_owner(&node, player_id)?;
            check_session(&node, player_id, session_id)?;
            let blueprint = load_blueprint_or_404(tx, blueprint_id)?;

            if !blueprint.node_types.iter().any(|t| *t == node.node_type) {
                return Err(RuleViolation::WrongNodeType {
                    blueprint_id: blueprint.id.clone(),
                    node_type: node.node_type.clone(),
                }
                .into());
            }
            if node.tier < blueprint.node_tier_required {
                return Err(RuleViolation::TierTooLow {
                    tier: node.tier,
                    required: blueprint.node_tier_required,
                }
                .into());
            }
            if blueprint.learned && !store::has_learned(tx, player_id, session_id, &blueprint.id)? {
                return Err(RuleViolation::NotLearned(blueprint.id.clone()).into());
            }
            if node.installed_core_id.is_none() && store::node_kind_requires_core(tx, &node.node_type)? {
                return Err(RuleViolation::CoreRequired(node.node_type.clone()).into());
            }
            let per_run = blueprint.inputs_per_run();
            if let Some((item_id, needed, available)) = store::first_shortfall(&node.storage, &per_run) {
                return Err(RuleViolation::InsufficientMaterials {
                    item_id,
                    needed,
                    available,
                }
                .into());
            }

            let efficiency = resolve_efficiency(tx, node.installed_core_id.as_deref())?;
            let time_per_run = time_per_run_ms(blueprint.craft_time_seconds, efficiency);
            store::deduct(&mut node.storage, &per_run);

            let was_empty = node.queue.is_empty();
            let started_at = queue::next_start(&node.queue, now);
            let item = CraftingQueueItem {
                id: new_id("craft", now),
                blueprint_id: blueprint.id.clone(),
                output_item_id: blueprint.primary_output().unwrap_or_default().to_string(),
                quantity,
                completed_runs: 0,
                time_per_run,
                started_at,
                completes_at: started_at.saturating_add(time_per_run),
                stalled: false,
            };
            node.queue.push(item.clone());
            store::save_node(tx, &node, now)?;

            let push = if was_empty { sync_due(tx, &node)? } else { Push::Keep };
            let event = CraftEvent::Started {
                node_id: node.id.clone(),
                session_id: node.session_id.clone(),
                queue_item_id: item.id.clone(),
                blueprint_id: item.blueprint_id.clone(),
                quantity,
                queue: node.queue.clone(),
                storage: node.storage.clone(),
            };
            append_event_tx(tx, now, &event)?;
            tracing::debug!(node_id, queue_item_id = %item.id, quantity, time_per_run, started_at, "craft queued");

            let outcome = StartOutcome {
                item,
                queue: node.queue,
                storage: node.storage,
            };
            Ok(Committed::new(outcome, push, vec![event]))
        })?;
        Ok(self.publish(node_id, committed))
    }

    /// `cancelCraft`: refund, remove and re-chain what is left.
    pub fn cancel_craft(
        &self,
        node_id: &str,
        player_id: &str,
        queue_item_id: &str,
    ) -> CraftResult<CancelOutcome> {
        require_id("node_id", node_id)?;
        require_id("player_id", player_id)?;
        require_id("queue_item_id", queue_item_id)?;

        let now = self.now();
        let committed = self.write_tx(|tx| -> CraftResult<_> {
            let mut node = load_node_or_404(tx, node_id)?;
            check_owner(&node, player_id)?;
            let position = queue::position_of(&node.queue, queue_item_id)
                .ok_or_else(|| CraftError::NotFound(format!("queue item {queue_item_id}")))?;
            let cancelled = node.queue.remove(position);

            let per_run = match store::load_blueprint(tx, &cancelled.blueprint_id)? {
                Some(bp) => bp.inputs_per_run(),
                None => {
                    tracing::warn!(node_id, blueprint_id = %cancelled.blueprint_id, "cancelling craft of unknown blueprint; nothing refunded");
                    ItemStorage::new()
                }
            };
            let refunded = refund_for(QueuePosition::from_index(position), &cancelled, &per_run, now);
            store::credit(&mut node.storage, &refunded);

            queue::ensure_time_per_run(&mut node.queue);
            if position == 0 {
                queue::activate_head(&mut node.queue, now);
            } else {
                queue::rechain_from(&mut node.queue, position);
            }
            store::save_node(tx, &node, now)?;
            let push = match resume_if_affordable(tx, &node, now)? {
                Some(push) => push,
                None => sync_due(tx, &node)?,
            };

            let event = CraftEvent::Cancelled {
                node_id: node.id.clone(),
                session_id: node.session_id.clone(),
                queue_item_id: cancelled.id.clone(),
                refunded: refunded.clone(),
                queue: node.queue.clone(),
                storage: node.storage.clone(),
            };
            append_event_tx(tx, now, &event)?;
            tracing::debug!(node_id, queue_item_id, position, "craft cancelled");

            let outcome = CancelOutcome {
                queue: node.queue,
                storage: node.storage,
                refunded,
            };
            Ok(Committed::new(outcome, push, vec![event]))
        })?;
        Ok(self.publish(node_id, committed))
    }

    /// Run-completion handler shared by the push timer and the sweep.
    ///
    /// Safe to invoke any number of times: a head that is not yet due is left
    /// alone, so a second delivery of the same run is a no-op.
    pub fn complete_run(&self, node_id: &str) -> CraftResult<RunOutcome> {
        let now = self.now();
        let committed = self.write_tx(|tx| -> CraftResult<_> {
            let Some(mut node) = store::load_node(tx, node_id)? else {
                DueIndex::remove(tx, node_id)?;
                return Ok(Committed::new(RunOutcome::Idle, Push::Disarm, Vec::new()));
            };
            let Some(head) = node.queue.first().cloned() else {
                DueIndex::remove(tx, node_id)?;
                return Ok(Committed::new(RunOutcome::Idle, Push::Disarm, Vec::new()));
            };
            if head.completes_at > now {
                // Repairs a stale registration on whichever path fired early.
                let push = sync_due(tx, &node)?;
                let outcome = RunOutcome::NotDue {
                    completes_at: head.completes_at,
                };
                return Ok(Committed::new(outcome, push, Vec::new()));
            }

            let blueprint = load_blueprint_or_404(tx, &head.blueprint_id)?;
            let runs_done = head.completed_runs.saturating_add(1);

            if runs_done >= head.quantity {
                let outputs = blueprint.outputs_for(u64::from(head.quantity));
                store::credit(&mut node.storage, &outputs);
                node.queue.remove(0);
                queue::activate_head(&mut node.queue, now);
                store::save_node(tx, &node, now)?;
                let push = sync_due(tx, &node)?;

                let event = CraftEvent::Completed(CompletionPayload {
                    node_id: node.id.clone(),
                    session_id: node.session_id.clone(),
                    queue_item_id: head.id.clone(),
                    blueprint_id: head.blueprint_id.clone(),
                    quantity: head.quantity,
                    outputs: outputs.clone(),
                    storage: node.storage.clone(),
                    queue: node.queue.clone(),
                });
                append_event_tx(tx, now, &event)?;
                tracing::info!(node_id, queue_item_id = %head.id, quantity = head.quantity, "craft completed");

                let outcome = RunOutcome::Finished {
                    queue_item_id: head.id,
                    outputs,
                    next_head: node.queue.first().map(|it| it.id.clone()),
                };
                return Ok(Committed::new(outcome, push, vec![event]));
            }

            let per_run = blueprint.inputs_per_run();
            if store::first_shortfall(&node.storage, &per_run).is_some() {
                let missing = store::shortfall(&node.storage, &per_run);
                let mut events = Vec::new();
                if !head.stalled {
                    node.queue[0].stalled = true;
                    store::save_node(tx, &node, now)?;
                    let event = CraftEvent::Stalled {
                        node_id: node.id.clone(),
                        session_id: node.session_id.clone(),
                        queue_item_id: head.id.clone(),
                        missing: missing.clone(),
                    };
                    append_event_tx(tx, now, &event)?;
                    tracing::info!(node_id, queue_item_id = %head.id, completed_runs = head.completed_runs, "craft stalled on materials");
                    events.push(event);
                }
                DueIndex::remove(tx, node_id)?;
                let outcome = RunOutcome::Stalled {
                    queue_item_id: head.id,
                    missing,
                };
                return Ok(Committed::new(outcome, Push::Disarm, events));
            }

            store::deduct(&mut node.storage, &per_run);
            node.queue[0].completed_runs = runs_done;
            queue::activate_head(&mut node.queue, now);
            store::save_node(tx, &node, now)?;
            let push = sync_due(tx, &node)?;
            let completes_at = node.queue[0].completes_at;

            let event = CraftEvent::RunCompleted {
                node_id: node.id.clone(),
                session_id: node.session_id.clone(),
                queue_item_id: head.id.clone(),
                completed_runs: runs_done,
                quantity: head.quantity,
                queue: node.queue.clone(),
                storage: node.storage.clone(),
            };
            append_event_tx(tx, now, &event)?;
            tracing::debug!(node_id, queue_item_id = %head.id, completed_runs = runs_done, completes_at, "craft run completed");

            let outcome = RunOutcome::Advanced {
                queue_item_id: head.id,
                completed_runs: runs_done,
                completes_at,
            };
            Ok(Committed::new(outcome, push, vec![event]))
        })?;
        Ok(self.publish(node_id, committed))
    }

    /// Pull path: run the completion handler for up to `limit` due nodes.
    pub fn sweep_due(&self, limit: usize) -> anyhow::Result<SweepReport> {
        let now = self.now();
        let due = {
            let conn = self.open()?;
            DueIndex::due(&conn, now, limit)?
        };
        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };
        for (node_id, _) in due {
            match self.complete_run(&node_id) {
                Ok(RunOutcome::Idle) => report.idle += 1,
                Ok(RunOutcome::NotDue { .. }) => report.not_due += 1,
                Ok(RunOutcome::Advanced { .. }) => report.advanced += 1,
                Ok(RunOutcome::Finished { .. }) => report.finished += 1,
                Ok(RunOutcome::Stalled { .. }) => report.stalled += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(node_id = %node_id, error = %err, "sweep completion failed");
                    let conn = self.open()?;
                    DueIndex::insert(&conn, &node_id, now.saturating_add(SWEEP_RETRY_BACKOFF_MS))?;
                }
            }
        }
        Ok(report)
    }

    /// Re-register push timers for every node in the durable due index.
    pub fn rearm(&self) -> anyhow::Result<usize> {
        let conn = self.open()?;
        let entries = DueIndex::all(&conn)?;
        for (node_id, due_at) in &entries {
            self.scheduler.schedule_once(node_id, *due_at);
        }
        Ok(entries.len())
    }

    /// `learnBlueprint`: consume one blueprint item and record the unlock.
    pub fn learn_blueprint(
        &self,
        node_id: &str,
        player_id: &str,
        session_id: &str,
        blueprint_item_id: &str,
    ) -> CraftResult<LearnOutcome> {
        require_id("node_id", node_id)?;
        require_id("player_id", player_id)?;
        require_id("session_id", session_id)?;
        require_id("blueprint_item_id", blueprint_item_id)?;

        let now = self.now();
        let committed = self.write_tx(|tx| -> CraftResult<_> {
            let mut node = load_node_or_404(tx, node_id)?;
            check_owner(&node, player_id)?;
            check_session(&node, player_id, session_id)?;
            let blueprint = store::blueprint_by_unlock_item(tx, blueprint_item_id)?.ok_or_else(|| {
                CraftError::NotFound(format!("blueprint unlocked by {blueprint_item_id}"))
            })?;

            if !blueprint.learned || store::has_learned(tx, player_id, session_id, &blueprint.id)? {
                let outcome = LearnOutcome {
                    storage: node.storage,
                    learned_blueprint_id: blueprint.id,
                    already_learned: true,
                };
                return Ok(Committed::new(outcome, Push::Keep, Vec::new()));
            }

            let cost = ItemStorage::from([(blueprint_item_id.to_string(), 1)]);
            if store::first_shortfall(&node.storage, &cost).is_some() {
                return Err(RuleViolation::MissingBlueprintItem(blueprint_item_id.to_string()).into());
            }
            store::deduct(&mut node.storage, &cost);
            store::save_node(tx, &node, now)?;
            store::record_learned(tx, player_id, session_id, &blueprint.id, now)?;

            let event = CraftEvent::Learned {
                node_id: node.id.clone(),
                session_id: node.session_id.clone(),
                player_id: player_id.to_string(),
                blueprint_id: blueprint.id.clone(),
            };
            append_event_tx(tx, now, &event)?;

            let outcome = LearnOutcome {
                storage: node.storage,
                learned_blueprint_id: blueprint.id,
                already_learned: false,
            };
            Ok(Committed::new(outcome, Push::Keep, vec![event]))
        })?;
        Ok(self.publish(node_id, committed))
    }

    /// `getCraftingQueue`.
    pub fn get_crafting_queue(&self, node_id: &str) -> CraftResult<Vec<CraftingQueueItem>> {
        require_id("node_id", node_id)?;
        let conn = self.open()?;
        let node = store::load_node(&conn, node_id)?
            .ok_or_else(|| CraftError::NotFound(format!("node {node_id}")))?;
        Ok(node.queue)
    }

    pub fn get_storage(&self, node_id: &str) -> CraftResult<ItemStorage> {
        require_id("node_id", node_id)?;
        let conn = self.open()?;
        let node = store::load_node(&conn, node_id)?
            .ok_or_else(|| CraftError::NotFound(format!("node {node_id}")))?;
        Ok(node.storage)
    }

    /// `getAvailable` over the cached catalog.
    pub fn available_blueprints(
        &self,
        node_type: &str,
        tier: u32,
        player_id: &str,
        session_id: &str,
    ) -> CraftResult<Vec<Blueprint>> {
        let conn = self.open()?;
        Ok(self
            .catalog
            .available(&conn, node_type, tier, player_id, session_id, self.now())?)
    }

    pub fn available_blueprints_for_node(
        &self,
        node_id: &str,
        player_id: &str,
        session_id: &str,
    ) -> CraftResult<Vec<Blueprint>> {
        require_id("node_id", node_id)?;
        require_id("player_id", player_id)?;
        require_id("session_id", session_id)?;
        let conn = self.open()?;
        let node = store::load_node(&conn, node_id)?
            .ok_or_else(|| CraftError::NotFound(format!("node {node_id}")))?;
        check_owner(&node, player_id)?;
        check_session(&node, player_id, session_id)?;
        Ok(self.catalog.available(
            &conn,
            &node.node_type,
            node.tier,
            player_id,
            session_id,
            self.now(),
        )?)
    }

    /// Credit items to a node. A stalled head whose next run is now covered
    /// is made due immediately so the completion handler retries it.
    pub fn deposit_items(&self, node_id: &str, items: &[ItemStack]) -> CraftResult<ItemStorage> {
        require_id("node_id", node_id)?;
        let now = self.now();
        let committed = self.write_tx(|tx| -> CraftResult<_> {
            let mut node = load_node_or_404(tx, node_id)?;
            let deposited = hexforge_protocol::group_stacks(items);
            store::credit(&mut node.storage, &deposited);
            store::save_node(tx, &node, now)?;
            let resumed = resume_if_affordable(tx, &node, now)?;

            let event = CraftEvent::Deposited {
                node_id: node.id.clone(),
                session_id: node.session_id.clone(),
                deposited,
                storage: node.storage.clone(),
                resumed: resumed.is_some(),
            };
            append_event_tx(tx, now, &event)?;
            Ok(Committed::new(node.storage, resumed.unwrap_or(Push::Keep), vec![event]))
        })?;
        Ok(self.publish(node_id, committed))
    }

    pub fn create_node(&self, new_node: &NewNode) -> CraftResult<()> {
        require_id("node id", &new_node.id)?;
        require_id("node_type", &new_node.node_type)?;
        require_id("owner_player_id", &new_node.owner_player_id)?;
        require_id("session_id", &new_node.session_id)?;
        let now = self.now();
        let record = NodeRecord {
            id: new_node.id.clone(),
            node_type: new_node.node_type.clone(),
            tier: new_node.tier,
            owner_player_id: new_node.owner_player_id.clone(),
            session_id: new_node.session_id.clone(),
            installed_core_id: new_node.installed_core_id.clone(),
            storage: new_node.storage.clone(),
            queue: Vec::new(),
            queue_version: 0,
        };
        self.write_tx(|tx| -> CraftResult<()> {
            store::insert_node(tx, &record, now)?;
            Ok(())
        })
    }

    /// Swap the installed core. Only runs queued afterwards use the new efficiency.
    pub fn install_core(&self, node_id: &str, core_id: Option<&str>) -> CraftResult<()> {
        require_id("node_id", node_id)?;
        let now = self.now();
        self.write_tx(|tx| -> CraftResult<()> {
            let n = tx.execute(
                "UPDATE nodes SET installed_core_id = ?1, updated_at_ms = ?2 WHERE id = ?3",
                (core_id, now, node_id),
            )?;
            if n == 0 {
                return Err(CraftError::NotFound(format!("node {node_id}")));
            }
            Ok(())
        })
    }

    pub fn set_node_kind(&self, node_type: &str, requires_core: bool) -> CraftResult<()> {
        require_id("node_type", node_type)?;
        self.write_tx(|tx| -> CraftResult<()> {
            tx.execute(
                "INSERT INTO node_kinds (node_type, requires_core) VALUES (?1, ?2)
                 ON CONFLICT(node_type) DO UPDATE SET requires_core = excluded.requires_core",
                (node_type, requires_core),
            )?;
            Ok(())
        })
    }

    pub fn set_core_efficiency(&self, core_id: &str, efficiency: f64) -> CraftResult<()> {
        require_id("core_id", core_id)?;
        if !efficiency.is_finite() || efficiency < 0.0 {
            return Err(CraftError::Validation(
                "efficiency must be a non-negative number".to_string(),
            ));
        }
        self.write_tx(|tx| -> CraftResult<()> {
            tx.execute(
                "INSERT INTO production_cores (id, efficiency) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET efficiency = excluded.efficiency",
                (core_id, efficiency),
            )?;
            Ok(())
        })
    }

    /// Store a blueprint definition and drop cached candidate lists.
    pub fn upsert_blueprint(&self, blueprint: &Blueprint) -> CraftResult<()> {
        require_id("blueprint id", &blueprint.id)?;
        if !blueprint.craft_time_seconds.is_finite() || blueprint.craft_time_seconds < 0.0 {
            return Err(CraftError::Validation(
                "craft_time_seconds must be a non-negative number".to_string(),
            ));
        }
        self.write_tx(|tx| -> CraftResult<()> {
            store::upsert_blueprint(tx, blueprint)?;
            Ok(())
        })?;
        self.catalog.invalidate();
        Ok(())
    }
}
