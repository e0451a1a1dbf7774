//! Ordering rules for a node's crafting queue.
//!
//! Position 0 is the active item; every later item starts when its
//! predecessor's whole remaining batch is done. Chaining is computed eagerly
//! whenever the queue shape changes and is never re-derived on read.

use hexforge_protocol::CraftingQueueItem;

/// Where a new item appended to `queue` would start.
pub fn next_start(queue: &[CraftingQueueItem], now: i64) -> i64 {
    match queue.last() {
        None => now,
        Some(prev) => prev.started_at.saturating_add(prev.remaining_ms()),
    }
}

/// Re-chain every item at or after `from` (never the head) off its predecessor.
pub fn rechain_from(queue: &mut [CraftingQueueItem], from: usize) {
    for i in from.max(1)..queue.len() {
        let prev = &queue[i - 1];
        let start = prev.started_at.saturating_add(prev.remaining_ms());
        let item = &mut queue[i];
        item.started_at = start;
        item.completes_at = start.saturating_add(item.time_per_run);
    }
}

/// Start the head's next run at `now` and chain everything behind it.
pub fn activate_head(queue: &mut [CraftingQueueItem], now: i64) {
    if let Some(head) = queue.first_mut() {
        head.started_at = now;
        head.completes_at = now.saturating_add(head.time_per_run);
        head.stalled = false;
    }
    rechain_from(queue, 1);
}

pub fn position_of(queue: &[CraftingQueueItem], item_id: &str) -> Option<usize> {
    queue.iter().position(|it| it.id == item_id)
}

/// Reconstruct a per-run duration from the item's window when none was stored.
pub fn reconstruct_time_per_run(
    started_at: i64,
    completes_at: i64,
    quantity: u32,
    completed_runs: u32,
) -> i64 {
    let span = completes_at.saturating_sub(started_at).max(0);
    let runs = i64::from(quantity.saturating_sub(completed_runs).max(1));
    // Ceiling division; clamp to 1ms so a run always takes time.
    ((span + runs - 1) / runs).max(1)
}

/// Repair items whose `time_per_run` is missing or non-positive.
pub fn ensure_time_per_run(queue: &mut [CraftingQueueItem]) {
    for item in queue.iter_mut().filter(|it| it.time_per_run <= 0) {
        item.time_per_run = reconstruct_time_per_run(
            item.started_at,
            item.completes_at,
            item.quantity,
            item.completed_runs,
        );
    }
}

/// Sum of the remaining batch durations across the queue.
pub fn total_remaining_ms(queue: &[CraftingQueueItem]) -> i64 {
    queue.iter().map(CraftingQueueItem::remaining_ms).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, quantity: u32, completed: u32, tpr: i64) -> CraftingQueueItem {
        CraftingQueueItem {
            id: id.to_string(),
            blueprint_id: "bp".to_string(),
            output_item_id: "out".to_string(),
            quantity,
            completed_runs: completed,
            time_per_run: tpr,
            started_at: 0,
            completes_at: tpr,
            stalled: false,
        }
    }

    fn append(queue: &mut Vec<CraftingQueueItem>, mut it: CraftingQueueItem, now: i64) {
        it.started_at = next_start(queue, now);
        it.completes_at = it.started_at + it.time_per_run;
        queue.push(it);
    }

    #[test]
    fn appends_chain_after_whole_remaining_batch() {
        let mut q = Vec::new();
        append(&mut q, item("a", 2, 0, 10_000), 0);
        append(&mut q, item("b", 3, 0, 5_000), 0);
        append(&mut q, item("c", 1, 0, 7_000), 0);

        assert_eq!(q[0].started_at, 0);
        assert_eq!(q[1].started_at, 20_000);
        assert_eq!(q[2].started_at, 35_000);
        for it in &q {
            assert_eq!(it.completes_at - it.started_at, it.time_per_run);
        }
    }

    #[test]
    fn chain_accounts_for_completed_runs_of_predecessor() {
        let mut q = Vec::new();
        let mut head = item("a", 4, 3, 1_000);
        head.started_at = 500;
        head.completes_at = 1_500;
        q.push(head);
        append(&mut q, item("b", 1, 0, 1_000), 0);
        assert_eq!(q[1].started_at, 1_500);
    }

    #[test]
    fn activating_new_head_rechains_tail() {
        let mut q = Vec::new();
        append(&mut q, item("a", 2, 0, 10_000), 0);
        append(&mut q, item("b", 2, 0, 10_000), 0);
        append(&mut q, item("c", 1, 0, 3_000), 0);
        q.remove(0);
        activate_head(&mut q, 4_000);
        assert_eq!((q[0].started_at, q[0].completes_at), (4_000, 14_000));
        assert_eq!(q[1].started_at, 24_000);
    }

    #[test]
    fn rechain_from_leaves_head_untouched() {
        let mut q = Vec::new();
        append(&mut q, item("a", 1, 0, 10_000), 0);
        append(&mut q, item("b", 1, 0, 10_000), 0);
        append(&mut q, item("c", 1, 0, 10_000), 0);
        q.remove(1);
        rechain_from(&mut q, 1);
        assert_eq!(q[0].started_at, 0);
        assert_eq!(q[1].started_at, 10_000);
    }

    #[test]
    fn reconstructs_missing_time_per_run_with_ceiling() {
        assert_eq!(reconstruct_time_per_run(0, 10_001, 3, 1), 5_001);
        assert_eq!(reconstruct_time_per_run(0, 9_000, 3, 3), 9_000);
        assert_eq!(reconstruct_time_per_run(100, 100, 2, 0), 1);

        let mut q = vec![item("a", 2, 0, 0)];
        q[0].completes_at = 8_000;
        ensure_time_per_run(&mut q);
        assert_eq!(q[0].time_per_run, 4_000);
    }
}
