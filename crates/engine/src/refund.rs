use hexforge_protocol::{CraftingQueueItem, ItemStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    /// The active item; only its in-progress run was paid for.
    Head,
    /// Waiting item; its first run was reserved at append time.
    Pending,
}

impl QueuePosition {
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            Self::Head
        } else {
            Self::Pending
        }
    }
}

/// Materials returned when `item` is cancelled at `now`.
///
/// `inputs_per_run` is the blueprint's grouped per-run input list. Every
/// refund is floored so it never exceeds what was paid.
pub fn refund_for(
    position: QueuePosition,
    item: &CraftingQueueItem,
    inputs_per_run: &ItemStorage,
    now: i64,
) -> ItemStorage {
    match position {
        QueuePosition::Pending => inputs_per_run.clone(),
        QueuePosition::Head => {
            let total = item.completes_at.saturating_sub(item.started_at);
            if total <= 0 {
                return ItemStorage::new();
            }
            let elapsed = now.saturating_sub(item.started_at).clamp(0, total);
            let remaining = (total - elapsed) as u128;
            let total = total as u128;
            inputs_per_run
                .iter()
                .filter_map(|(item_id, &qty)| {
                    let back = (u128::from(qty) * remaining / total) as u64;
                    (back > 0).then(|| (item_id.clone(), back))
                })
                .collect()
        }
    }
}
