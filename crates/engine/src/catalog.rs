use hexforge_protocol::Blueprint;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::store;

pub const DEFAULT_CATALOG_TTL_MS: i64 = 300_000;

#[derive(Debug)]
struct CachedCandidates {
    fetched_at_ms: i64,
    blueprints: Arc<Vec<Blueprint>>,
}

/// Blueprints usable at a node, cached per `(node_type, tier)`.
///
/// Only the candidate list is cached. The per-player learned filter is applied
/// on every call because it changes whenever a player learns a recipe.
#[derive(Debug, Default)]
struct CacheState {
    /// Bumped by `invalidate`; a fill started under an older generation is dropped.
    generation: u64,
    entries: HashMap<(String, u32), CachedCandidates>,
}

#[derive(Debug, Clone)]
pub struct BlueprintCatalog {
    ttl_ms: i64,
    state: Arc<Mutex<CacheState>>,
}

impl Default for BlueprintCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_TTL_MS)
    }
}

impl BlueprintCatalog {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    pub fn candidates(
        &self,
        conn: &Connection,
        node_type: &str,
        tier: u32,
        now_ms: i64,
    ) -> anyhow::Result<Arc<Vec<Blueprint>>> {
        let key = (node_type.to_string(), tier);
        let generation = {
            let state = self.lock();
            if let Some(hit) = state.entries.get(&key) {
                if now_ms.saturating_sub(hit.fetched_at_ms) < self.ttl_ms {
                    return Ok(hit.blueprints.clone());
                }
            }
            state.generation
        };

        let fresh = Arc::new(store::candidate_blueprints(conn, node_type, tier)?);
        tracing::debug!(node_type, tier, count = fresh.len(), "blueprint candidates loaded");
        self.fill(key, generation, now_ms, fresh.clone());
        Ok(fresh)
    }

    /// Cache a list read under `generation`. Returns false when an
    /// invalidation happened in between and the list was discarded.
    pub(crate) fn fill(
        &self,
        key: (String, u32),
        generation: u64,
        fetched_at_ms: i64,
        blueprints: Arc<Vec<Blueprint>>,
    ) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state.entries.insert(
            key,
            CachedCandidates {
                fetched_at_ms,
                blueprints,
            },
        );
        true
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// `getAvailable`: candidates, minus learned-gated recipes the player lacks.
    pub fn available(
        &self,
        conn: &Connection,
        node_type: &str,
        tier: u32,
        player_id: &str,
        session_id: &str,
        now_ms: i64,
    ) -> anyhow::Result<Vec<Blueprint>> {
        let candidates = self.candidates(conn, node_type, tier, now_ms)?;
        let learned: HashSet<String> = if candidates.iter().any(|bp| bp.learned) {
            store::learned_set(conn, player_id, session_id)?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };
        Ok(candidates
            .iter()
            .filter(|bp| !bp.learned || learned.contains(&bp.id))
            .cloned()
            .collect())
    }

    /// Drop every cached candidate list.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.generation = state.generation.wrapping_add(1);
    }

    pub fn cached_keys(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
