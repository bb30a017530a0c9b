//! Cross-turn source carry-over.
//!
//! Every turn, sources used in that turn are reset to a carry score of
//! `1.0`. All other unpinned sources decay by `decay_factor` and age by
//! one turn; they are evicted once `turns_inactive > turn_ttl` or their
//! score drops below `carry_floor`. Pinned sources never decay and are
//! never evicted.
//!
//! The state machine is pure. Loading and persisting a conversation, and
//! making sure only one turn per conversation runs at a time, is the
//! caller's job.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::bundle::{ChunkOrigin, ContextChunk};
use crate::config::RetrievalConfig;
use crate::models::ConversationSource;
use crate::store::{ConversationSnapshot, SearchFilters};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarryParams {
    pub decay_factor: f64,
    pub turn_ttl: u32,
    pub carry_floor: f64,
    pub max_carried: usize,
}

impl From<&RetrievalConfig> for CarryParams {
    fn from(cfg: &RetrievalConfig) -> Self {
        Self {
            decay_factor: cfg.decay_factor,
            turn_ttl: cfg.turn_ttl,
            carry_floor: cfg.carry_floor,
            max_carried: cfg.max_carried_sources,
        }
    }
}

/// Documents that produced chunks in the current turn.
#[derive(Debug, Clone, PartialEq)]
pub struct UsedDocument {
    pub document_id: String,
    pub chunk_ids: Vec<String>,
}

/// Result of advancing a conversation by one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnTransition {
    pub turn: u32,
    /// Sources to carry into this turn's bundle, best first.
    pub carried: Vec<ConversationSource>,
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    turn: u32,
    sources: BTreeMap<String, ConversationSource>,
}

impl From<ConversationSnapshot> for ConversationState {
    fn from(snapshot: ConversationSnapshot) -> Self {
        Self {
            turn: snapshot.turn,
            sources: snapshot
                .sources
                .into_iter()
                .map(|s| (s.document_id.clone(), s))
                .collect(),
        }
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn get(&self, document_id: &str) -> Option<&ConversationSource> {
        self.sources.get(document_id)
    }

    /// All live sources ordered by document id.
    pub fn sources(&self) -> Vec<ConversationSource> {
        self.sources.values().cloned().collect()
    }

    /// Pin a document, creating a fresh source for it when unknown.
    pub fn pin(&mut self, document_id: &str) {
        let turn = self.turn;
        self.sources
            .entry(document_id.to_string())
            .or_insert_with(|| ConversationSource::fresh(document_id, turn, Vec::new()))
            .pinned = true;
    }

    /// Returns false when the document is not tracked.
    pub fn unpin(&mut self, document_id: &str) -> bool {
        match self.sources.get_mut(document_id) {
            Some(s) => {
                s.pinned = false;
                true
            }
            None => false,
        }
    }

    /// Apply one turn: reactivate `used`, decay and evict the rest, then
    /// pick the carry set.
    pub fn advance(
        &mut self,
        used: &[UsedDocument],
        filters: &SearchFilters,
        params: &CarryParams,
    ) -> TurnTransition {
        self.turn += 1;
        let turn = self.turn;
        let now = Utc::now();
        let decay = params.decay_factor.clamp(0.0, 1.0);

        let used_ids: HashSet<&str> = used.iter().map(|u| u.document_id.as_str()).collect();
        for u in used {
            let source = self
                .sources
                .entry(u.document_id.clone())
                .or_insert_with(|| ConversationSource::fresh(&u.document_id, turn, Vec::new()));
            source.carry_score = 1.0;
            source.turns_inactive = 0;
            source.last_used_turn = turn;
            source.last_used_at = now;
            source.chunk_ids = u.chunk_ids.clone();
        }

        let mut evicted = Vec::new();
        for (doc_id, source) in self.sources.iter_mut() {
            if used_ids.contains(doc_id.as_str()) {
                continue;
            }
            source.turns_inactive += 1;
            if source.pinned {
                continue;
            }
            source.carry_score *= decay;
            if source.turns_inactive > params.turn_ttl || source.carry_score < params.carry_floor {
                evicted.push(doc_id.clone());
            }
        }
        for doc_id in &evicted {
            self.sources.remove(doc_id);
        }

        let mut carried: Vec<ConversationSource> = self
            .sources
            .values()
            .filter(|s| !used_ids.contains(s.document_id.as_str()))
            .filter(|s| filters.allows(&s.document_id))
            .cloned()
            .collect();
        carried.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.carry_score.total_cmp(&a.carry_score))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        carried.truncate(params.max_carried);

        debug!(
            turn,
            used = used.len(),
            carried = carried.len(),
            evicted = evicted.len(),
            "conversation advanced"
        );
        TurnTransition {
            turn,
            carried,
            evicted,
        }
    }
}

/// This turn's chunks first, in their order, then carried chunks not
/// already present.
pub fn merge(retrieved: Vec<ContextChunk>, carried: Vec<ContextChunk>) -> Vec<ContextChunk> {
    let mut seen: HashSet<String> = retrieved.iter().map(|c| c.chunk.id.clone()).collect();
    let mut merged = retrieved;
    for mut c in carried {
        if seen.insert(c.chunk.id.clone()) {
            c.origin = ChunkOrigin::Carried;
            merged.push(c);
        }
    }
    merged
}
