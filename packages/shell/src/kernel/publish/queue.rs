//! Per-entity-type ordered publish queues.
//!
//! Positions are 1-based and recomputed after every mutation, so after
//! any `add`/`remove`/`reorder` every entry's position equals its index
//! plus one. An `(entity_type, entity_id)` pair is queued at most once.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One queued item, keyed by `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entity_type: String,
    pub entity_id: String,
    /// 1-based position inside its type's queue.
    pub position: usize,
    pub queued_at: DateTime<Utc>,
}

/// In-memory queue manager, owned by the publish scheduler.
#[derive(Default)]
pub struct PublishQueueManager {
    queues: RwLock<BTreeMap<String, Vec<QueueEntry>>>,
}

impl PublishQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an entity type known without queueing anything.
    pub fn register_type(&self, entity_type: &str) {
        self.queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(entity_type.to_string())
            .or_default();
    }

    /// Queue an entity and return its 1-based position. Re-adding an
    /// already queued entity returns the existing position without
    /// duplicating it.
    pub fn add(&self, entity_type: &str, entity_id: &str) -> usize {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(entity_type.to_string()).or_default();

        if let Some(existing) = queue.iter().find(|e| e.entity_id == entity_id) {
            return existing.position;
        }

        queue.push(QueueEntry {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            position: queue.len() + 1,
            queued_at: Utc::now(),
        });
        queue.len()
    }

    /// Remove a queued entity. A no-op (returns false) when absent.
    pub fn remove(&self, entity_type: &str, entity_id: &str) -> bool {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get_mut(entity_type) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|e| e.entity_id != entity_id);
        let removed = queue.len() < before;
        if removed {
            renumber(queue);
        }
        removed
    }

    /// Move a queued entity to a new 1-based position, clamped to
    /// `[1, len]`. A no-op (returns false) when the entity is absent.
    pub fn reorder(&self, entity_type: &str, entity_id: &str, new_position: usize) -> bool {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get_mut(entity_type) else {
            return false;
        };
        let Some(index) = queue.iter().position(|e| e.entity_id == entity_id) else {
            return false;
        };

        let entry = queue.remove(index);
        let clamped = new_position.clamp(1, queue.len() + 1);
        queue.insert(clamped - 1, entry);
        renumber(queue);
        true
    }

    /// Snapshot of a type's queue, in order.
    pub fn list(&self, entity_type: &str) -> Vec<QueueEntry> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// The front entry of a type's queue, without removing it.
    pub fn get_next(&self, entity_type: &str) -> Option<QueueEntry> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_type)
            .and_then(|q| q.first().cloned())
    }

    /// Remove and return the front entry of a type's queue.
    pub fn pop_next(&self, entity_type: &str) -> Option<QueueEntry> {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        let queue = queues.get_mut(entity_type)?;
        if queue.is_empty() {
            return None;
        }
        let entry = queue.remove(0);
        renumber(queue);
        Some(entry)
    }

    /// The oldest queued entry across every non-empty queue; ties broken
    /// by entity type, then entity id. `None` when everything is empty.
    pub fn get_next_across_types(&self) -> Option<QueueEntry> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        queues
            .values()
            .filter_map(|q| q.first())
            .min_by(|a, b| {
                a.queued_at
                    .cmp(&b.queued_at)
                    .then_with(|| a.entity_type.cmp(&b.entity_type))
                    .then_with(|| a.entity_id.cmp(&b.entity_id))
            })
            .cloned()
    }

    /// Every known entity type, queued or not.
    pub fn registered_types(&self) -> Vec<String> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Entity types with at least one queued entry.
    pub fn queued_entity_types(&self) -> Vec<String> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }
}

fn renumber(queue: &mut [QueueEntry]) {
    for (index, entry) in queue.iter_mut().enumerate() {
        entry.position = index + 1;
    }
}
