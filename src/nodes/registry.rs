//! Node registry - the authoritative in-memory view of all nodes
//!
//! One mutex guards the whole map. Every operation takes the lock, does its
//! in-memory work and releases it; callers that need to persist do so
//! afterwards with the copy they were handed back. Transitions are published
//! on a broadcast channel while the lock is held, so subscribers see them in
//! the order they were applied.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::types::{ContactOutcome, NodeEvent, NodeState};
use crate::telemetry::SensorReading;
use crate::{Error, Result};

/// Buffered transitions per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Entry {
    state: NodeState,
    /// In-memory fields are ahead of the store
    dirty: bool,
}

impl Entry {
    const fn new(state: NodeState) -> Self {
        Self {
            state,
            dirty: false,
        }
    }
}

/// Registry of known sensor nodes
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<NodeEvent>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            nodes: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send while the lock is held; logging happens after release
    fn publish(&self, pending: &mut Vec<NodeEvent>, event: NodeEvent) {
        let _ = self.events.send(event.clone());
        pending.push(event);
    }

    /// Subscribe to state transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Create the node if absent
    ///
    /// Returns true if the node was created. An existing node is left
    /// untouched, including its permission and last reading.
    pub fn ensure(&self, id: &str) -> bool {
        let mut pending = Vec::new();
        let created = {
            let mut nodes = self.lock();
            if nodes.contains_key(id) {
                false
            } else {
                nodes.insert(id.to_string(), Entry::new(NodeState::new(id, Utc::now())));
                self.publish(&mut pending, NodeEvent::Created { node_id: id.to_string() });
                true
            }
        };
        log_events(&pending);
        created
    }

    /// Record that a node was heard from at `now`
    ///
    /// Creates the node if needed, then sets `last_seen`, `online` and (when a
    /// reading is given) `last_reading` in one step. A supplied reading always
    /// replaces the previous one regardless of its embedded timestamp.
    /// `last_seen` only moves forward: an earlier `now` leaves it unchanged, and
    /// the effective value is returned in the outcome.
    pub fn record_contact(
        &self,
        id: &str,
        reading: Option<SensorReading>,
        now: DateTime<Utc>,
    ) -> ContactOutcome {
        let mut pending = Vec::new();
        let outcome = {
            let mut nodes = self.lock();
            let mut created = false;
            let entry = match nodes.entry(id.to_string()) {
                MapEntry::Occupied(o) => o.into_mut(),
                MapEntry::Vacant(v) => {
                    created = true;
                    v.insert(Entry::new(NodeState::new(id, now)))
                }
            };

            let state = &mut entry.state;
            state.last_seen = state.last_seen.max(now);
            let last_seen = state.last_seen;
            let came_online = !state.online;
            state.online = true;
            if let Some(reading) = reading {
                state.last_reading = Some(reading);
            }
            let allowed = state.allowed;

            if created {
                self.publish(&mut pending, NodeEvent::Created { node_id: id.to_string() });
            }
            if came_online {
                self.publish(
                    &mut pending,
                    NodeEvent::StatusChanged {
                        node_id: id.to_string(),
                        online: true,
                    },
                );
            }

            ContactOutcome {
                created,
                came_online,
                allowed,
                last_seen,
            }
        };
        log_events(&pending);
        outcome
    }

    /// Set the permission flag, returning whether it changed
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node is unknown; the node is not created
    pub fn set_allowed(&self, id: &str, value: bool) -> Result<bool> {
        let mut pending = Vec::new();
        let changed = {
            let mut nodes = self.lock();
            let entry = nodes
                .get_mut(id)
                .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
            let changed = entry.state.allowed != value;
            if changed {
                entry.state.allowed = value;
                self.publish(
                    &mut pending,
                    NodeEvent::PermissionChanged {
                        node_id: id.to_string(),
                        allowed: value,
                    },
                );
            }
            changed
        };
        log_events(&pending);
        Ok(changed)
    }

    /// Set the online flag, returning whether it changed
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node is unknown; the node is not created
    pub fn set_online(&self, id: &str, value: bool) -> Result<bool> {
        let mut pending = Vec::new();
        let changed = {
            let mut nodes = self.lock();
            let entry = nodes
                .get_mut(id)
                .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
            let changed = entry.state.online != value;
            if changed {
                entry.state.online = value;
                self.publish(
                    &mut pending,
                    NodeEvent::StatusChanged {
                        node_id: id.to_string(),
                        online: value,
                    },
                );
            }
            changed
        };
        log_events(&pending);
        Ok(changed)
    }

    /// Take the node offline if it is online and has been silent too long
    ///
    /// Staleness is checked under the lock, so a contact that lands between a
    /// snapshot and this call keeps the node online.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node was removed in the meantime
    pub fn expire_if_stale(
        &self,
        id: &str,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<bool> {
        let mut pending = Vec::new();
        let expired = {
            let mut nodes = self.lock();
            let entry = nodes
                .get_mut(id)
                .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
            let expired = entry.state.online && entry.state.is_stale(now, timeout);
            if expired {
                entry.state.online = false;
                self.publish(
                    &mut pending,
                    NodeEvent::StatusChanged {
                        node_id: id.to_string(),
                        online: false,
                    },
                );
            }
            expired
        };
        log_events(&pending);
        Ok(expired)
    }

    /// Whether the node may persist telemetry
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node is unknown
    pub fn is_allowed(&self, id: &str) -> Result<bool> {
        self.lock()
            .get(id)
            .map(|e| e.state.allowed)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Copy of a single node
    #[must_use]
    pub fn get(&self, id: &str) -> Option<NodeState> {
        self.lock().get(id).map(|e| e.state.clone())
    }

    /// Point-in-time copy of every node, ordered by id
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<NodeState> {
        let mut snapshot: Vec<NodeState> = self.lock().values().map(|e| e.state.clone()).collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Remove a node
    pub fn remove(&self, id: &str) -> Option<NodeState> {
        let mut pending = Vec::new();
        let removed = {
            let mut nodes = self.lock();
            let removed = nodes.remove(id).map(|e| e.state);
            if removed.is_some() {
                self.publish(&mut pending, NodeEvent::Removed { node_id: id.to_string() });
            }
            removed
        };
        log_events(&pending);
        removed
    }

    /// Insert nodes read from the store at startup
    ///
    /// Ids already present are kept as they are. Returns the number inserted.
    pub fn load(&self, states: impl IntoIterator<Item = NodeState>) -> usize {
        let mut nodes = self.lock();
        let mut inserted = 0;
        for state in states {
            if let MapEntry::Vacant(v) = nodes.entry(state.id.clone()) {
                v.insert(Entry::new(state));
                inserted += 1;
            }
        }
        inserted
    }

    /// Re-check a node after a store write made outside the lock
    ///
    /// If `matches` rejects the current state, a newer mutation may have been
    /// overwritten in the store, so the node is flagged dirty. Returns false in
    /// that case; a node removed in the meantime counts as a match.
    pub fn verify_persisted(&self, id: &str, matches: impl FnOnce(&NodeState) -> bool) -> bool {
        let mut nodes = self.lock();
        match nodes.get_mut(id) {
            Some(entry) if !matches(&entry.state) => {
                entry.dirty = true;
                false
            }
            _ => true,
        }
    }

    /// Flag a node whose latest state failed to reach the store
    ///
    /// Returns false if the node is unknown.
    pub fn mark_dirty(&self, id: &str) -> bool {
        self.lock().get_mut(id).is_some_and(|e| {
            e.dirty = true;
            true
        })
    }

    /// Copy out every dirty node and clear the flags
    ///
    /// Callers that fail to persist a returned node should mark it dirty again.
    #[must_use]
    pub fn take_dirty(&self) -> Vec<NodeState> {
        let mut dirty: Vec<NodeState> = self
            .lock()
            .values_mut()
            .filter(|e| e.dirty)
            .map(|e| {
                e.dirty = false;
                e.state.clone()
            })
            .collect();
        dirty.sort_by(|a, b| a.id.cmp(&b.id));
        dirty
    }

    /// Number of nodes waiting to be flushed
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.lock().values().filter(|e| e.dirty).count()
    }

    /// Number of known nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn log_events(events: &[NodeEvent]) {
    for event in events {
        match event {
            NodeEvent::Created { node_id } => tracing::debug!(node_id = %node_id, "node registered"),
            NodeEvent::StatusChanged { node_id, online: true } => {
                tracing::info!(node_id = %node_id, "node online");
            }
            NodeEvent::StatusChanged { node_id, online: false } => {
                tracing::info!(node_id = %node_id, "node offline");
            }
            NodeEvent::PermissionChanged { node_id, allowed: true } => {
                tracing::info!(node_id = %node_id, "node allowed");
            }
            NodeEvent::PermissionChanged { node_id, allowed: false } => {
                tracing::info!(node_id = %node_id, "node not allowed");
            }
            NodeEvent::Removed { node_id } => tracing::info!(node_id = %node_id, "node removed"),
        }
    }
}
