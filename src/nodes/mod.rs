//! Node registry and the periodic jobs that keep it honest
//!
//! The registry is the only state shared between ingestion, the liveness
//! monitor and the permission reconciler. Helpers in this module move state
//! between the registry and a [`NodeStore`] without ever holding the registry
//! lock across store I/O.

pub mod monitor;
pub mod reconciler;
pub mod registry;
pub mod types;

pub use monitor::{LivenessMonitor, SweepReport};
pub use reconciler::{PermissionReconciler, ReconcileReport};
pub use registry::NodeRegistry;
pub use types::{ContactOutcome, NodeEvent, NodeState};

use crate::Result;
use crate::db::{NodeField, NodeStore};

/// Write every persisted field of `node` to the store
///
/// Used to flush nodes whose earlier writes failed. The reading is only
/// written for allowed nodes.
///
/// # Errors
///
/// Returns the first store error; later fields are not attempted
pub fn persist_node(store: &dyn NodeStore, node: &NodeState) -> Result<()> {
    store.upsert_node(&node.id)?;
    store.update_node_field(&node.id, NodeField::Online(node.online))?;
    store.update_node_field(&node.id, NodeField::Allowed(node.allowed))?;
    store.update_node_field(&node.id, NodeField::LastSeen(node.last_seen))?;
    if node.allowed {
        if let Some(reading) = &node.last_reading {
            store.upsert_reading(&node.id, reading)?;
        }
    }
    Ok(())
}

/// Whether `current` still has the fields `persist_node` wrote for `written`
pub(crate) fn same_persisted_fields(written: &NodeState, current: &NodeState) -> bool {
    written.online == current.online
        && written.allowed == current.allowed
        && written.last_seen == current.last_seen
        && (!current.allowed || written.last_reading == current.last_reading)
}

/// Load stored nodes into the registry at startup
///
/// Every node comes back offline; nodes the store still lists as online are
/// flipped (emitting a transition) and written back. Returns the number of
/// nodes loaded.
///
/// # Errors
///
/// Returns error if the stored nodes cannot be read
pub fn warm_start(registry: &NodeRegistry, store: &dyn NodeStore) -> Result<usize> {
    let stored = store.load_all_nodes()?;
    let were_online: Vec<String> = stored
        .iter()
        .filter(|n| n.online)
        .map(|n| n.id.clone())
        .collect();

    let loaded = registry.load(stored);

    for id in &were_online {
        if !registry.set_online(id, false).unwrap_or(false) {
            continue;
        }
        if let Err(e) = store.update_node_field(id, NodeField::Online(false)) {
            tracing::warn!(node_id = %id, error = %e, "failed to persist offline status");
            registry.mark_dirty(id);
        }
    }

    tracing::info!(loaded, reset = were_online.len(), "nodes loaded from store");
    Ok(loaded)
}

/// Mark every online node offline and persist it
///
/// Returns the number of nodes taken offline.
pub fn shutdown_all(registry: &NodeRegistry, store: &dyn NodeStore) -> usize {
    let mut offline = 0;
    for node in registry.snapshot_all().into_iter().filter(|n| n.online) {
        if !registry.set_online(&node.id, false).unwrap_or(false) {
            continue;
        }
        offline += 1;
        if let Err(e) = store.update_node_field(&node.id, NodeField::Online(false)) {
            tracing::warn!(node_id = %node.id, error = %e, "failed to persist offline status at shutdown");
        }
    }
    offline
}

/// Administrative delete: drop a node from the store, then from the registry
///
/// The store side runs in one transaction; the registry entry is only removed
/// once it has committed. Returns true if the node existed in either place.
///
/// # Errors
///
/// Returns error if the store transaction fails; the registry is untouched
pub fn delete_node(registry: &NodeRegistry, store: &dyn NodeStore, id: &str) -> Result<bool> {
    let stored = store.delete_node(id)?;
    let cached = registry.remove(id).is_some();
    Ok(stored || cached)
}
