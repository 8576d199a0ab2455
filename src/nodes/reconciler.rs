//! Permission reconciler - applies externally recorded `allowed` changes

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::NodeRegistry;
use crate::db::{AuditId, NodeField, NodeStore};
use crate::{Error, Result};

/// Outcome of one reconciliation cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Audit entries read this cycle
    pub read: usize,
    /// Entries that flipped a node's permission
    pub changed: usize,
    /// Entries naming nodes the registry does not know
    pub unknown: usize,
    /// Entries removed from the audit log
    pub deleted: usize,
}

/// Drains the audit log into the registry
pub struct PermissionReconciler {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn NodeStore>,
}

impl PermissionReconciler {
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, store: Arc<dyn NodeStore>) -> Self {
        Self { registry, store }
    }

    /// Read pending entries, apply them in order, then delete exactly those
    ///
    /// Entries inserted after the read are untouched and picked up next
    /// cycle. If the delete fails the same entries are re-applied next cycle,
    /// which is harmless because applying an entry twice has no extra effect.
    ///
    /// # Errors
    ///
    /// Returns error if the audit log cannot be read; nothing is applied
    pub fn run_cycle(&self) -> Result<ReconcileReport> {
        let entries = self.store.read_audit_entries()?;
        let mut report = ReconcileReport {
            read: entries.len(),
            ..ReconcileReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        for entry in &entries {
            match self.registry.set_allowed(&entry.node_id, entry.allowed) {
                Ok(true) => {
                    report.changed += 1;
                    let allowed = entry.allowed;
                    match self
                        .store
                        .update_node_field(&entry.node_id, NodeField::Allowed(allowed))
                    {
                        Ok(()) => {
                            self.registry
                                .verify_persisted(&entry.node_id, |current| current.allowed == allowed);
                        }
                        Err(e) => {
                            tracing::warn!(node_id = %entry.node_id, error = %e, "failed to persist permission");
                            self.registry.mark_dirty(&entry.node_id);
                        }
                    }
                }
                Ok(false) => {}
                Err(Error::NodeNotFound(_)) => {
                    report.unknown += 1;
                    tracing::debug!(
                        node_id = %entry.node_id,
                        entry_id = entry.entry_id,
                        "dropping audit entry for unknown node"
                    );
                }
                Err(e) => {
                    tracing::warn!(node_id = %entry.node_id, error = %e, "failed to apply audit entry");
                }
            }
        }

        let ids: Vec<AuditId> = entries.iter().map(|e| e.entry_id).collect();
        match self.store.delete_audit_entries(&ids) {
            Ok(deleted) => report.deleted = deleted,
            Err(e) => {
                tracing::warn!(count = ids.len(), error = %e, "failed to delete audit entries, retrying next cycle");
            }
        }

        Ok(report)
    }

    /// Reconcile every `interval` until `shutdown` flips
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(interval_secs = interval.as_secs(), "permission reconciler started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle() {
                        Ok(report) if report.read > 0 => tracing::debug!(
                            read = report.read,
                            changed = report.changed,
                            unknown = report.unknown,
                            deleted = report.deleted,
                            "permission reconcile"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "failed to read audit log"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("permission reconciler stopped");
    }
}
