//! Liveness monitor - periodic offline sweep and dirty-node flush

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::{NodeRegistry, persist_node, same_persisted_fields};
use crate::Error;
use crate::db::{NodeField, NodeStore};

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Nodes taken offline by this sweep
    pub expired: usize,
    /// Dirty nodes written back to the store
    pub flushed: usize,
    /// Store writes that failed and were left for the next sweep
    pub failed: usize,
}

/// Marks silent nodes offline and retries failed writes
pub struct LivenessMonitor {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn NodeStore>,
    timeout: chrono::Duration,
}

impl LivenessMonitor {
    /// Create a monitor that expires nodes silent for longer than `timeout`
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, store: Arc<dyn NodeStore>, timeout: Duration) -> Self {
        Self {
            registry,
            store,
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Run one sweep as of `now`
    ///
    /// Dirty nodes left by earlier failures are flushed first, then stale
    /// nodes are expired. A failing node never stops the others; it is marked
    /// dirty and picked up by the next sweep. So is a node that changed while
    /// its write was in flight, since the store may now hold the older value.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for node in self.registry.take_dirty() {
            match persist_node(self.store.as_ref(), &node) {
                Ok(()) => {
                    report.flushed += 1;
                    if !self
                        .registry
                        .verify_persisted(&node.id, |current| same_persisted_fields(&node, current))
                    {
                        tracing::debug!(node_id = %node.id, "node changed during flush, rewriting next sweep");
                    }
                }
                Err(e) => {
                    tracing::warn!(node_id = %node.id, error = %e, "failed to flush node state");
                    self.registry.mark_dirty(&node.id);
                    report.failed += 1;
                }
            }
        }

        let candidates = self
            .registry
            .snapshot_all()
            .into_iter()
            .filter(|n| n.online && n.is_stale(now, self.timeout));

        for node in candidates {
            match self.registry.expire_if_stale(&node.id, now, self.timeout) {
                Ok(true) => {
                    report.expired += 1;
                    match self
                        .store
                        .update_node_field(&node.id, NodeField::Online(false))
                    {
                        // A contact may have landed between the flip and the write
                        Ok(()) => {
                            self.registry.verify_persisted(&node.id, |current| !current.online);
                        }
                        Err(e) => {
                            tracing::warn!(node_id = %node.id, error = %e, "failed to persist offline status");
                            self.registry.mark_dirty(&node.id);
                            report.failed += 1;
                        }
                    }
                }
                Ok(false) => {}
                Err(Error::NodeNotFound(_)) => {
                    tracing::debug!(node_id = %node.id, "node removed during sweep");
                }
                Err(e) => tracing::warn!(node_id = %node.id, error = %e, "sweep failed for node"),
            }
        }

        report
    }

    /// Sweep every `interval` until `shutdown` flips
    ///
    /// A sweep that has started always runs to completion.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        tracing::debug!(interval_secs = interval.as_secs(), "liveness monitor started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(Utc::now());
                    if report != SweepReport::default() {
                        tracing::debug!(
                            expired = report.expired,
                            flushed = report.flushed,
                            failed = report.failed,
                            "liveness sweep"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("liveness monitor stopped");
    }
}
