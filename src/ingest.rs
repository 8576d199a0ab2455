//! Ingestion - turns transport events into registry updates and store writes

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::Result;
use crate::clock::MonotonicClock;
use crate::db::{NodeField, NodeStore};
use crate::nodes::{ContactOutcome, NodeRegistry};
use crate::telemetry::{self, InboundEvent, TopicLayout};
use crate::transport::TransportEvent;

/// What handling one event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub node_id: String,
    pub contact: ContactOutcome,
    /// The reading reached the store
    pub reading_stored: bool,
    /// Every store write succeeded
    pub persisted: bool,
}

/// Dispatches decoded events to the registry and the store
pub struct Ingestor {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn NodeStore>,
    layout: TopicLayout,
    clock: Arc<MonotonicClock>,
}

impl Ingestor {
    /// `clock` should be the one stamping transport events, so that events
    /// handled by different subscriptions are applied in stamp order
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn NodeStore>,
        layout: TopicLayout,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        Self {
            registry,
            store,
            layout,
            clock,
        }
    }

    /// Decode and apply one transport event
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the message is malformed; nothing is changed
    pub fn handle(&self, event: &TransportEvent) -> Result<IngestOutcome> {
        let inbound = telemetry::decode(&self.layout, &event.topic, &event.payload)?;
        Ok(self.apply(inbound, self.clock.observe(event.received_at)))
    }

    /// Apply a decoded event heard at `at`
    ///
    /// Store failures never undo the in-memory update; the node is marked
    /// dirty and rewritten by the next liveness sweep. The same happens when
    /// another task changed the node while these writes were in flight.
    pub fn apply(&self, event: InboundEvent, at: DateTime<Utc>) -> IngestOutcome {
        let (id, reading) = match event {
            InboundEvent::Connection { id } => (id, None),
            InboundEvent::Telemetry { id, reading } => (id, Some(reading)),
        };

        let contact = self.registry.record_contact(&id, reading.clone(), at);

        let mut persisted = true;
        if contact.created {
            persisted &= record(&id, self.store.upsert_node(&id));
        }
        if contact.came_online {
            persisted &= record(&id, self.store.update_node_field(&id, NodeField::Online(true)));
        }
        persisted &= record(
            &id,
            self.store
                .update_node_field(&id, NodeField::LastSeen(contact.last_seen)),
        );

        let mut reading_stored = false;
        if let Some(reading) = &reading {
            if contact.allowed {
                reading_stored = record(&id, self.store.upsert_reading(&id, reading));
                persisted &= reading_stored;
            } else {
                tracing::debug!(node_id = %id, "node not allowed, reading kept in memory only");
            }
        }

        if persisted {
            let unchanged = self.registry.verify_persisted(&id, |current| {
                current.online
                    && current.last_seen == contact.last_seen
                    && current.allowed == contact.allowed
                    && (!reading_stored || current.last_reading == reading)
            });
            if !unchanged {
                tracing::debug!(node_id = %id, "node changed during write, rewriting next sweep");
            }
        } else {
            self.registry.mark_dirty(&id);
        }

        IngestOutcome {
            node_id: id,
            contact,
            reading_stored,
            persisted,
        }
    }

    /// Handle events from one subscription until its channel closes
    ///
    /// Buffered events are drained before returning.
    pub async fn run(self: Arc<Self>, name: String, mut events: mpsc::Receiver<TransportEvent>) {
        tracing::debug!(subscription = %name, "ingestion started");

        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(&event) {
                tracing::warn!(subscription = %name, topic = %event.topic, error = %e, "dropping message");
            }
        }

        tracing::debug!(subscription = %name, "ingestion stopped");
    }
}

fn record(id: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(node_id = %id, error = %e, "failed to persist node update");
            false
        }
    }
}
