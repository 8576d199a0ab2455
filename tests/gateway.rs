//! End-to-end behavior of the gateway core

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FlakyStore, at, sample_reading};
use sensor_gateway::db::{NodeField, NodeStore};
use sensor_gateway::{
    Config, Daemon, Ingestor, LivenessMonitor, MonotonicClock, NodeEvent, NodeRegistry,
    PermissionReconciler, Subscription, TopicLayout, TransportEvent,
};
use tokio::sync::{mpsc, oneshot};
use tokio_test::{assert_err, assert_ok};

const READING: &str =
    r#"{"temp":"21.5","pres":1013,"alt":120,"hum":55,"lux":300,"soun":40,"time":1700000000}"#;

struct Harness {
    registry: Arc<NodeRegistry>,
    store: Arc<FlakyStore>,
    ingestor: Arc<Ingestor>,
    monitor: LivenessMonitor,
    reconciler: PermissionReconciler,
}

fn harness() -> Harness {
    let registry = Arc::new(NodeRegistry::new());
    let store = FlakyStore::new();
    let shared: Arc<dyn NodeStore> = Arc::clone(&store) as Arc<dyn NodeStore>;
    Harness {
        ingestor: Arc::new(Ingestor::new(
            Arc::clone(&registry),
            Arc::clone(&shared),
            TopicLayout::default(),
            Arc::new(MonotonicClock::new()),
        )),
        monitor: LivenessMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&shared),
            Duration::from_secs(60),
        ),
        reconciler: PermissionReconciler::new(Arc::clone(&registry), shared),
        registry,
        store,
    }
}

fn announce(id: &str, secs: i64) -> TransportEvent {
    TransportEvent::new(
        "client/accepted",
        format!(r#"{{"id":"{id}"}}"#).into_bytes(),
        at(secs),
    )
}

fn telemetry(id: &str, secs: i64) -> TransportEvent {
    TransportEvent::new(format!("Nodes/{id}/Data"), READING.as_bytes().to_vec(), at(secs))
}

#[test]
fn announced_node_goes_offline_after_silence() {
    let h = harness();
    let mut events = h.registry.subscribe();

    h.ingestor.handle(&announce("7", 0)).unwrap();
    let node = h.registry.get("7").unwrap();
    assert!(node.online);
    assert!(!node.allowed);

    let report = h.monitor.sweep(at(61));
    assert_eq!(report.expired, 1);
    assert!(!h.registry.get("7").unwrap().online);
    assert!(!h.store.inner.find("7").unwrap().unwrap().online);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        [
            NodeEvent::Created { node_id: "7".to_string() },
            NodeEvent::StatusChanged { node_id: "7".to_string(), online: true },
            NodeEvent::StatusChanged { node_id: "7".to_string(), online: false },
        ]
    );
}

#[test]
fn permission_then_telemetry_is_persisted() {
    let h = harness();
    h.ingestor.handle(&announce("42", 0)).unwrap();
    h.store.inner.append_audit_entry("42", true).unwrap();

    let report = assert_ok!(h.reconciler.run_cycle());
    assert_eq!(report.changed, 1);
    assert!(h.store.inner.find("42").unwrap().unwrap().allowed);

    let outcome = h.ingestor.handle(&telemetry("42", 5)).unwrap();
    assert!(outcome.reading_stored);
    let stored = h.store.inner.find("42").unwrap().unwrap();
    assert_eq!(stored.last_reading, Some(sample_reading(0)));
    assert_eq!(stored.last_seen, at(5));
}

#[test]
fn reapplying_an_entry_changes_nothing() {
    let h = harness();
    h.registry.ensure("a");
    h.store.inner.append_audit_entry("a", true).unwrap();
    assert_ok!(h.reconciler.run_cycle());
    let before = h.registry.get("a").unwrap();

    h.store.inner.append_audit_entry("a", true).unwrap();
    let report = assert_ok!(h.reconciler.run_cycle());
    assert_eq!(report.changed, 0);
    assert_eq!(h.registry.get("a").unwrap(), before);
}

#[test]
fn entry_written_after_read_survives_the_cycle() {
    let h = harness();
    h.registry.ensure("a");
    h.store.inner.append_audit_entry("a", true).unwrap();
    *h.store.late_entry.lock().unwrap() = Some(("a".to_string(), false));

    let report = assert_ok!(h.reconciler.run_cycle());
    assert_eq!(report.read, 1);
    assert_eq!(report.deleted, 1);
    assert!(h.registry.is_allowed("a").unwrap());

    let remaining = h.store.inner.list_audit_entries().unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(!remaining[0].allowed);

    assert_ok!(h.reconciler.run_cycle());
    assert!(!h.registry.is_allowed("a").unwrap());
    assert!(h.store.inner.list_audit_entries().unwrap().is_empty());
}

#[test]
fn failed_audit_delete_is_retried() {
    let h = harness();
    h.registry.ensure("a");
    h.store.inner.append_audit_entry("a", true).unwrap();
    h.store.fail_audit_delete.store(true, Ordering::SeqCst);

    let report = assert_ok!(h.reconciler.run_cycle());
    assert_eq!(report.changed, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(h.store.inner.list_audit_entries().unwrap().len(), 1);

    h.store.fail_audit_delete.store(false, Ordering::SeqCst);
    let report = assert_ok!(h.reconciler.run_cycle());
    assert_eq!(report.changed, 0);
    assert_eq!(report.deleted, 1);
    assert!(h.registry.is_allowed("a").unwrap());
}

#[test]
fn unreadable_audit_log_applies_nothing() {
    let h = harness();
    h.registry.ensure("a");
    h.store.inner.append_audit_entry("a", true).unwrap();
    h.store.fail_audit_read.store(true, Ordering::SeqCst);

    assert_err!(h.reconciler.run_cycle());
    assert!(!h.registry.is_allowed("a").unwrap());
    assert_eq!(h.store.inner.list_audit_entries().unwrap().len(), 1);
}

#[test]
fn failed_writes_are_flushed_by_the_next_sweep() {
    let h = harness();
    assert_ok!(h.ingestor.handle(&announce("9", 0)));
    h.registry.set_allowed("9", true).unwrap();
    h.store.set_fail_writes(true);

    let outcome = assert_ok!(h.ingestor.handle(&telemetry("9", 3)));
    assert!(!outcome.persisted);
    assert!(h.registry.get("9").unwrap().online);
    assert_eq!(h.registry.dirty_count(), 1);
    let stale = h.store.inner.find("9").unwrap().unwrap();
    assert!(!stale.allowed);
    assert_eq!(stale.last_seen, at(0));
    assert!(stale.last_reading.is_none());

    let report = h.monitor.sweep(at(4));
    assert_eq!(report.failed, 1);
    assert_eq!(h.registry.dirty_count(), 1);

    h.store.set_fail_writes(false);
    let report = h.monitor.sweep(at(5));
    assert_eq!(report.flushed, 1);
    assert_eq!(h.registry.dirty_count(), 0);

    let stored = h.store.inner.find("9").unwrap().unwrap();
    assert!(stored.online);
    assert!(stored.allowed);
    assert_eq!(stored.last_seen, at(3));
    assert_eq!(stored.last_reading, Some(sample_reading(0)));
}

#[test]
fn contact_during_offline_write_is_restored_next_sweep() {
    let h = harness();
    assert_ok!(h.ingestor.handle(&announce("7", 0)));

    let ingestor = Arc::clone(&h.ingestor);
    h.store.before_next_write(move || {
        ingestor.handle(&announce("7", 61)).unwrap();
    });

    let report = h.monitor.sweep(at(61));
    assert_eq!(report.expired, 1);
    assert!(h.registry.get("7").unwrap().online);
    assert!(!h.store.inner.find("7").unwrap().unwrap().online);
    assert_eq!(h.registry.dirty_count(), 1);

    let report = h.monitor.sweep(at(62));
    assert_eq!(report.flushed, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(h.registry.dirty_count(), 0);
    let stored = h.store.inner.find("7").unwrap().unwrap();
    assert!(stored.online);
    assert_eq!(stored.last_seen, at(61));
}

#[test]
fn permission_applied_during_flush_is_rewritten() {
    let h = harness();
    assert_ok!(h.ingestor.handle(&announce("3", 0)));
    h.registry.mark_dirty("3");
    h.store.inner.append_audit_entry("3", true).unwrap();

    let registry = Arc::clone(&h.registry);
    let shared = Arc::clone(&h.store) as Arc<dyn NodeStore>;
    h.store.before_next_write(move || {
        let reconciler = PermissionReconciler::new(registry, shared);
        assert_eq!(reconciler.run_cycle().unwrap().changed, 1);
    });

    let report = h.monitor.sweep(at(1));
    assert_eq!(report.flushed, 1);
    assert!(h.registry.is_allowed("3").unwrap());
    assert!(!h.store.inner.find("3").unwrap().unwrap().allowed);
    assert_eq!(h.registry.dirty_count(), 1);

    h.monitor.sweep(at(2));
    assert_eq!(h.registry.dirty_count(), 0);
    assert!(h.store.inner.find("3").unwrap().unwrap().allowed);
}

#[test]
fn late_stamped_telemetry_keeps_latest_last_seen() {
    let h = harness();
    assert_ok!(h.ingestor.handle(&announce("5", 100)));
    let outcome = assert_ok!(h.ingestor.handle(&telemetry("5", 95)));

    assert_eq!(outcome.contact.last_seen, at(100));
    assert_eq!(h.registry.get("5").unwrap().last_seen, at(100));
    assert_eq!(h.store.inner.find("5").unwrap().unwrap().last_seen, at(100));

    // Not stale relative to the later stamp
    assert_eq!(h.monitor.sweep(at(159)).expired, 0);
}

#[test]
fn malformed_traffic_is_ignored() {
    let h = harness();
    assert_err!(h.ingestor.handle(&TransportEvent::new("Nodes//Data", READING, at(0))));
    assert_err!(h.ingestor.handle(&TransportEvent::new("client/accepted", "not json", at(0))));
    assert_err!(h.ingestor.handle(&TransportEvent::new("other/topic", READING, at(0))));
    assert!(h.registry.is_empty());
}

async fn wait_for(registry: &NodeRegistry, id: &str) {
    for _ in 0..200 {
        if registry.get(id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node {id} never appeared");
}

#[tokio::test]
async fn daemon_serves_until_signalled() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::new();
    store.inner.upsert_node("old").unwrap();
    store.inner.update_node_field("old", NodeField::Online(true)).unwrap();
    store.inner.update_node_field("old", NodeField::Allowed(true)).unwrap();

    let daemon = Daemon::with_store(
        Config::with_data_dir(dir.path()),
        Arc::clone(&store) as Arc<dyn NodeStore>,
    );
    let registry = daemon.registry();

    let (announce_tx, announce_rx) = mpsc::channel(8);
    let (data_tx, data_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let subscriptions = vec![
        Subscription::from_channel("announce", announce_rx),
        Subscription::from_channel("data", data_rx),
    ];

    let driver = async {
        announce_tx.send(announce("7", 0)).await.unwrap();
        wait_for(&registry, "7").await;
        assert!(registry.get("7").unwrap().online);

        // Warm start restored the stored node, offline
        let old = registry.get("old").unwrap();
        assert!(!old.online);
        assert!(old.allowed);

        drop(announce_tx);
        drop(data_tx);
        stop_tx.send(()).unwrap();
    };

    let (served, ()) = tokio::join!(
        daemon.serve(subscriptions, async {
            let _ = stop_rx.await;
        }),
        driver
    );
    assert_ok!(served);

    assert!(!registry.get("7").unwrap().online);
    let stored = store.inner.find("7").unwrap().unwrap();
    assert!(!stored.online);
    assert!(!store.inner.find("old").unwrap().unwrap().online);
}

#[tokio::test]
async fn purge_on_start_clears_audit_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::new();
    store.inner.append_audit_entry("x", true).unwrap();

    let mut config = Config::with_data_dir(dir.path());
    config.store.purge_audit_on_start = true;
    let daemon = Daemon::with_store(config, Arc::clone(&store) as Arc<dyn NodeStore>);

    daemon.serve(Vec::new(), async {}).await.unwrap();
    assert!(store.inner.list_audit_entries().unwrap().is_empty());
}
