//! Daemon - the main gateway service
//!
//! Orchestrates the broker subscriptions, ingestion, the liveness monitor and
//! the permission reconciler around one shared node registry.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::MonotonicClock;
use crate::db::{self, NodeRepo, NodeStore};
use crate::ingest::Ingestor;
use crate::nodes::{self, LivenessMonitor, NodeRegistry, PermissionReconciler};
use crate::transport::{self, Subscription};
use crate::{Config, Error, Result};

/// The gateway daemon
pub struct Daemon {
    config: Config,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn NodeStore>,
    clock: Arc<MonotonicClock>,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    /// Create a daemon backed by the configured `SQLite` store
    ///
    /// # Errors
    ///
    /// Returns `Error::Startup` if the store cannot be opened
    pub fn new(config: Config) -> Result<Self> {
        let pool = db::init(&config.store.path, config.store.pool_size).map_err(|e| {
            Error::Startup(format!(
                "cannot open store at {}: {e}",
                config.store.path.display()
            ))
        })?;
        tracing::info!(path = %config.store.path.display(), "store opened");

        Ok(Self::with_store(config, Arc::new(NodeRepo::new(pool))))
    }

    /// Create a daemon over an existing store
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn NodeStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(NodeRegistry::new()),
            store,
            clock: Arc::new(MonotonicClock::new()),
            shutdown,
        }
    }

    /// Shared node registry
    #[must_use]
    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the broker or store cannot be reached at startup
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Connect to the broker and serve until `signal` completes
    ///
    /// # Errors
    ///
    /// Returns error if the broker or store cannot be reached at startup; no
    /// node state has been changed in that case
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let layout = self.config.topic_layout()?;

        let mut subscriptions = Vec::with_capacity(2);
        for (name, filter) in [
            ("announce", layout.announce_topic()),
            ("data", layout.data_filter()),
        ] {
            let result = transport::subscribe(
                &self.config.transport,
                name,
                filter,
                Arc::clone(&self.clock),
                self.shutdown.subscribe(),
            )
            .await;
            match result {
                Ok(sub) => subscriptions.push(sub),
                Err(e) => {
                    self.abandon(subscriptions).await;
                    return Err(e);
                }
            }
        }

        self.serve(subscriptions, signal).await
    }

    /// Stop the pumps of subscriptions that will never be served
    async fn abandon(&self, subscriptions: Vec<Subscription>) {
        let _ = self.shutdown.send(true);
        let pumps = subscriptions.into_iter().filter_map(|sub| sub.into_parts().2);
        for result in futures::future::join_all(pumps).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "subscription task failed");
            }
        }
    }

    /// Serve the given subscriptions until `signal` completes
    ///
    /// Loads stored nodes first. On shutdown every task is joined before all
    /// online nodes are marked offline.
    ///
    /// # Errors
    ///
    /// Returns `Error::Startup` if the stored nodes cannot be loaded
    pub async fn serve<F>(self, subscriptions: Vec<Subscription>, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let layout = self.config.topic_layout()?;

        if self.config.store.purge_audit_on_start {
            match self.store.purge_audit_entries() {
                Ok(purged) => tracing::info!(purged, "cleared audit log"),
                Err(e) => return Err(Error::Startup(format!("cannot clear audit log: {e}"))),
            }
        }

        nodes::warm_start(&self.registry, self.store.as_ref())
            .map_err(|e| Error::Startup(format!("cannot load stored nodes: {e}")))?;

        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            layout,
            Arc::clone(&self.clock),
        ));

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for sub in subscriptions {
            let (name, events, pump) = sub.into_parts();
            tasks.extend(pump);
            tasks.push(tokio::spawn(Arc::clone(&ingestor).run(name, events)));
        }

        let monitor = LivenessMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.config.liveness.timeout,
        );
        tasks.push(tokio::spawn(
            monitor.run(self.config.liveness.sweep_interval, self.shutdown.subscribe()),
        ));

        let reconciler = PermissionReconciler::new(Arc::clone(&self.registry), Arc::clone(&self.store));
        tasks.push(tokio::spawn(
            reconciler.run(self.config.reconcile.interval, self.shutdown.subscribe()),
        ));

        tracing::info!(
            nodes = self.registry.len(),
            timeout_secs = self.config.liveness.timeout.as_secs(),
            "sensor gateway ready"
        );

        signal.await;
        tracing::info!("shutdown requested");

        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "task failed before shutdown");
            }
        }

        let offline = nodes::shutdown_all(&self.registry, self.store.as_ref());
        tracing::info!(offline, "sensor gateway stopped");
        Ok(())
    }
}
