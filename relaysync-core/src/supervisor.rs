//! Wires the Store, Node Clients, Resolver, Policy Engine, Ingestor, and
//! Worker together and owns their lifecycle. `relaysync-server` holds
//! exactly one `Supervisor` for the process lifetime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::ingest::EventIngestor;
use crate::node_client::{NodeClient, ReqwestNodeClient};
use crate::policy::PolicyEngine;
use crate::resolver::IdentityResolver;
use crate::store::{SqliteStore, Store};
use crate::time::{Clock, SystemClock};
use crate::types::{NodeConfig, PathSyncPolicy};
use crate::worker::{Worker, WorkerConfig};

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub database_path: PathBuf,
    pub nodes: Vec<NodeConfig>,
    pub path_sync_policy: Vec<PathSyncPolicy>,
    pub worker: WorkerConfig,
    pub debounce_window: chrono::Duration,
}

/// Live handle to a running pipeline: the readiness probe and dashboard
/// routes read through this, the webhook route goes through `ingestor()`.
pub struct Supervisor {
    store: Arc<dyn Store>,
    nodes: HashMap<String, Arc<dyn NodeClient>>,
    ingestor: Arc<EventIngestor>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
    worker_task: JoinHandle<()>,
}

impl Supervisor {
    pub async fn bootstrap(config: SupervisorConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.database_path).await?);

        let reaped = store.reap_orphans().await?;
        if reaped > 0 {
            warn!(reaped, "resumed after crash, requeued orphaned events");
        }

        let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
        for node_config in &config.nodes {
            let client: Arc<dyn NodeClient> = Arc::new(ReqwestNodeClient::new(node_config.clone()));
            nodes.insert(node_config.name.clone(), client);
        }

        for (name, client) in &nodes {
            let health = client.health().await;
            if health.reachable {
                info!(node = %name, version = ?health.version, "node reachable");
            } else {
                warn!(node = %name, "node unreachable at startup, will retry through normal sync flow");
            }
        }

        let resolver = IdentityResolver::new(store.clone(), nodes.clone());
        let policy = PolicyEngine::new(config.path_sync_policy);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let node_names: Vec<String> = config.nodes.iter().map(|n| n.name.clone()).collect();
        let ingestor = Arc::new(EventIngestor::new(store.clone(), node_names, config.debounce_window));

        let worker = Arc::new(Worker::new(
            store.clone(),
            nodes.clone(),
            resolver,
            policy,
            clock,
            config.worker,
        ));

        let cancel = CancellationToken::new();
        let worker_task = tokio::spawn(worker.run(cancel.clone()));

        Ok(Self {
            store,
            nodes,
            ingestor,
            ready: Arc::new(AtomicBool::new(true)),
            cancel,
            worker_task,
        })
    }

    pub fn ingestor(&self) -> Arc<EventIngestor> {
        self.ingestor.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn configured_nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// `GET /readyz`: false once shutdown has started.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Probes every configured node's `/health` concurrently and reports
    /// whether at least one answered. Part of the `/readyz` contract
    /// alongside [`Supervisor::is_ready`] — a process that can't reach any
    /// node isn't ready to sync even if its own worker loop is alive.
    pub async fn any_node_reachable(&self) -> bool {
        let checks = self.nodes.values().map(|client| {
            let client = client.clone();
            async move { client.health().await.reachable }
        });
        futures::future::join_all(checks).await.into_iter().any(|ok| ok)
    }

    /// Signals the worker to stop after draining its current batch (up to
    /// the worker's 10s drain budget), then waits for the task to exit.
    pub async fn shutdown(self) {
        self.ready.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Err(err) = self.worker_task.await {
            warn!(%err, "worker task panicked during shutdown");
        }
        info!("supervisor shutdown complete");
    }
}
