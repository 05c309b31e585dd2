//! Full-stack scenarios driving Ingestor + Worker together through
//! `InMemoryStore`/`ScriptedNodeClient`, one per notable path through the
//! pipeline plus the invariants called out as testable properties.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use relaysync_core::node_client::{NodeClient, RemoteUser};
use relaysync_core::test_support::{InMemoryStore, ScriptedNodeClient};
use relaysync_core::time::TestClock;
use relaysync_core::{
    EventIngestor, IdentityResolver, ItemDescriptor, PathSyncPolicy, PolicyEngine, SourceEvent,
    Store, SyncEventType, TimestampedValue,
};
use relaysync_core::worker::{Worker, WorkerConfig};

fn source(event_type: SyncEventType, node: &str, item_path: &str) -> SourceEvent {
    SourceEvent {
        event_type,
        source_node: node.to_string(),
        source_user_id: "u-src".to_string(),
        username: "alice".to_string(),
        item: ItemDescriptor {
            path: Some(item_path.to_string()),
            providers: Default::default(),
        },
        played: None,
        position_ticks: None,
        favorite: None,
        rating: None,
        played_to_completion: false,
        playlist: None,
    }
}

fn worker(
    store: Arc<dyn Store>,
    nodes: HashMap<String, Arc<dyn NodeClient>>,
    policy: PolicyEngine,
) -> Arc<Worker> {
    let resolver = IdentityResolver::new(store.clone(), nodes.clone());
    Arc::new(Worker::new(
        store,
        nodes,
        resolver,
        policy,
        Arc::new(TestClock::new()),
        WorkerConfig::default(),
    ))
}

#[tokio::test]
async fn progress_propagates_from_one_node_to_another() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let target: Arc<dyn NodeClient> = Arc::new(
        ScriptedNodeClient::new("lan")
            .with_users(vec![RemoteUser {
                remote_id: "lan-u".to_string(),
                username: "alice".to_string(),
            }])
            .with_item_by_path("/movies/dune.mkv", Some("lan-item")),
    );
    let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
    nodes.insert("lan".to_string(), target);

    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );
    let mut event = source(SyncEventType::Progress, "wan", "/movies/dune.mkv");
    event.position_ticks = Some(TimestampedValue {
        value: 30_000_000_000,
        source_timestamp: Utc::now(),
    });
    let outcome = ingestor.ingest(event, Utc::now()).await.unwrap();
    assert_eq!(outcome.enqueued_ids.len(), 1);

    let w = worker(store.clone(), nodes, PolicyEngine::new(vec![]));
    let processed = w.run_once().await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn watched_fans_out_to_every_other_node() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
    for name in ["lan", "wan2"] {
        let client: Arc<dyn NodeClient> = Arc::new(
            ScriptedNodeClient::new(name)
                .with_users(vec![RemoteUser {
                    remote_id: format!("{name}-u"),
                    username: "alice".to_string(),
                }])
                .with_item_by_path("/shows/ep1.mkv", Some(format!("{name}-item").as_str())),
        );
        nodes.insert(name.to_string(), client);
    }

    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string(), "wan2".to_string()],
        chrono::Duration::seconds(30),
    );
    let mut event = source(SyncEventType::Watched, "wan", "/shows/ep1.mkv");
    event.played = Some(TimestampedValue {
        value: true,
        source_timestamp: Utc::now(),
    });
    event.played_to_completion = true;
    let outcome = ingestor.ingest(event, Utc::now()).await.unwrap();
    assert_eq!(outcome.enqueued_ids.len(), 2);

    let w = worker(store.clone(), nodes, PolicyEngine::new(vec![]));
    let processed = w.run_once().await.unwrap();
    assert_eq!(processed, 2);
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn item_absent_retries_then_resolves_once_cached() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    // Item is absent on first lookup.
    let target: Arc<dyn NodeClient> = Arc::new(
        ScriptedNodeClient::new("lan")
            .with_users(vec![RemoteUser {
                remote_id: "lan-u".to_string(),
                username: "alice".to_string(),
            }])
            .with_item_by_path("/movies/late.mkv", None),
    );
    let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
    nodes.insert("lan".to_string(), target);

    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );
    let mut event = source(SyncEventType::Favorite, "wan", "/movies/late.mkv");
    event.favorite = Some(TimestampedValue {
        value: true,
        source_timestamp: Utc::now(),
    });
    ingestor.ingest(event, Utc::now()).await.unwrap();

    let policy = PolicyEngine::new(vec![PathSyncPolicy {
        prefix: "/movies".to_string(),
        absent_retry_count: 3,
        retry_delay_seconds: 60,
    }]);
    let w = worker(store.clone(), nodes, policy);
    w.run_once().await.unwrap();

    let waiting = store.list_pending(Some("waiting_item")).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].item_not_found_count, 1);
}

#[tokio::test]
async fn item_never_found_fails_after_policy_exhausted() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let target: Arc<dyn NodeClient> = Arc::new(
        ScriptedNodeClient::new("lan")
            .with_users(vec![RemoteUser {
                remote_id: "lan-u".to_string(),
                username: "alice".to_string(),
            }])
            .with_item_by_path("/movies/ghost.mkv", None),
    );
    let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
    nodes.insert("lan".to_string(), target);

    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );
    let mut event = source(SyncEventType::Favorite, "wan", "/movies/ghost.mkv");
    event.favorite = Some(TimestampedValue {
        value: true,
        source_timestamp: Utc::now(),
    });
    ingestor.ingest(event, Utc::now()).await.unwrap();

    // max_attempts = 0 means the very first ItemAbsent fails immediately.
    let policy = PolicyEngine::new(vec![PathSyncPolicy {
        prefix: "/movies".to_string(),
        absent_retry_count: 0,
        retry_delay_seconds: 60,
    }]);
    let w = worker(store.clone(), nodes, policy);
    w.run_once().await.unwrap();

    assert_eq!(store.queue_depth().await.unwrap(), 0);
    let log = store
        .query_sync_log(Default::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(log.len(), 1);
    assert!(!log[0].success);
}

#[tokio::test]
async fn repeated_notifications_coalesce_into_one_row() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );

    let now = Utc::now();
    for ticks in [1_000_000_000i64, 2_000_000_000, 3_000_000_000] {
        let mut event = source(SyncEventType::Progress, "wan", "/movies/a.mkv");
        event.position_ticks = Some(TimestampedValue {
            value: ticks,
            source_timestamp: now,
        });
        ingestor.ingest(event, now).await.unwrap();
    }

    assert_eq!(store.queue_depth().await.unwrap(), 1);
    let pending = store.list_pending(None).await.unwrap();
    assert_eq!(
        pending[0].payload.position_ticks.as_ref().unwrap().value,
        3_000_000_000
    );
}

#[tokio::test]
async fn user_created_propagates_with_generated_password() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let target: Arc<dyn NodeClient> = Arc::new(ScriptedNodeClient::new("lan"));
    let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
    nodes.insert("lan".to_string(), target.clone());

    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );
    let outcome = ingestor
        .ingest(source(SyncEventType::UserCreated, "wan", "/"), Utc::now())
        .await
        .unwrap();
    assert!(outcome.generated_password.is_some());

    let w = worker(store.clone(), nodes, PolicyEngine::new(vec![]));
    w.run_once().await.unwrap();

    let remote_users = target.list_users().await.unwrap();
    assert_eq!(remote_users.len(), 1);
    assert_eq!(remote_users[0].username, "alice");
    assert_eq!(
        store.get_user_mapping("alice", "lan").await.unwrap().as_deref(),
        Some(remote_users[0].remote_id.as_str())
    );
}

#[tokio::test]
async fn user_deleted_removes_mapping_and_remote_account() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let target: Arc<dyn NodeClient> = Arc::new(ScriptedNodeClient::new("lan").with_users(vec![RemoteUser {
        remote_id: "lan-u".to_string(),
        username: "alice".to_string(),
    }]));
    let mut nodes: HashMap<String, Arc<dyn NodeClient>> = HashMap::new();
    nodes.insert("lan".to_string(), target.clone());

    store.put_user_mapping("alice", "lan", "lan-u").await.unwrap();

    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );
    ingestor
        .ingest(source(SyncEventType::UserDeleted, "wan", "/"), Utc::now())
        .await
        .unwrap();

    let w = worker(store.clone(), nodes, PolicyEngine::new(vec![]));
    w.run_once().await.unwrap();

    assert!(target.list_users().await.unwrap().is_empty());
    assert!(store.get_user_mapping("alice", "lan").await.unwrap().is_none());
}

#[tokio::test]
async fn crash_recovery_requeues_rows_left_processing() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );
    ingestor
        .ingest(source(SyncEventType::Favorite, "wan", "/movies/a.mkv"), Utc::now())
        .await
        .unwrap();

    // Simulate the worker leasing a row and the process crashing before
    // finalize ever runs.
    let leased = store.lease_due(10, Utc::now()).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(store.list_pending(Some("pending")).await.unwrap().len(), 0);

    let reaped = store.reap_orphans().await.unwrap();
    assert_eq!(reaped, 1);
    assert_eq!(store.list_pending(Some("pending")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn coalesce_during_in_flight_apply_is_not_lost() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let now = Utc::now();
    let mut first = source(SyncEventType::Favorite, "wan", "/movies/a.mkv");
    first.favorite = Some(TimestampedValue {
        value: true,
        source_timestamp: now,
    });
    let ingestor = EventIngestor::new(
        store.clone(),
        vec!["wan".to_string(), "lan".to_string()],
        chrono::Duration::seconds(30),
    );
    ingestor.ingest(first, now).await.unwrap();

    let leases = store.lease_due(10, now).await.unwrap();
    assert_eq!(leases.len(), 1);

    // A second notification lands and coalesces into the same row while the
    // worker is still "processing" the first lease (e.g. awaiting a node
    // client call).
    let mut second = source(SyncEventType::Favorite, "wan", "/movies/a.mkv");
    second.favorite = Some(TimestampedValue {
        value: false,
        source_timestamp: now + chrono::Duration::seconds(1),
    });
    ingestor.ingest(second, now + chrono::Duration::seconds(1)).await.unwrap();

    // finalize() must detect the mid-flight coalesce and requeue rather than
    // discard the row, even though the original outcome was Applied.
    use relaysync_core::store::Lease;
    let lease = Lease {
        event: leases[0].event.clone(),
    };
    store
        .finalize(
            &lease,
            relaysync_core::SyncOutcome::Applied {
                synced_value: "favorite=true".to_string(),
            },
            now,
        )
        .await
        .unwrap();

    let remaining = store.list_pending(None).await.unwrap();
    assert_eq!(remaining.len(), 1, "coalesced update must survive finalize");
    assert_eq!(
        remaining[0].payload.favorite.as_ref().unwrap().value,
        false
    );
}
