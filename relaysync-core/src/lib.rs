pub mod error;
pub mod ingest;
pub mod node_client;
pub mod policy;
pub mod resolver;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod time;
pub mod types;
pub mod worker;

pub use error::{NodeError, RelayError, Result, StoreError};
pub use ingest::{EventIngestor, IngestOutcome, SourceEvent};
pub use node_client::{NodeClient, ReqwestNodeClient};
pub use policy::PolicyEngine;
pub use resolver::{IdentityResolver, ResolveError};
pub use store::{SqliteStore, Store};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use time::{Clock, SystemClock, TestClock};
pub use types::{
    DedupKey, EventIntent, EventPayload, EventState, ItemDescriptor, ItemLookupKey, NodeConfig,
    PathSyncPolicy, PendingEvent, PlaylistDescriptor, ProviderIds, RetryRule, SyncEventType,
    SyncLogEntry, SyncOutcome, TimestampedValue,
};
