//! Shared domain types used across the store, resolver, policy engine,
//! ingestor, and worker.

pub mod event;
pub mod mapping;
pub mod node;
pub mod policy;

pub use event::{
    DedupKey, EventIntent, EventPayload, EventState, ItemDescriptor, PendingEvent,
    PlaylistDescriptor, ProviderIds, SyncEventType, SyncLogEntry, SyncOutcome, TimestampedValue,
    normalize_path,
};
pub use mapping::{ItemCacheEntry, ItemLookupKey, UserMapping};
pub use node::NodeConfig;
pub use policy::{PathSyncPolicy, RetryRule};
