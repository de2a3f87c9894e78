//! Offline-first synchronization.
//!
//! ```text
//! caller ──▶ OfflineAdapter ──▶ local adapter        (synchronous, authoritative now)
//!                 │
//!                 └─▶ SyncQueue ──drain──▶ remote     (ordered, eventually)
//!                        │
//!                   KeyValueStore (JSON array under one key)
//! ```
//!
//! Drains are driven by writes, by [`Connectivity`] transitions, and by
//! [`OfflineAdapter::tick`] once a backoff has elapsed. Remote change
//! notifications for declared collections keep the cache current.

mod connectivity;
mod invalidation;
mod kv;
mod offline;
mod queue;
mod state;

pub use connectivity::Connectivity;
pub use invalidation::{CacheAction, ChangeKind, ChangeNotification};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use offline::{DrainOutcome, OfflineAdapter, OfflineAdapterBuilder, SyncEvent, SyncStatus};
pub use queue::{parse_queue, SyncOperation, SyncOperationType, SyncQueue};
pub use state::{Clock, ManualClock, SyncMachine, SyncState, SyncTrigger, SystemClock};
