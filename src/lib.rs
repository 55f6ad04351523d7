//! offheap-store: the off-heap authoritative tier of a tiered key-value
//! cache store.
//!
//! The store is a concurrent, segmented hash map whose entries live in an
//! explicitly managed memory region. It enforces time-based expiry through a
//! pluggable policy, evicts under memory pressure, batches change events per
//! operation, and cooperates with an upper caching tier through a
//! fault/flush/invalidate protocol.
//!
//! # Architecture
//!
//! ```text
//!                  +--------------------------------+
//!                  |          OffHeapStore          |
//!                  |  (tier facade, expiry policy,  |
//!                  |   event sinks, outcome stats)  |
//!                  +---------------+----------------+
//!                                  |
//!                                  v
//!                  +--------------------------------+
//!                  |          SegmentedMap          |
//!                  | (hash fan-out, oversize walk,  |
//!                  |     cross-segment shrink)      |
//!                  +---+----------+----------+-----+
//!                      |          |          |
//!                      v          v          v
//!                 +---------+---------+---------+
//!                 | Segment | Segment | Segment |  one write lock each,
//!                 | (probe, | (probe, | (probe, |  atomic remap, clock
//!                 |  evict) |  evict) |  evict) |  eviction
//!                 +----+----+----+----+----+----+
//!                      |         |         |
//!                      v         v         v
//!                  +--------------------------------+
//!                  |             Arena              |
//!                  |  (size-class slabs over one    |
//!                  |   region, lock-free recycling) |
//!                  +--------------------------------+
//! ```
//!
//! # Example
//!
//! ```
//! use offheap_store::{OffHeapStore, StoreConfig};
//!
//! let store = OffHeapStore::new(
//!     StoreConfig::new().with_arena_capacity(4 * 1024 * 1024),
//! )
//! .unwrap();
//!
//! store.put(b"key", b"value").unwrap();
//! let holder = store.get(b"key").unwrap().unwrap();
//! assert_eq!(holder.value(), b"value");
//! ```
//!
//! # Tiering
//!
//! As the **authoritative tier**, the store is the source of truth: a miss
//! here means the entry does not exist. `get_and_fault` pins an entry while
//! handing a detached copy to the tier above; `flush` pushes the upper
//! tier's metadata back and unpins.
//!
//! As a **lower caching tier**, the store accepts `install_mapping` from the
//! tier above, gives entries up via `get_and_remove`, and reports every
//! departure (eviction, expiry, invalidation) to the registered
//! [`InvalidationListener`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod arena;
mod config;
mod error;
mod events;
mod expiry;
mod holder;
mod map;
mod segment;
mod stats;
mod store;
mod sync;
mod time;

pub use config::StoreConfig;
pub use error::{DynError, StoreError, StoreResult};
pub use events::{
    EventSink, InvalidationListener, ListenerDispatcher, NullInvalidationListener,
    NullStoreEventDispatcher, StoreEvent, StoreEventDispatcher, StoreEventListener,
};
pub use expiry::{Expiry, ExpiryDuration, NoExpiry, TimeToLive};
pub use holder::{ValueHolder, NO_EXPIRE};
pub use segment::{EvictionVeto, NeverVeto};
pub use stats::{
    MemoryStats, PutStatus, RemoveStatus, ReplaceStatus, StatsSnapshot, StoreStats,
};
pub use store::{OffHeapStore, OffHeapStoreBuilder};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
