//! Operation outcome counters and pass-through memory statistics.
//!
//! Counters are word-sized atomics bumped outside any segment lock; exact
//! consistency with map contents is not promised. Exposition backends are
//! out of scope, so the surface is a plain [`StatsSnapshot`] /
//! [`MemoryStats`] pair that an outer layer can export however it likes.

use crate::sync::{AtomicU64, Ordering};

/// Outcome of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// A new mapping was installed.
    Put,
    /// An existing mapping was replaced.
    Update,
    /// Nothing was installed (creation expired immediately).
    Noop,
}

/// Outcome of a conditional remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    /// The expected value matched; the mapping was removed.
    Removed,
    /// A mapping exists but the value did not match.
    KeyPresent,
    /// No live mapping exists.
    KeyMissing,
}

/// Outcome of a conditional replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStatus {
    /// The expected value matched; the mapping was replaced.
    Hit,
    /// A mapping exists but the value did not match.
    MissPresent,
    /// No live mapping exists.
    MissNotPresent,
}

macro_rules! op_counters {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// Per-operation outcome counters.
        #[derive(Debug, Default)]
        pub struct StoreStats {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)+
        }

        /// Point-in-time copy of every outcome counter.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)+
        }

        impl StoreStats {
            /// Copy every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

op_counters! {
    get_hit,
    get_miss,
    put_put,
    put_update,
    put_noop,
    put_if_absent_put,
    put_if_absent_hit,
    put_if_absent_noop,
    remove_removed,
    remove_miss,
    conditional_remove_removed,
    conditional_remove_key_present,
    conditional_remove_key_missing,
    replace_replaced,
    replace_miss,
    conditional_replace_hit,
    conditional_replace_miss_present,
    conditional_replace_miss_not_present,
    compute_hit,
    compute_miss,
    compute_put,
    compute_removed,
    compute_if_absent_hit,
    compute_if_absent_put,
    compute_if_absent_noop,
    get_and_fault_hit,
    get_and_fault_miss,
    compute_if_absent_and_fault_hit,
    compute_if_absent_and_fault_put,
    compute_if_absent_and_fault_noop,
    flush_hit,
    flush_miss,
    invalidate_removed,
    invalidate_miss,
    get_and_remove_hit_removed,
    get_and_remove_miss,
    install_mapping_put,
    install_mapping_noop,
    evictions,
    expirations,
}

impl StoreStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pass-through gauges sourced from the arena and the segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes carved into arena pages.
    pub allocated_memory: u64,
    /// Slot bytes held by live blocks.
    pub occupied_memory: u64,
    /// Slot bytes held by live blocks minus arena bookkeeping.
    pub data_allocated_memory: u64,
    /// Exact bytes requested by live blocks.
    pub data_occupied_memory: u64,
    /// Key and value payload bytes of live entries.
    pub data_size: u64,
    /// Block bytes held by pinned or vetoed entries.
    pub data_vital_memory: u64,
    /// Vital data plus slot-table overhead.
    pub vital_memory: u64,
    /// Number of live entries.
    pub long_size: u64,
    /// Live slots across all segments.
    pub used_slot_count: u64,
    /// Tombstoned slots across all segments.
    pub removed_slot_count: u64,
    /// Longest probe sequence observed by any segment.
    pub reprobe_length: u64,
    /// Slot-table capacity across all segments.
    pub table_capacity: u64,
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = StoreStats::default();
        StoreStats::bump(&stats.get_hit);
        StoreStats::bump(&stats.get_hit);
        StoreStats::bump(&stats.put_put);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.get_hit, 2);
        assert_eq!(snapshot.put_put, 1);
        assert_eq!(snapshot.get_miss, 0);
    }
}
