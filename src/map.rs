//! Segmented backing map.
//!
//! Fans out over a power-of-two number of [`Segment`]s. The upper hash bits
//! select the segment and the lower bits drive the in-segment probe, so the
//! two never collapse onto each other.
//!
//! The map also owns the cross-segment half of the oversize story:
//! `shrink_others` reclaims space from segments other than the requesting
//! key's, and the veto walk visits every segment (one lock at a time) when
//! nothing else yields.

use std::hash::BuildHasher;
use std::sync::Arc;

use crate::arena::Arena;
use crate::error::StoreResult;
use crate::events::EventSink;
use crate::holder::{ValueHolder, ENTRY_HEADER_LEN};
use crate::segment::{
    ComputeOutcome, EvictionHook, EvictionVeto, PendingInstall, Remap, Segment, VetoWalk,
};

pub(crate) struct SegmentedMap {
    segments: Box<[Segment]>,
    hasher: ahash::RandomState,
    arena: Arc<Arena>,
    shrink_budget: usize,
}

impl SegmentedMap {
    pub(crate) fn new(
        segment_count: usize,
        initial_slots_per_segment: usize,
        shrink_budget: usize,
        arena: Arc<Arena>,
        veto: Arc<dyn EvictionVeto>,
        hook: Arc<dyn EvictionHook>,
    ) -> Self {
        let segment_count = segment_count.next_power_of_two().max(1);
        let segments = (0..segment_count)
            .map(|_| {
                Segment::new(
                    initial_slots_per_segment,
                    arena.clone(),
                    veto.clone(),
                    hook.clone(),
                )
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            segments,
            hasher: ahash::RandomState::new(),
            arena,
            shrink_budget,
        }
    }

    /// Hash a key once; every per-key operation reuses the value.
    #[inline]
    pub(crate) fn hash_of(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    fn segment_for(&self, hash: u64) -> &Segment {
        // Upper bits pick the segment; the probe consumes the lower bits.
        let idx = ((hash >> 32) as usize) & (self.segments.len() - 1);
        &self.segments[idx]
    }

    /// Next holder id for a key routed by `hash`.
    pub(crate) fn next_id_for(&self, hash: u64) -> u64 {
        self.segment_for(hash).next_id()
    }

    pub(crate) fn compute<F>(
        &self,
        key: &[u8],
        hash: u64,
        pin_on_install: bool,
        sink: &mut EventSink,
        f: F,
    ) -> StoreResult<ComputeOutcome>
    where
        F: FnOnce(&[u8], Option<&mut ValueHolder>, &mut EventSink) -> StoreResult<Remap>,
    {
        self.segment_for(hash).compute(key, hash, pin_on_install, sink, f)
    }

    pub(crate) fn compute_if_present<F>(
        &self,
        key: &[u8],
        hash: u64,
        sink: &mut EventSink,
        f: F,
    ) -> StoreResult<ComputeOutcome>
    where
        F: FnOnce(&[u8], Option<&mut ValueHolder>, &mut EventSink) -> StoreResult<Remap>,
    {
        self.segment_for(hash).compute_if_present(key, hash, sink, f)
    }

    pub(crate) fn compute_if_present_and_pin<F>(
        &self,
        key: &[u8],
        hash: u64,
        sink: &mut EventSink,
        f: F,
    ) -> StoreResult<ComputeOutcome>
    where
        F: FnOnce(&[u8], Option<&mut ValueHolder>, &mut EventSink) -> StoreResult<Remap>,
    {
        self.segment_for(hash)
            .compute_if_present_and_pin(key, hash, sink, f)
    }

    pub(crate) fn compute_if_pinned<F, P>(
        &self,
        key: &[u8],
        hash: u64,
        sink: &mut EventSink,
        f: F,
        unpin_if: P,
    ) -> StoreResult<bool>
    where
        F: FnOnce(&[u8], &mut ValueHolder, &mut EventSink) -> StoreResult<Remap>,
        P: FnOnce(&ValueHolder) -> bool,
    {
        self.segment_for(hash)
            .compute_if_pinned(key, hash, sink, f, unpin_if)
    }

    pub(crate) fn install_prepared(
        &self,
        key: &[u8],
        hash: u64,
        pending: PendingInstall,
        sink: &mut EventSink,
    ) -> StoreResult<ComputeOutcome> {
        self.segment_for(hash).install_prepared(key, hash, pending, sink)
    }

    /// Evict from segments other than the one `hash` routes to.
    /// Returns whether any space was freed.
    pub(crate) fn shrink_others(&self, hash: u64, sink: &mut EventSink) -> bool {
        let owner = ((hash >> 32) as usize) & (self.segments.len() - 1);
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx == owner {
                continue;
            }
            if segment.shrink(self.shrink_budget, sink) {
                return true;
            }
        }
        false
    }

    /// Walk every segment, read-and-setting `VETOED` on each present slot.
    /// The walk stops early when a slot is found already vetoed: a previous
    /// walk came through and freed nothing, so remediation is exhausted.
    pub(crate) fn mark_all_vetoed(&self) -> VetoWalk {
        let mut total = VetoWalk::default();
        for segment in self.segments.iter() {
            let walk = segment.mark_all_vetoed();
            total.marked += walk.marked;
            if walk.found_prior {
                total.found_prior = true;
                break;
            }
        }
        total
    }

    /// Drop every mapping in every segment.
    pub(crate) fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Weakly consistent iteration: each segment is snapshotted under its
    /// own lock when the iterator reaches it.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Box<[u8]>, ValueHolder)> + '_ {
        self.segments.iter().flat_map(|segment| segment.snapshot())
    }

    /// Number of live entries.
    pub(crate) fn long_size(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.used_slot_count() as u64)
            .sum()
    }

    pub(crate) fn used_slot_count(&self) -> u64 {
        self.long_size()
    }

    pub(crate) fn removed_slot_count(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.removed_slot_count() as u64)
            .sum()
    }

    pub(crate) fn reprobe_length(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.reprobe_length() as u64)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn table_capacity(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.table_capacity() as u64)
            .sum()
    }

    /// Payload bytes (keys + values) of live entries.
    pub(crate) fn data_size(&self) -> u64 {
        self.arena
            .data_occupied_memory()
            .saturating_sub(ENTRY_HEADER_LEN as u64 * self.long_size())
    }

    /// Block bytes held by entries eviction cannot reclaim.
    pub(crate) fn data_vital_memory(&self) -> u64 {
        self.segments.iter().map(|s| s.vital_bytes()).sum()
    }

    /// Vital data plus slot-table overhead.
    pub(crate) fn vital_memory(&self) -> u64 {
        let table_bytes: u64 = self.segments.iter().map(|s| s.table_bytes()).sum();
        self.data_vital_memory() + table_bytes
    }

    #[inline]
    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }
}
