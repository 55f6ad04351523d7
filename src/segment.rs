//! Locked open-addressed segment over the arena.
//!
//! Each segment owns one exclusive lock; point lookups take it too, which is
//! what makes the atomic-remap contract possible. A remap runs its closure
//! at most once while the lock is held, observes the decoded current holder,
//! and either removes, retains (with optional write-back), or installs.
//!
//! Keys and values live in arena blocks; the slot table holds only the
//! 64-bit key hash, the block handle, and the metadata bits. Linear probing
//! with tombstones keeps probe chains intact across removals; the table
//! doubles past 3/4 load, dropping tombstones.
//!
//! Capacity eviction is a clock hand over the slot table. Pinned and vetoed
//! slots are never chosen; the eviction veto collaborator is consulted per
//! candidate and a veto verdict is sticky (the `VETOED` bit).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{Arena, BlockHandle};
use crate::error::{DynError, StoreResult};
use crate::events::EventSink;
use crate::holder::{self, ValueHolder};
use crate::sync::{AtomicU64, AtomicUsize, Ordering};

/// Slot holds a live entry.
const PRESENT: u8 = 0b0001;
/// Slot was emptied; probe chains continue through it.
const TOMBSTONE: u8 = 0b0010;
/// Entry is faulted into an upper tier; never evicted.
const PINNED: u8 = 0b0100;
/// Eviction policy refused this entry; skipped by the clock hand.
const VETOED: u8 = 0b1000;

/// Eviction policy collaborator.
///
/// A `true` verdict marks the entry `VETOED`; the eviction pass skips it
/// from then on. Errors are logged and treated as "not vetoed".
pub trait EvictionVeto: Send + Sync {
    /// Whether this entry must not be evicted.
    fn vetoes(&self, key: &[u8], holder: &ValueHolder) -> Result<bool, DynError>;
}

/// Veto policy that never refuses an eviction. The safe default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverVeto;

impl EvictionVeto for NeverVeto {
    fn vetoes(&self, _key: &[u8], _holder: &ValueHolder) -> Result<bool, DynError> {
        Ok(false)
    }
}

/// Observer of capacity evictions, wired by the facade to the invalidation
/// listener and the eviction outcome counter.
pub(crate) trait EvictionHook: Send + Sync {
    fn on_eviction(&self, key: &[u8], holder: &ValueHolder);
}

/// Hook that observes nothing.
#[cfg(test)]
pub(crate) struct NullEvictionHook;

#[cfg(test)]
impl EvictionHook for NullEvictionHook {
    fn on_eviction(&self, _key: &[u8], _holder: &ValueHolder) {}
}

/// Verdict of a remap closure.
pub(crate) enum Remap {
    /// Drop the mapping. No-op when the key is absent.
    Remove,
    /// Keep the current mapping, honoring a requested write-back.
    Retain,
    /// Replace or create the mapping with this holder.
    Install(ValueHolder),
}

/// A computed holder whose allocation failed; carried out to the oversize
/// protocol so the closure is never re-run.
pub(crate) struct PendingInstall {
    pub(crate) holder: ValueHolder,
    pub(crate) pin: bool,
}

/// Result of a remap attempt.
pub(crate) enum ComputeOutcome {
    /// The remap completed; the installed or retained holder, if any.
    Done(Option<ValueHolder>),
    /// Allocation failed after local eviction was exhausted.
    Oversize(PendingInstall),
}

/// Result of a veto walk over one or more segments.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VetoWalk {
    /// A slot was already vetoed by a previous walk.
    pub(crate) found_prior: bool,
    /// Slots freshly flipped to vetoed.
    pub(crate) marked: usize,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    hash: u64,
    handle: Option<BlockHandle>,
    flags: u8,
}

impl Slot {
    const EMPTY: Slot = Slot {
        hash: 0,
        handle: None,
        flags: 0,
    };

    #[inline]
    fn is_present(&self) -> bool {
        self.flags & PRESENT != 0
    }

    #[inline]
    fn is_vital(&self) -> bool {
        self.flags & (PINNED | VETOED) != 0
    }
}

struct Core {
    slots: Box<[Slot]>,
    /// Clock hand for eviction scans.
    clock: usize,
}

enum Probe {
    Found(usize),
    Vacant(usize),
}

struct RemapOpts {
    pin_on_install: bool,
    require_present: bool,
    pin_result: bool,
}

/// One segment of the backing map.
pub(crate) struct Segment {
    core: Mutex<Core>,
    arena: Arc<Arena>,
    veto: Arc<dyn EvictionVeto>,
    hook: Arc<dyn EvictionHook>,
    next_id: AtomicU64,

    used_slots: AtomicUsize,
    removed_slots: AtomicUsize,
    reprobe_len: AtomicUsize,
    capacity: AtomicUsize,
    vital_bytes: AtomicU64,
}

impl Segment {
    pub(crate) fn new(
        initial_capacity: usize,
        arena: Arc<Arena>,
        veto: Arc<dyn EvictionVeto>,
        hook: Arc<dyn EvictionHook>,
    ) -> Self {
        let capacity = initial_capacity.next_power_of_two().max(8);
        Self {
            core: Mutex::new(Core {
                slots: vec![Slot::EMPTY; capacity].into_boxed_slice(),
                clock: 0,
            }),
            arena,
            veto,
            hook,
            next_id: AtomicU64::new(0),
            used_slots: AtomicUsize::new(0),
            removed_slots: AtomicUsize::new(0),
            reprobe_len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            vital_bytes: AtomicU64::new(0),
        }
    }

    /// Next holder id for a mapping routed to this segment. Strictly
    /// increasing, so updates always carry a larger id than what they
    /// replace.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Atomic remap. The closure runs at most once, under the segment lock,
    /// with the decoded current holder.
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
        self.remap(
            key,
            hash,
            RemapOpts {
                pin_on_install,
                require_present: false,
                pin_result: false,
            },
            sink,
            f,
        )
    }

    /// Remap that only runs the closure when a mapping is present.
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
        self.remap(
            key,
            hash,
            RemapOpts {
                pin_on_install: false,
                require_present: true,
                pin_result: false,
            },
            sink,
            f,
        )
    }

    /// Like [`Segment::compute_if_present`], additionally pinning the slot
    /// when the remap yields a mapping.
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
        self.remap(
            key,
            hash,
            RemapOpts {
                pin_on_install: false,
                require_present: true,
                pin_result: true,
            },
            sink,
            f,
        )
    }

    /// Remap restricted to pinned slots.
    ///
    /// `unpin_if` is evaluated on the holder as found; when it holds, the
    /// slot is unpinned after the closure runs. Returns the predicate's
    /// verdict, `false` when the slot is absent or not pinned.
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
        let mut core = self.core.lock();
        let idx = match self.probe(&core, hash, key) {
            Probe::Found(idx) => idx,
            Probe::Vacant(_) => return Ok(false),
        };
        if core.slots[idx].flags & PINNED == 0 {
            return Ok(false);
        }

        let mut current = self.decode(&core.slots[idx]);
        let unpin = unpin_if(&current);
        let remap = f(key, &mut current, sink)?;

        match remap {
            Remap::Remove => {
                self.clear_slot(&mut core, idx);
            }
            Remap::Retain => {
                if current.is_dirty() {
                    self.write_back(&core, idx, &current);
                }
                if unpin {
                    self.set_flag(&mut core, idx, PINNED, false);
                }
            }
            // Pinned remaps only flush metadata or expire; nothing installs.
            Remap::Install(_) => unreachable!("pinned remap cannot install"),
        }
        Ok(unpin)
    }

    /// Re-attempt the install of a holder whose allocation failed, after the
    /// oversize protocol has run. The original closure is not re-invoked.
    pub(crate) fn install_prepared(
        &self,
        key: &[u8],
        hash: u64,
        pending: PendingInstall,
        sink: &mut EventSink,
    ) -> StoreResult<ComputeOutcome> {
        let mut core = self.core.lock();
        let idx = match self.probe(&core, hash, key) {
            Probe::Found(idx) | Probe::Vacant(idx) => idx,
        };
        match self.install_at(&mut core, idx, key, hash, pending.holder, pending.pin, sink) {
            Ok(installed) => {
                self.maybe_grow(&mut core);
                Ok(ComputeOutcome::Done(Some(installed)))
            }
            Err(pending) => {
                drop(core);
                Ok(ComputeOutcome::Oversize(pending))
            }
        }
    }

    /// Evict until `budget` entries were reclaimed or no candidate remains.
    /// Returns whether anything was freed.
    pub(crate) fn shrink(&self, budget: usize, sink: &mut EventSink) -> bool {
        let mut core = self.core.lock();
        let mut freed = false;
        for _ in 0..budget {
            if self.evict_one(&mut core, sink, None) {
                freed = true;
            } else {
                break;
            }
        }
        freed
    }

    /// Read-and-set `VETOED` on every present slot.
    ///
    /// Stops and reports as soon as a slot is found already vetoed: a
    /// previous walk came through and yielded nothing. Otherwise counts the
    /// slots freshly marked.
    pub(crate) fn mark_all_vetoed(&self) -> VetoWalk {
        let mut core = self.core.lock();
        let mut marked = 0;
        for idx in 0..core.slots.len() {
            let slot = core.slots[idx];
            if slot.is_present() {
                if slot.flags & VETOED != 0 {
                    return VetoWalk {
                        found_prior: true,
                        marked,
                    };
                }
                self.set_flag(&mut core, idx, VETOED, true);
                marked += 1;
            }
        }
        VetoWalk {
            found_prior: false,
            marked,
        }
    }

    /// Drop every mapping. No events are recorded.
    pub(crate) fn clear(&self) {
        let mut core = self.core.lock();
        for idx in 0..core.slots.len() {
            if core.slots[idx].is_present() {
                if let Some(handle) = core.slots[idx].handle {
                    self.arena.free(handle);
                }
            }
            core.slots[idx] = Slot::EMPTY;
        }
        core.clock = 0;
        self.used_slots.store(0, Ordering::Relaxed);
        self.removed_slots.store(0, Ordering::Relaxed);
        self.vital_bytes.store(0, Ordering::Relaxed);
    }

    /// Decoded copies of every present entry, taken under the lock.
    pub(crate) fn snapshot(&self) -> Vec<(Box<[u8]>, ValueHolder)> {
        let core = self.core.lock();
        let mut entries = Vec::with_capacity(self.used_slots.load(Ordering::Relaxed));
        for slot in core.slots.iter() {
            if slot.is_present() {
                let handle = slot.handle.expect("present slot has a block");
                // SAFETY: segment lock held; the block is live.
                let block = unsafe { self.arena.block_bytes(handle) };
                let mut holder = holder::decode_entry(block);
                holder.set_slot_flags(slot.flags & PINNED != 0, slot.flags & VETOED != 0);
                entries.push((holder::entry_key(block).into(), holder));
            }
        }
        entries
    }

    /// Number of live entries.
    pub(crate) fn used_slot_count(&self) -> usize {
        self.used_slots.load(Ordering::Relaxed)
    }

    /// Number of tombstoned slots.
    pub(crate) fn removed_slot_count(&self) -> usize {
        self.removed_slots.load(Ordering::Relaxed)
    }

    /// Longest probe sequence observed.
    pub(crate) fn reprobe_length(&self) -> usize {
        self.reprobe_len.load(Ordering::Relaxed)
    }

    /// Current slot table capacity.
    pub(crate) fn table_capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Bytes held by entries the eviction pass cannot reclaim (pinned or
    /// vetoed).
    pub(crate) fn vital_bytes(&self) -> u64 {
        self.vital_bytes.load(Ordering::Relaxed)
    }

    /// Bytes of slot-table overhead.
    pub(crate) fn table_bytes(&self) -> u64 {
        (self.table_capacity() * std::mem::size_of::<Slot>()) as u64
    }

    fn remap<F>(
        &self,
        key: &[u8],
        hash: u64,
        opts: RemapOpts,
        sink: &mut EventSink,
        f: F,
    ) -> StoreResult<ComputeOutcome>
    where
        F: FnOnce(&[u8], Option<&mut ValueHolder>, &mut EventSink) -> StoreResult<Remap>,
    {
        let mut core = self.core.lock();
        let (idx, mut current) = match self.probe(&core, hash, key) {
            Probe::Found(idx) => (idx, Some(self.decode(&core.slots[idx]))),
            Probe::Vacant(idx) => (idx, None),
        };
        if opts.require_present && current.is_none() {
            return Ok(ComputeOutcome::Done(None));
        }

        let remap = f(key, current.as_mut(), sink)?;

        match remap {
            Remap::Remove => {
                if current.is_some() {
                    self.clear_slot(&mut core, idx);
                }
                Ok(ComputeOutcome::Done(None))
            }
            Remap::Retain => match current {
                None => Ok(ComputeOutcome::Done(None)),
                Some(holder) => {
                    if holder.is_dirty() {
                        self.write_back(&core, idx, &holder);
                    }
                    let mut holder = holder;
                    if opts.pin_result {
                        self.set_flag(&mut core, idx, PINNED, true);
                        holder.set_slot_flags(true, holder.is_vetoed());
                    }
                    Ok(ComputeOutcome::Done(Some(holder)))
                }
            },
            Remap::Install(holder) => {
                let pin = opts.pin_on_install || opts.pin_result;
                match self.install_at(&mut core, idx, key, hash, holder, pin, sink) {
                    Ok(installed) => {
                        self.maybe_grow(&mut core);
                        Ok(ComputeOutcome::Done(Some(installed)))
                    }
                    Err(pending) => {
                        drop(core);
                        Ok(ComputeOutcome::Oversize(pending))
                    }
                }
            }
        }
    }

    /// Locate `key` or the slot it would occupy.
    fn probe(&self, core: &Core, hash: u64, key: &[u8]) -> Probe {
        let mask = core.slots.len() - 1;
        let mut idx = hash as usize & mask;
        let mut first_tombstone = None;
        let mut distance = 0;

        loop {
            let slot = &core.slots[idx];
            if slot.is_present() {
                if slot.hash == hash {
                    let handle = slot.handle.expect("present slot has a block");
                    // SAFETY: segment lock held; the block is live.
                    let block = unsafe { self.arena.block_bytes(handle) };
                    if holder::entry_key(block) == key {
                        self.note_reprobe(distance);
                        return Probe::Found(idx);
                    }
                }
            } else if slot.flags & TOMBSTONE != 0 {
                if first_tombstone.is_none() {
                    first_tombstone = Some(idx);
                }
            } else {
                self.note_reprobe(distance);
                return Probe::Vacant(first_tombstone.unwrap_or(idx));
            }

            idx = (idx + 1) & mask;
            distance += 1;
            if distance > core.slots.len() {
                // Table saturated with present and tombstoned slots; growth
                // keeps this from happening, but a tombstone always exists
                // once it does.
                return Probe::Vacant(first_tombstone.expect("saturated table has tombstones"));
            }
        }
    }

    fn decode(&self, slot: &Slot) -> ValueHolder {
        let handle = slot.handle.expect("present slot has a block");
        // SAFETY: segment lock held by the caller; the block is live.
        let block = unsafe { self.arena.block_bytes(handle) };
        let mut holder = holder::decode_entry(block);
        holder.set_slot_flags(slot.flags & PINNED != 0, slot.flags & VETOED != 0);
        holder
    }

    fn write_back(&self, core: &Core, idx: usize, holder: &ValueHolder) {
        let handle = core.slots[idx].handle.expect("present slot has a block");
        // SAFETY: segment lock held; the block is live and unaliased.
        let block = unsafe { self.arena.block_bytes_mut(handle) };
        holder::write_back_entry(holder, block);
    }

    /// Install `holder` at `idx`, evicting within this segment as needed.
    /// On allocation failure the mapping is left untouched and the holder is
    /// handed back for the oversize protocol.
    fn install_at(
        &self,
        core: &mut Core,
        idx: usize,
        key: &[u8],
        hash: u64,
        mut holder: ValueHolder,
        pin: bool,
        sink: &mut EventSink,
    ) -> Result<ValueHolder, PendingInstall> {
        let len = holder::encoded_entry_len(key.len(), holder.value().len());
        let handle = loop {
            if let Some(handle) = self.arena.allocate(len) {
                break handle;
            }
            if !self.evict_one(core, sink, Some(idx)) {
                return Err(PendingInstall { holder, pin });
            }
        };

        // SAFETY: freshly allocated block, owned exclusively here.
        let block = unsafe { self.arena.block_bytes_mut(handle) };
        holder::encode_entry(&holder, key, block);

        let slot = &mut core.slots[idx];
        if slot.is_present() {
            let old_handle = slot.handle.expect("present slot has a block");
            if slot.is_vital() {
                // SAFETY: segment lock held; old block still live.
                let old_len = unsafe { self.arena.block_bytes(old_handle).len() };
                self.vital_bytes
                    .fetch_sub(old_len as u64, Ordering::Relaxed);
            }
            self.arena.free(old_handle);
        } else {
            if slot.flags & TOMBSTONE != 0 {
                self.removed_slots.fetch_sub(1, Ordering::Relaxed);
            }
            self.used_slots.fetch_add(1, Ordering::Relaxed);
        }

        slot.hash = hash;
        slot.handle = Some(handle);
        slot.flags = if pin { PRESENT | PINNED } else { PRESENT };
        if pin {
            self.vital_bytes.fetch_add(len as u64, Ordering::Relaxed);
        }
        holder.set_slot_flags(pin, false);
        Ok(holder)
    }

    /// Advance the clock hand to the next evictable entry and reclaim it.
    fn evict_one(&self, core: &mut Core, sink: &mut EventSink, protect: Option<usize>) -> bool {
        let capacity = core.slots.len();
        let mut scanned = 0;

        while scanned < capacity {
            let idx = core.clock % capacity;
            core.clock = (core.clock + 1) % capacity;
            scanned += 1;

            if protect == Some(idx) {
                continue;
            }
            let slot = core.slots[idx];
            if !slot.is_present() || slot.is_vital() {
                continue;
            }

            let holder = self.decode(&slot);
            let handle = slot.handle.expect("present slot has a block");
            // SAFETY: segment lock held; the block is live.
            let key: Box<[u8]> = unsafe { holder::entry_key(self.arena.block_bytes(handle)) }.into();

            match self.veto.vetoes(&key, &holder) {
                Ok(true) => {
                    self.set_flag(core, idx, VETOED, true);
                    continue;
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(%error, "eviction veto failed - assuming entry is not vetoed");
                }
            }

            sink.evicted(&key, holder.value());
            self.hook.on_eviction(&key, &holder);
            self.clear_slot(core, idx);
            return true;
        }
        false
    }

    /// Tombstone a present slot and free its block.
    fn clear_slot(&self, core: &mut Core, idx: usize) {
        let slot = &mut core.slots[idx];
        debug_assert!(slot.is_present());
        let handle = slot.handle.take().expect("present slot has a block");
        if slot.is_vital() {
            // SAFETY: segment lock held; the block is still live.
            let len = unsafe { self.arena.block_bytes(handle).len() };
            self.vital_bytes.fetch_sub(len as u64, Ordering::Relaxed);
        }
        self.arena.free(handle);
        slot.flags = TOMBSTONE;
        self.used_slots.fetch_sub(1, Ordering::Relaxed);
        self.removed_slots.fetch_add(1, Ordering::Relaxed);
    }

    /// Set or clear a metadata bit, keeping the vital byte count in step.
    fn set_flag(&self, core: &mut Core, idx: usize, flag: u8, on: bool) {
        let slot = &mut core.slots[idx];
        debug_assert!(slot.is_present());
        let was_vital = slot.is_vital();
        if on {
            slot.flags |= flag;
        } else {
            slot.flags &= !flag;
        }
        let is_vital = slot.is_vital();

        if was_vital != is_vital {
            let handle = slot.handle.expect("present slot has a block");
            // SAFETY: segment lock held; the block is live.
            let len = unsafe { self.arena.block_bytes(handle).len() } as u64;
            if is_vital {
                self.vital_bytes.fetch_add(len, Ordering::Relaxed);
            } else {
                self.vital_bytes.fetch_sub(len, Ordering::Relaxed);
            }
        }
    }

    fn maybe_grow(&self, core: &mut Core) {
        let capacity = core.slots.len();
        let used = self.used_slots.load(Ordering::Relaxed);
        let tombstones = self.removed_slots.load(Ordering::Relaxed);
        if (used + tombstones) * 4 < capacity * 3 {
            return;
        }

        let new_capacity = capacity * 2;
        let mask = new_capacity - 1;
        let mut slots = vec![Slot::EMPTY; new_capacity].into_boxed_slice();
        for slot in core.slots.iter() {
            if slot.is_present() {
                let mut idx = slot.hash as usize & mask;
                while slots[idx].is_present() {
                    idx = (idx + 1) & mask;
                }
                slots[idx] = *slot;
            }
        }
        core.slots = slots;
        core.clock = 0;
        self.removed_slots.store(0, Ordering::Relaxed);
        self.capacity.store(new_capacity, Ordering::Relaxed);
    }

    #[inline]
    fn note_reprobe(&self, distance: usize) {
        self.reprobe_len.fetch_max(distance, Ordering::Relaxed);
    }
}
