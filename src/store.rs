//! Tier facade over the segmented map.
//!
//! [`OffHeapStore`] implements both tier contracts:
//!
//! - the **authoritative tier** (`get`/`put`/`compute`/... plus
//!   `get_and_fault`, `compute_if_absent_and_fault`, and `flush`), and
//! - the **lower caching tier** (`invalidate`, `get_and_remove`,
//!   `install_mapping`, `set_invalidation_listener`).
//!
//! Every operation follows the same discipline: validate arguments, acquire
//! an event sink, read `now` from the time source inside the remap closure,
//! expire a stale resident before applying the operation's semantics, and
//! release the sink exactly once - through the failure path when the
//! operation errors.
//!
//! Allocation pressure surfaces as an oversize outcome from the segment;
//! the facade remediates (shrink others, emergency valve, veto walk) and
//! retries the *install*, never the user closure.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::arena::Arena;
use crate::config::StoreConfig;
use crate::error::{DynError, StoreError, StoreResult};
use crate::events::{
    EventSink, InvalidationListener, NullInvalidationListener, NullStoreEventDispatcher,
    StoreEventDispatcher,
};
use crate::expiry::{expire_time_ms, Expiry, ExpiryDuration, NoExpiry};
use crate::holder::ValueHolder;
use crate::map::SegmentedMap;
use crate::segment::{ComputeOutcome, EvictionHook, EvictionVeto, NeverVeto, Remap};
use crate::stats::{MemoryStats, PutStatus, RemoveStatus, ReplaceStatus, StatsSnapshot, StoreStats};
use crate::time::{SystemTimeSource, TimeSource};

type Valve = Arc<dyn Fn() -> Result<(), DynError> + Send + Sync>;

/// Shared observer state for evictions and invalidations.
///
/// The invalidation listener is settable after construction (the upper tier
/// registers itself once wired), so it lives behind a lock; segments reach
/// it through the [`EvictionHook`] impl.
struct TierHooks {
    invalidation: RwLock<Arc<dyn InvalidationListener>>,
    stats: Arc<StoreStats>,
}

impl TierHooks {
    fn notify_invalidation(&self, key: &[u8], holder: &ValueHolder) {
        self.invalidation.read().on_invalidation(key, holder);
    }
}

impl EvictionHook for TierHooks {
    fn on_eviction(&self, key: &[u8], holder: &ValueHolder) {
        self.notify_invalidation(key, holder);
        StoreStats::bump(&self.stats.evictions);
    }
}

/// The off-heap authoritative tier.
pub struct OffHeapStore {
    map: SegmentedMap,
    time: Arc<dyn TimeSource>,
    expiry: Arc<dyn Expiry>,
    dispatcher: Arc<dyn StoreEventDispatcher>,
    stats: Arc<StoreStats>,
    hooks: Arc<TierHooks>,
    valve: Mutex<Option<Valve>>,
    max_key_len: usize,
    max_value_len: usize,
}

/// Builder wiring a store to its collaborators.
///
/// Defaults: system clock, no expiry, no eviction veto, and a dispatcher
/// that publishes nothing.
pub struct OffHeapStoreBuilder {
    config: StoreConfig,
    time: Arc<dyn TimeSource>,
    expiry: Arc<dyn Expiry>,
    veto: Arc<dyn EvictionVeto>,
    dispatcher: Arc<dyn StoreEventDispatcher>,
}

impl Default for OffHeapStoreBuilder {
    fn default() -> Self {
        Self {
            config: StoreConfig::default(),
            time: Arc::new(SystemTimeSource),
            expiry: Arc::new(NoExpiry),
            veto: Arc::new(NeverVeto),
            dispatcher: Arc::new(NullStoreEventDispatcher),
        }
    }
}

impl OffHeapStoreBuilder {
    /// Start from default collaborators and sizing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given sizing configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given time source.
    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Use the given expiry policy.
    pub fn expiry(mut self, expiry: Arc<dyn Expiry>) -> Self {
        self.expiry = expiry;
        self
    }

    /// Use the given eviction veto policy.
    pub fn eviction_veto(mut self, veto: Arc<dyn EvictionVeto>) -> Self {
        self.veto = veto;
        self
    }

    /// Use the given event dispatcher.
    pub fn event_dispatcher(mut self, dispatcher: Arc<dyn StoreEventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Build the store.
    pub fn build(self) -> StoreResult<OffHeapStore> {
        let arena = Arc::new(Arena::new(self.config.arena_capacity, self.config.page_size)?);
        let stats = Arc::new(StoreStats::default());
        let hooks = Arc::new(TierHooks {
            invalidation: RwLock::new(Arc::new(NullInvalidationListener)),
            stats: stats.clone(),
        });
        let map = SegmentedMap::new(
            self.config.segment_count,
            self.config.initial_slots_per_segment,
            self.config.shrink_budget,
            arena,
            self.veto,
            hooks.clone(),
        );
        Ok(OffHeapStore {
            map,
            time: self.time,
            expiry: self.expiry,
            dispatcher: self.dispatcher,
            stats,
            hooks,
            valve: Mutex::new(None),
            max_key_len: self.config.max_key_len,
            max_value_len: self.config.max_value_len,
        })
    }
}

/// Verdict of the access-expiry consultation.
enum AccessVerdict {
    /// Treat the entry as just-expired.
    ExpireNow,
    /// Touch the entry, optionally re-arming its expiration.
    Touch(Option<ExpiryDuration>),
}

impl OffHeapStore {
    /// Build a store with default collaborators.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        OffHeapStoreBuilder::new().config(config).build()
    }

    /// Builder for custom collaborator wiring.
    pub fn builder() -> OffHeapStoreBuilder {
        OffHeapStoreBuilder::new()
    }

    // ---- authoritative tier -------------------------------------------------

    /// Read a mapping, touching its access metadata per the expiry policy.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<ValueHolder>> {
        self.check_key(key)?;
        let result = self.internal_get(key, true)?;
        if result.is_some() {
            StoreStats::bump(&self.stats.get_hit);
        } else {
            StoreStats::bump(&self.stats.get_miss);
        }
        Ok(result)
    }

    /// Whether a live mapping exists. Does not touch access metadata.
    pub fn contains_key(&self, key: &[u8]) -> StoreResult<bool> {
        self.check_key(key)?;
        Ok(self.internal_get(key, false)?.is_some())
    }

    /// Install or replace a mapping.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<PutStatus> {
        self.check_key(key)?;
        self.check_value(value)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut added = false;
            let mut replaced = false;
            self.compute_with_oversize(key, hash, false, sink, |k, current, sink| {
                let now = self.time.now_ms();
                let live = self.expire_if_stale(k, current, now, sink);
                match live {
                    None => match self.new_create_value_holder(k, value, hash, now, sink) {
                        Some(holder) => {
                            added = true;
                            Ok(Remap::Install(holder))
                        }
                        None => Ok(Remap::Remove),
                    },
                    Some(existing) => {
                        replaced = true;
                        match self.new_updated_value_holder(k, value, existing, hash, now, sink) {
                            Some(holder) => Ok(Remap::Install(holder)),
                            None => Ok(Remap::Remove),
                        }
                    }
                }
            })?;

            let status = if replaced {
                StoreStats::bump(&self.stats.put_update);
                PutStatus::Update
            } else if added {
                StoreStats::bump(&self.stats.put_put);
                PutStatus::Put
            } else {
                StoreStats::bump(&self.stats.put_noop);
                PutStatus::Noop
            };
            Ok(status)
        })
    }

    /// Install a mapping unless a live one exists; returns the resident
    /// holder on a hit.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> StoreResult<Option<ValueHolder>> {
        self.check_key(key)?;
        self.check_value(value)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut added = false;
            let mut previous: Option<ValueHolder> = None;
            self.compute_with_oversize(key, hash, false, sink, |k, current, sink| {
                let now = self.time.now_ms();
                let live = self.expire_if_stale(k, current, now, sink);
                match live {
                    None => match self.new_create_value_holder(k, value, hash, now, sink) {
                        Some(holder) => {
                            added = true;
                            Ok(Remap::Install(holder))
                        }
                        None => Ok(Remap::Remove),
                    },
                    Some(existing) => match self.access_verdict(k, existing) {
                        AccessVerdict::ExpireNow => {
                            self.on_expiration(k, existing, sink);
                            Ok(Remap::Remove)
                        }
                        AccessVerdict::Touch(duration) => {
                            existing.accessed(now, duration.as_ref());
                            existing.write_back();
                            previous = Some(existing.clone());
                            Ok(Remap::Retain)
                        }
                    },
                }
            })?;

            if added {
                StoreStats::bump(&self.stats.put_if_absent_put);
            } else if previous.is_some() {
                StoreStats::bump(&self.stats.put_if_absent_hit);
            } else {
                StoreStats::bump(&self.stats.put_if_absent_noop);
            }
            Ok(previous)
        })
    }

    /// Remove a mapping. Returns whether a live mapping was removed.
    pub fn remove(&self, key: &[u8]) -> StoreResult<bool> {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut removed = false;
            let outcome = self.map.compute_if_present(key, hash, sink, |k, current, sink| {
                let holder = current.expect("compute_if_present passes a holder");
                let now = self.time.now_ms();
                if holder.is_expired(now) {
                    self.on_expiration(k, holder, sink);
                    return Ok(Remap::Remove);
                }
                removed = true;
                sink.removed(k, holder.value());
                Ok(Remap::Remove)
            })?;
            let _ = Self::expect_done(outcome);

            if removed {
                StoreStats::bump(&self.stats.remove_removed);
            } else {
                StoreStats::bump(&self.stats.remove_miss);
            }
            Ok(removed)
        })
    }

    /// Remove a mapping only when its value equals `expected`.
    pub fn conditional_remove(&self, key: &[u8], expected: &[u8]) -> StoreResult<RemoveStatus> {
        self.check_key(key)?;
        self.check_value(expected)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut removed = false;
            let mut mapping_present = false;
            let outcome = self.map.compute_if_present(key, hash, sink, |k, current, sink| {
                let holder = current.expect("compute_if_present passes a holder");
                let now = self.time.now_ms();
                if holder.is_expired(now) {
                    self.on_expiration(k, holder, sink);
                    return Ok(Remap::Remove);
                }
                if holder.value() == expected {
                    removed = true;
                    sink.removed(k, holder.value());
                    return Ok(Remap::Remove);
                }
                mapping_present = true;
                match self.access_verdict(k, holder) {
                    AccessVerdict::ExpireNow => {
                        self.on_expiration(k, holder, sink);
                        Ok(Remap::Remove)
                    }
                    AccessVerdict::Touch(duration) => {
                        holder.accessed(now, duration.as_ref());
                        holder.write_back();
                        Ok(Remap::Retain)
                    }
                }
            })?;
            let _ = Self::expect_done(outcome);

            let status = if removed {
                StoreStats::bump(&self.stats.conditional_remove_removed);
                RemoveStatus::Removed
            } else if mapping_present {
                StoreStats::bump(&self.stats.conditional_remove_key_present);
                RemoveStatus::KeyPresent
            } else {
                StoreStats::bump(&self.stats.conditional_remove_key_missing);
                RemoveStatus::KeyMissing
            };
            Ok(status)
        })
    }

    /// Replace a live mapping's value; returns the previous holder.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> StoreResult<Option<ValueHolder>> {
        self.check_key(key)?;
        self.check_value(value)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut previous: Option<ValueHolder> = None;
            self.compute_with_oversize(key, hash, false, sink, |k, current, sink| {
                let now = self.time.now_ms();
                let live = self.expire_if_stale(k, current, now, sink);
                match live {
                    None => Ok(Remap::Remove),
                    Some(existing) => {
                        previous = Some(existing.clone());
                        match self.new_updated_value_holder(k, value, existing, hash, now, sink) {
                            Some(holder) => Ok(Remap::Install(holder)),
                            None => Ok(Remap::Remove),
                        }
                    }
                }
            })?;

            if previous.is_some() {
                StoreStats::bump(&self.stats.replace_replaced);
            } else {
                StoreStats::bump(&self.stats.replace_miss);
            }
            Ok(previous)
        })
    }

    /// Replace a mapping only when its value equals `old`.
    pub fn conditional_replace(
        &self,
        key: &[u8],
        old: &[u8],
        new: &[u8],
    ) -> StoreResult<ReplaceStatus> {
        self.check_key(key)?;
        self.check_value(old)?;
        self.check_value(new)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut replaced = false;
            let mut mapping_present = false;
            self.compute_with_oversize(key, hash, false, sink, |k, current, sink| {
                let now = self.time.now_ms();
                let live = self.expire_if_stale(k, current, now, sink);
                match live {
                    None => Ok(Remap::Remove),
                    Some(existing) => {
                        if existing.value() == old {
                            replaced = true;
                            match self.new_updated_value_holder(k, new, existing, hash, now, sink) {
                                Some(holder) => Ok(Remap::Install(holder)),
                                None => Ok(Remap::Remove),
                            }
                        } else {
                            mapping_present = true;
                            match self.access_verdict(k, existing) {
                                AccessVerdict::ExpireNow => {
                                    self.on_expiration(k, existing, sink);
                                    Ok(Remap::Remove)
                                }
                                AccessVerdict::Touch(duration) => {
                                    existing.accessed(now, duration.as_ref());
                                    existing.write_back();
                                    Ok(Remap::Retain)
                                }
                            }
                        }
                    }
                }
            })?;

            let status = if replaced {
                StoreStats::bump(&self.stats.conditional_replace_hit);
                ReplaceStatus::Hit
            } else if mapping_present {
                StoreStats::bump(&self.stats.conditional_replace_miss_present);
                ReplaceStatus::MissPresent
            } else {
                StoreStats::bump(&self.stats.conditional_replace_miss_not_present);
                ReplaceStatus::MissNotPresent
            };
            Ok(status)
        })
    }

    /// Atomically remap a key through a user function.
    ///
    /// The function sees the live value (post-expiry) and returns the next
    /// value, or `None` to remove. It runs at most once, even when the
    /// install retries under allocation pressure.
    pub fn compute<F>(&self, key: &[u8], f: F) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&[u8], Option<&[u8]>) -> Result<Option<Vec<u8>>, DynError>,
    {
        self.compute_with(key, f, true)
    }

    /// [`OffHeapStore::compute`] with control over equal-value replacement:
    /// when `replace_equal` is `false` and the function returns a value equal
    /// to the current one, the mapping is only access-touched.
    pub fn compute_with<F>(
        &self,
        key: &[u8],
        f: F,
        replace_equal: bool,
    ) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&[u8], Option<&[u8]>) -> Result<Option<Vec<u8>>, DynError>,
    {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut wrote = false;
            let result = self.compute_with_oversize(key, hash, false, sink, |k, current, sink| {
                let now = self.time.now_ms();
                let live = self.expire_if_stale(k, current, now, sink);

                let computed = f(k, live.as_ref().map(|h| h.value()))
                    .map_err(|e| StoreError::access("compute function failed", e))?;

                match (live, computed) {
                    (live, None) => {
                        if let Some(existing) = live {
                            wrote = true;
                            sink.removed(k, existing.value());
                        }
                        Ok(Remap::Remove)
                    }
                    (Some(existing), Some(value)) => {
                        if existing.value() == &value[..] && !replace_equal {
                            match self.access_verdict(k, existing) {
                                AccessVerdict::ExpireNow => {
                                    self.on_expiration(k, existing, sink);
                                    Ok(Remap::Remove)
                                }
                                AccessVerdict::Touch(duration) => {
                                    existing.accessed(now, duration.as_ref());
                                    existing.write_back();
                                    Ok(Remap::Retain)
                                }
                            }
                        } else {
                            self.check_value(&value)?;
                            wrote = true;
                            match self.new_updated_value_holder(k, &value, existing, hash, now, sink)
                            {
                                Some(holder) => Ok(Remap::Install(holder)),
                                None => Ok(Remap::Remove),
                            }
                        }
                    }
                    (None, Some(value)) => {
                        self.check_value(&value)?;
                        wrote = true;
                        match self.new_create_value_holder(k, &value, hash, now, sink) {
                            Some(holder) => Ok(Remap::Install(holder)),
                            None => Ok(Remap::Remove),
                        }
                    }
                }
            })?;

            match (&result, wrote) {
                (Some(_), true) => StoreStats::bump(&self.stats.compute_put),
                (Some(_), false) => StoreStats::bump(&self.stats.compute_hit),
                (None, true) => StoreStats::bump(&self.stats.compute_removed),
                (None, false) => StoreStats::bump(&self.stats.compute_miss),
            }
            Ok(result)
        })
    }

    /// Install a mapping computed from the key when none is live.
    pub fn compute_if_absent<F>(&self, key: &[u8], f: F) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&[u8]) -> Result<Option<Vec<u8>>, DynError>,
    {
        self.internal_compute_if_absent(key, f, false)
    }

    /// Remap every key through the same function. Each key is an independent
    /// atomic remap; the batch itself is not atomic.
    pub fn bulk_compute<F>(
        &self,
        keys: &[&[u8]],
        mut f: F,
    ) -> StoreResult<Vec<(Box<[u8]>, Option<ValueHolder>)>>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<Option<Vec<u8>>, DynError>,
    {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let holder = self.compute_with(key, &mut f, true)?;
            results.push(((*key).into(), holder));
        }
        Ok(results)
    }

    /// Populate every absent key through the same function.
    pub fn bulk_compute_if_absent<F>(
        &self,
        keys: &[&[u8]],
        mut f: F,
    ) -> StoreResult<Vec<(Box<[u8]>, Option<ValueHolder>)>>
    where
        F: FnMut(&[u8]) -> Result<Option<Vec<u8>>, DynError>,
    {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let holder = self.internal_compute_if_absent(key, &mut f, false)?;
            results.push(((*key).into(), holder));
        }
        Ok(results)
    }

    /// Drop every mapping. No events are published.
    pub fn clear(&self) -> StoreResult<()> {
        self.map.clear();
        Ok(())
    }

    /// Weakly consistent iteration over live entries.
    ///
    /// Entries present for the whole iteration are yielded exactly once;
    /// concurrent inserts may or may not appear.
    pub fn iter(&self) -> impl Iterator<Item = (Box<[u8]>, ValueHolder)> + '_ {
        self.map.iter()
    }

    /// Fault a mapping into the upper tier: pin the slot and hand out a
    /// detached copy. The resident mapping stays authoritative.
    pub fn get_and_fault(&self, key: &[u8]) -> StoreResult<Option<ValueHolder>> {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let outcome = self
                .map
                .compute_if_present_and_pin(key, hash, sink, |k, current, sink| {
                    let holder = current.expect("compute_if_present passes a holder");
                    let now = self.time.now_ms();
                    if holder.is_expired(now) {
                        self.on_expiration(k, holder, sink);
                        return Ok(Remap::Remove);
                    }
                    holder.detach();
                    Ok(Remap::Retain)
                })?;
            let result = Self::expect_done(outcome);

            if result.is_some() {
                StoreStats::bump(&self.stats.get_and_fault_hit);
            } else {
                StoreStats::bump(&self.stats.get_and_fault_miss);
            }
            Ok(result)
        })
    }

    /// Like [`OffHeapStore::compute_if_absent`], pinning on install and
    /// detaching the returned holder for upper-tier handoff.
    pub fn compute_if_absent_and_fault<F>(
        &self,
        key: &[u8],
        f: F,
    ) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&[u8]) -> Result<Option<Vec<u8>>, DynError>,
    {
        self.internal_compute_if_absent(key, f, true)
    }

    /// Push upper-tier metadata back onto a pinned resident and unpin it.
    ///
    /// Acts only when the slot is pinned and the resident's id equals the
    /// flushed holder's id. An expired flushed holder expires the resident.
    pub fn flush(&self, key: &[u8], flushed: &ValueHolder) -> StoreResult<bool> {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let hit = self.map.compute_if_pinned(
                key,
                hash,
                sink,
                |k, present, sink| {
                    if present.id() == flushed.id() {
                        let now = self.time.now_ms();
                        if flushed.is_expired(now) {
                            self.on_expiration(k, present, sink);
                            return Ok(Remap::Remove);
                        }
                        present.update_metadata(flushed);
                        present.write_back();
                    }
                    Ok(Remap::Retain)
                },
                |present| present.id() == flushed.id(),
            )?;

            if hit {
                StoreStats::bump(&self.stats.flush_hit);
            } else {
                StoreStats::bump(&self.stats.flush_miss);
            }
            Ok(hit)
        })
    }

    // ---- lower caching tier -------------------------------------------------

    /// Register the upper tier's invalidation listener.
    pub fn set_invalidation_listener(&self, listener: Arc<dyn InvalidationListener>) {
        *self.hooks.invalidation.write() = listener;
    }

    /// Drop a mapping and notify the invalidation listener. Tier-internal:
    /// no `removed` event is published.
    pub fn invalidate(&self, key: &[u8]) -> StoreResult<()> {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut removed = false;
            let outcome = self.map.compute_if_present(key, hash, sink, |k, current, _| {
                let holder = current.expect("compute_if_present passes a holder");
                removed = true;
                self.hooks.notify_invalidation(k, holder);
                Ok(Remap::Remove)
            })?;
            let _ = Self::expect_done(outcome);

            if removed {
                StoreStats::bump(&self.stats.invalidate_removed);
            } else {
                StoreStats::bump(&self.stats.invalidate_miss);
            }
            Ok(())
        })
    }

    /// [`OffHeapStore::invalidate`], additionally running `then` inside the
    /// same segment-locked remap.
    pub fn invalidate_then<F>(&self, key: &[u8], then: F) -> StoreResult<()>
    where
        F: FnOnce(),
    {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut removed = false;
            let outcome = self.map.compute(key, hash, false, sink, |k, current, _| {
                if let Some(holder) = current {
                    removed = true;
                    self.hooks.notify_invalidation(k, holder);
                }
                then();
                Ok(Remap::Remove)
            })?;
            let _ = Self::expect_done(outcome);

            if removed {
                StoreStats::bump(&self.stats.invalidate_removed);
            } else {
                StoreStats::bump(&self.stats.invalidate_miss);
            }
            Ok(())
        })
    }

    /// Atomically read and remove a mapping for promotion into the upper
    /// tier. An expired resident only notifies the invalidation listener.
    pub fn get_and_remove(&self, key: &[u8]) -> StoreResult<Option<ValueHolder>> {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut taken: Option<ValueHolder> = None;
            let outcome = self.map.compute(key, hash, false, sink, |k, current, _| {
                let now = self.time.now_ms();
                match current {
                    None => Ok(Remap::Remove),
                    Some(holder) if holder.is_expired(now) => {
                        self.on_expiration_in_caching_tier(k, holder);
                        Ok(Remap::Remove)
                    }
                    Some(holder) => {
                        holder.detach();
                        taken = Some(holder.clone());
                        Ok(Remap::Remove)
                    }
                }
            })?;
            let _ = Self::expect_done(outcome);

            if taken.is_some() {
                StoreStats::bump(&self.stats.get_and_remove_hit_removed);
            } else {
                StoreStats::bump(&self.stats.get_and_remove_miss);
            }
            Ok(taken)
        })
    }

    /// Install a mapping sourced from the upper tier into an empty slot.
    ///
    /// Fails with [`StoreError::PreconditionViolated`] when a mapping is
    /// already present. An expired source holder installs nothing and only
    /// notifies the invalidation listener.
    pub fn install_mapping<F>(&self, key: &[u8], source: F) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&[u8]) -> Option<ValueHolder>,
    {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let result = self.compute_with_oversize(key, hash, false, sink, |k, current, _| {
                if current.is_some() {
                    return Err(StoreError::PreconditionViolated(
                        "install_mapping on a non-empty slot",
                    ));
                }
                match source(k) {
                    None => Ok(Remap::Remove),
                    Some(holder) => {
                        let now = self.time.now_ms();
                        if holder.is_expired(now) {
                            self.on_expiration_in_caching_tier(k, &holder);
                            Ok(Remap::Remove)
                        } else {
                            Ok(Remap::Install(holder))
                        }
                    }
                }
            })?;

            if result.is_some() {
                StoreStats::bump(&self.stats.install_mapping_put);
            } else {
                StoreStats::bump(&self.stats.install_mapping_noop);
            }
            Ok(result)
        })
    }

    // ---- collaborators and stats --------------------------------------------

    /// Register the emergency valve invoked under terminal allocation
    /// pressure (at most once per operation), typically to drain a
    /// write-behind queue.
    pub fn register_emergency_valve<F>(&self, valve: F)
    where
        F: Fn() -> Result<(), DynError> + Send + Sync + 'static,
    {
        *self.valve.lock() = Some(Arc::new(valve));
    }

    /// Snapshot of the per-operation outcome counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pass-through memory and table gauges.
    pub fn memory_stats(&self) -> MemoryStats {
        let arena = self.map.arena();
        MemoryStats {
            allocated_memory: arena.allocated_memory(),
            occupied_memory: arena.occupied_memory(),
            data_allocated_memory: arena.data_allocated_memory(),
            data_occupied_memory: arena.data_occupied_memory(),
            data_size: self.map.data_size(),
            data_vital_memory: self.map.data_vital_memory(),
            vital_memory: self.map.vital_memory(),
            long_size: self.map.long_size(),
            used_slot_count: self.map.used_slot_count(),
            removed_slot_count: self.map.removed_slot_count(),
            reprobe_length: self.map.reprobe_length(),
            table_capacity: self.map.table_capacity(),
        }
    }

    // ---- internals ----------------------------------------------------------

    fn internal_get(&self, key: &[u8], update_access: bool) -> StoreResult<Option<ValueHolder>> {
        let hash = self.map.hash_of(key);
        self.with_sink(|sink| {
            let outcome = self.map.compute_if_present(key, hash, sink, |k, current, sink| {
                let holder = current.expect("compute_if_present passes a holder");
                let now = self.time.now_ms();
                if holder.is_expired(now) {
                    self.on_expiration(k, holder, sink);
                    return Ok(Remap::Remove);
                }
                if update_access {
                    match self.access_verdict(k, holder) {
                        AccessVerdict::ExpireNow => {
                            self.on_expiration(k, holder, sink);
                            return Ok(Remap::Remove);
                        }
                        AccessVerdict::Touch(duration) => {
                            holder.accessed(now, duration.as_ref());
                            holder.write_back();
                        }
                    }
                }
                Ok(Remap::Retain)
            })?;
            Ok(Self::expect_done(outcome))
        })
    }

    fn internal_compute_if_absent<F>(
        &self,
        key: &[u8],
        f: F,
        fault: bool,
    ) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&[u8]) -> Result<Option<Vec<u8>>, DynError>,
    {
        self.check_key(key)?;
        let hash = self.map.hash_of(key);

        self.with_sink(|sink| {
            let mut wrote = false;
            let result = self.compute_with_oversize(key, hash, fault, sink, |k, current, sink| {
                let now = self.time.now_ms();
                let live = self.expire_if_stale(k, current, now, sink);
                match live {
                    None => {
                        wrote = true;
                        let computed = f(k).map_err(|e| {
                            StoreError::access("compute-if-absent function failed", e)
                        })?;
                        match computed {
                            None => Ok(Remap::Remove),
                            Some(value) => {
                                self.check_value(&value)?;
                                match self.new_create_value_holder(k, &value, hash, now, sink) {
                                    Some(holder) => Ok(Remap::Install(holder)),
                                    None => Ok(Remap::Remove),
                                }
                            }
                        }
                    }
                    Some(existing) => match self.access_verdict(k, existing) {
                        AccessVerdict::ExpireNow => {
                            self.on_expiration(k, existing, sink);
                            Ok(Remap::Remove)
                        }
                        AccessVerdict::Touch(duration) => {
                            existing.accessed(now, duration.as_ref());
                            existing.write_back();
                            if fault {
                                existing.detach();
                            }
                            Ok(Remap::Retain)
                        }
                    },
                }
            })?;

            let stats = &self.stats;
            match (&result, wrote, fault) {
                (Some(_), true, false) => StoreStats::bump(&stats.compute_if_absent_put),
                (Some(_), false, false) => StoreStats::bump(&stats.compute_if_absent_hit),
                (None, _, false) => StoreStats::bump(&stats.compute_if_absent_noop),
                (Some(_), true, true) => StoreStats::bump(&stats.compute_if_absent_and_fault_put),
                (Some(_), false, true) => StoreStats::bump(&stats.compute_if_absent_and_fault_hit),
                (None, _, true) => StoreStats::bump(&stats.compute_if_absent_and_fault_noop),
            }
            Ok(result)
        })
    }

    /// Run one remap, remediating allocation pressure until the install
    /// lands or remediation is exhausted. The closure runs exactly once; only
    /// the install is retried.
    fn compute_with_oversize<F>(
        &self,
        key: &[u8],
        hash: u64,
        pin_on_install: bool,
        sink: &mut EventSink,
        f: F,
    ) -> StoreResult<Option<ValueHolder>>
    where
        F: FnOnce(&[u8], Option<&mut ValueHolder>, &mut EventSink) -> StoreResult<Remap>,
    {
        let mut valve_armed = true;
        let mut outcome = self.map.compute(key, hash, pin_on_install, sink, f)?;
        loop {
            match outcome {
                ComputeOutcome::Done(holder) => return Ok(holder),
                ComputeOutcome::Oversize(pending) => {
                    self.remediate_oversize(key, hash, &mut valve_armed, sink)?;
                    outcome = self.map.install_prepared(key, hash, pending, sink)?;
                }
            }
        }
    }

    /// One round of the oversize protocol: shrink other segments, then the
    /// emergency valve (once), then the veto walk. A walk that finds an
    /// already-vetoed slot means a previous round yielded nothing - the
    /// element cannot be stored.
    fn remediate_oversize(
        &self,
        key: &[u8],
        hash: u64,
        valve_armed: &mut bool,
        sink: &mut EventSink,
    ) -> StoreResult<()> {
        if self.map.shrink_others(hash, sink) {
            return Ok(());
        }

        if *valve_armed {
            // Clone the valve out so it runs without the registration lock;
            // a valve is free to call back into the store.
            let valve = self.valve.lock().clone();
            if let Some(valve_fn) = valve {
                *valve_armed = false;
                tracing::debug!("invoking emergency valve under allocation pressure");
                valve_fn().map_err(|e| StoreError::access("failed invoking valve", e))?;
                return Ok(());
            }
        }

        let walk = self.map.mark_all_vetoed();
        if walk.found_prior || walk.marked == 0 {
            // Either a previous walk already vetoed everything, or there was
            // nothing to veto in the first place. Nothing yields.
            return Err(StoreError::StoreAccess(format!(
                "element with a {} byte key is too large to be stored in this offheap store",
                key.len()
            )));
        }
        tracing::warn!(
            marked = walk.marked,
            "offheap store exhausted; vetoed all entries before final retry"
        );
        Ok(())
    }

    fn with_sink<T>(&self, op: impl FnOnce(&mut EventSink) -> StoreResult<T>) -> StoreResult<T> {
        let mut sink = self.dispatcher.event_sink();
        match op(&mut sink) {
            Ok(value) => {
                self.dispatcher.release(sink);
                Ok(value)
            }
            Err(error) => {
                self.dispatcher.release_after_failure(sink, &error);
                Err(error)
            }
        }
    }

    /// Expire a stale resident inside the remap, yielding the live holder.
    fn expire_if_stale<'h>(
        &self,
        key: &[u8],
        current: Option<&'h mut ValueHolder>,
        now: u64,
        sink: &mut EventSink,
    ) -> Option<&'h mut ValueHolder> {
        match current {
            Some(holder) if holder.is_expired(now) => {
                self.on_expiration(key, holder, sink);
                None
            }
            other => other,
        }
    }

    fn access_verdict(&self, key: &[u8], holder: &ValueHolder) -> AccessVerdict {
        match self.expiry.for_access(key, holder) {
            Err(error) => {
                tracing::error!(%error, "access expiry computation failed - expiring the entry");
                AccessVerdict::ExpireNow
            }
            Ok(Some(duration)) if duration.is_zero() => AccessVerdict::ExpireNow,
            Ok(duration) => AccessVerdict::Touch(duration),
        }
    }

    fn new_create_value_holder(
        &self,
        key: &[u8],
        value: &[u8],
        hash: u64,
        now: u64,
        sink: &mut EventSink,
    ) -> Option<ValueHolder> {
        let duration = match self.expiry.for_creation(key, value) {
            Ok(duration) => duration,
            Err(error) => {
                tracing::error!(%error, "creation expiry computation failed - suppressing install");
                ExpiryDuration::ZERO
            }
        };
        if duration.is_zero() {
            return None;
        }

        sink.created(key, value);
        let id = self.map.next_id_for(hash);
        Some(ValueHolder::new(
            id,
            value,
            now,
            expire_time_ms(now, &duration),
        ))
    }

    fn new_updated_value_holder(
        &self,
        key: &[u8],
        value: &[u8],
        existing: &ValueHolder,
        hash: u64,
        now: u64,
        sink: &mut EventSink,
    ) -> Option<ValueHolder> {
        sink.updated(key, existing.value(), value);

        let verdict = match self.expiry.for_update(key, existing, value) {
            Ok(verdict) => verdict,
            Err(error) => {
                tracing::error!(%error, "update expiry computation failed - expiring the entry");
                Some(ExpiryDuration::ZERO)
            }
        };
        if let Some(duration) = &verdict {
            if duration.is_zero() {
                sink.expired(key, value);
                return None;
            }
        }

        let expiration = match &verdict {
            None => existing.expiration_time_ms(),
            Some(duration) => expire_time_ms(now, duration),
        };
        let id = self.map.next_id_for(hash);
        Some(ValueHolder::new(id, value, now, expiration))
    }

    /// Expiry observed by an authoritative-tier operation: event, upper-tier
    /// invalidation, outcome counter.
    fn on_expiration(&self, key: &[u8], holder: &ValueHolder, sink: &mut EventSink) {
        sink.expired(key, holder.value());
        self.hooks.notify_invalidation(key, holder);
        StoreStats::bump(&self.stats.expirations);
    }

    /// Expiry observed by a caching-tier operation: invalidation and counter
    /// only, no event.
    fn on_expiration_in_caching_tier(&self, key: &[u8], holder: &ValueHolder) {
        self.hooks.notify_invalidation(key, holder);
        StoreStats::bump(&self.stats.expirations);
    }

    fn check_key(&self, key: &[u8]) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("empty key"));
        }
        if key.len() > self.max_key_len {
            return Err(StoreError::InvalidArgument("key too long"));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> StoreResult<()> {
        if value.len() > self.max_value_len {
            return Err(StoreError::InvalidArgument("value too long"));
        }
        Ok(())
    }

    fn expect_done(outcome: ComputeOutcome) -> Option<ValueHolder> {
        match outcome {
            ComputeOutcome::Done(holder) => holder,
            // Remaps without an install never allocate.
            ComputeOutcome::Oversize(_) => unreachable!("remap without install cannot oversize"),
        }
    }
}
