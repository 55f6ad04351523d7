//! Authoritative-tier behavior tests.
//!
//! These exercise the store facade end to end with a manual clock, a
//! recording event listener, and purpose-built expiry policies.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use offheap_store::{
    DynError, Expiry, ExpiryDuration, ListenerDispatcher, ManualTimeSource, NoExpiry,
    OffHeapStore, PutStatus, RemoveStatus, ReplaceStatus, StoreConfig, StoreError, StoreEvent,
    StoreEventListener, TimeToLive, ValueHolder,
};

/// Listener capturing every published event in order.
#[derive(Default)]
struct Recording {
    events: Mutex<Vec<StoreEvent>>,
}

impl Recording {
    fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().clone()
    }

    fn expired_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, StoreEvent::Expired { .. }))
            .count()
    }
}

impl StoreEventListener for Recording {
    fn on_event(&self, event: &StoreEvent) {
        self.events.lock().push(event.clone());
    }
}

fn small_config() -> StoreConfig {
    StoreConfig::new()
        .with_segment_count(4)
        .with_arena_capacity(1024 * 1024)
        .with_initial_slots_per_segment(8)
}

fn store_with(expiry: Arc<dyn Expiry>) -> (OffHeapStore, Arc<ManualTimeSource>, Arc<Recording>) {
    let time = Arc::new(ManualTimeSource::new(0));
    let listener = Arc::new(Recording::default());
    let dispatcher = Arc::new(ListenerDispatcher::new());
    dispatcher.register(listener.clone());

    let store = OffHeapStore::builder()
        .config(small_config())
        .time_source(time.clone())
        .expiry(expiry)
        .event_dispatcher(dispatcher)
        .build()
        .unwrap();
    (store, time, listener)
}

// =============================================================================
// Basic operations
// =============================================================================

#[test]
fn test_put_get_roundtrip() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));

    assert_eq!(store.put(b"k", b"v1").unwrap(), PutStatus::Put);
    assert_eq!(store.get(b"k").unwrap().unwrap().value(), b"v1");

    assert_eq!(store.put(b"k", b"v2").unwrap(), PutStatus::Update);
    assert_eq!(store.get(b"k").unwrap().unwrap().value(), b"v2");

    assert!(store.get(b"missing").unwrap().is_none());
}

#[test]
fn test_contains_key_does_not_touch_access_time() {
    let (store, time, _) = store_with(Arc::new(NoExpiry));
    store.put(b"k", b"v").unwrap();
    time.advance(100);

    assert!(store.contains_key(b"k").unwrap());
    let (_, holder) = store.iter().next().unwrap();
    assert_eq!(holder.last_access_time_ms(), 0);
    assert_eq!(holder.hits(), 0);
}

#[test]
fn test_put_if_absent() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));

    assert!(store.put_if_absent(b"k", b"v1").unwrap().is_none());
    let previous = store.put_if_absent(b"k", b"v2").unwrap().unwrap();
    assert_eq!(previous.value(), b"v1");
    assert_eq!(store.get(b"k").unwrap().unwrap().value(), b"v1");
}

#[test]
fn test_remove() {
    let (store, _, listener) = store_with(Arc::new(NoExpiry));
    store.put(b"k", b"v").unwrap();

    assert!(store.remove(b"k").unwrap());
    assert!(!store.remove(b"k").unwrap());
    assert!(store.get(b"k").unwrap().is_none());

    let events = listener.events();
    assert!(matches!(
        events.last().unwrap(),
        StoreEvent::Removed { .. }
    ));
}

#[test]
fn test_conditional_remove() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));
    store.put(b"k", b"v").unwrap();

    assert_eq!(
        store.conditional_remove(b"k", b"wrong").unwrap(),
        RemoveStatus::KeyPresent
    );
    assert_eq!(
        store.conditional_remove(b"k", b"v").unwrap(),
        RemoveStatus::Removed
    );
    assert_eq!(
        store.conditional_remove(b"k", b"v").unwrap(),
        RemoveStatus::KeyMissing
    );
}

#[test]
fn test_replace() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));

    assert!(store.replace(b"k", b"v1").unwrap().is_none());
    assert!(store.get(b"k").unwrap().is_none());

    store.put(b"k", b"v1").unwrap();
    let previous = store.replace(b"k", b"v2").unwrap().unwrap();
    assert_eq!(previous.value(), b"v1");
    assert_eq!(store.get(b"k").unwrap().unwrap().value(), b"v2");
}

#[test]
fn test_conditional_replace_miss_vs_present() {
    let (store, _, listener) = store_with(Arc::new(NoExpiry));
    store.put(b"k", b"v1").unwrap();

    assert_eq!(
        store.conditional_replace(b"k", b"wrong", b"v2").unwrap(),
        ReplaceStatus::MissPresent
    );
    assert_eq!(store.get(b"k").unwrap().unwrap().value(), b"v1");

    assert_eq!(
        store.conditional_replace(b"k", b"v1", b"v2").unwrap(),
        ReplaceStatus::Hit
    );
    assert_eq!(store.get(b"k").unwrap().unwrap().value(), b"v2");

    assert_eq!(
        store.conditional_replace(b"absent", b"a", b"b").unwrap(),
        ReplaceStatus::MissNotPresent
    );

    let updated: Vec<_> = listener
        .events()
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::Updated { .. }))
        .collect();
    assert_eq!(updated.len(), 1);
    match &updated[0] {
        StoreEvent::Updated { key, old, new } => {
            assert_eq!(&key[..], b"k");
            assert_eq!(&old[..], b"v1");
            assert_eq!(&new[..], b"v2");
        }
        _ => unreachable!(),
    }
}

// =============================================================================
// Expiry
// =============================================================================

#[test]
fn test_put_and_expiry_sweep() {
    let (store, time, listener) = store_with(Arc::new(TimeToLive::new(Duration::from_millis(
        1_000,
    ))));

    store.put(b"a", b"1").unwrap();
    time.set(500);
    assert_eq!(store.get(b"a").unwrap().unwrap().value(), b"1");

    time.set(2_000);
    assert!(store.get(b"a").unwrap().is_none());
    assert_eq!(listener.expired_count(), 1);
    match listener
        .events()
        .iter()
        .find(|e| matches!(e, StoreEvent::Expired { .. }))
        .unwrap()
    {
        StoreEvent::Expired { key, old } => {
            assert_eq!(&key[..], b"a");
            assert_eq!(&old[..], b"1");
        }
        _ => unreachable!(),
    }

    // The expired mapping is gone; a second read is a plain miss.
    assert!(store.get(b"a").unwrap().is_none());
    assert_eq!(listener.expired_count(), 1);
}

/// Expiry that suppresses every creation.
struct ZeroCreation;

impl Expiry for ZeroCreation {
    fn for_creation(&self, _: &[u8], _: &[u8]) -> Result<ExpiryDuration, DynError> {
        Ok(ExpiryDuration::ZERO)
    }
    fn for_access(&self, _: &[u8], _: &ValueHolder) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }
    fn for_update(
        &self,
        _: &[u8],
        _: &ValueHolder,
        _: &[u8],
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }
}

#[test]
fn test_zero_creation_expiry_suppresses_install() {
    let (store, _, listener) = store_with(Arc::new(ZeroCreation));

    assert_eq!(store.put(b"k", b"v").unwrap(), PutStatus::Noop);
    assert!(store.get(b"k").unwrap().is_none());
    assert!(listener.events().is_empty());
}

/// Expiry that expires every update immediately.
struct ZeroUpdate;

impl Expiry for ZeroUpdate {
    fn for_creation(&self, _: &[u8], _: &[u8]) -> Result<ExpiryDuration, DynError> {
        Ok(ExpiryDuration::Forever)
    }
    fn for_access(&self, _: &[u8], _: &ValueHolder) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }
    fn for_update(
        &self,
        _: &[u8],
        _: &ValueHolder,
        _: &[u8],
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(Some(ExpiryDuration::ZERO))
    }
}

#[test]
fn test_zero_update_expiry_removes_mapping() {
    let (store, _, listener) = store_with(Arc::new(ZeroUpdate));

    store.put(b"k", b"v1").unwrap();
    assert_eq!(store.put(b"k", b"v2").unwrap(), PutStatus::Update);
    assert!(store.get(b"k").unwrap().is_none());

    let kinds: Vec<_> = listener
        .events()
        .iter()
        .map(|e| match e {
            StoreEvent::Created { .. } => "created",
            StoreEvent::Updated { .. } => "updated",
            StoreEvent::Expired { .. } => "expired",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["created", "updated", "expired"]);
}

/// Expiry that expires every read immediately.
struct ZeroAccess;

impl Expiry for ZeroAccess {
    fn for_creation(&self, _: &[u8], _: &[u8]) -> Result<ExpiryDuration, DynError> {
        Ok(ExpiryDuration::Forever)
    }
    fn for_access(&self, _: &[u8], _: &ValueHolder) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(Some(ExpiryDuration::ZERO))
    }
    fn for_update(
        &self,
        _: &[u8],
        _: &ValueHolder,
        _: &[u8],
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }
}

#[test]
fn test_access_zero_is_idempotent() {
    let (store, _, listener) = store_with(Arc::new(ZeroAccess));
    store.put(b"k", b"v").unwrap();

    assert!(store.get(b"k").unwrap().is_none());
    assert!(store.get(b"k").unwrap().is_none());
    assert_eq!(listener.expired_count(), 1);
}

/// Expiry whose access computation always fails.
struct FailingAccess;

impl Expiry for FailingAccess {
    fn for_creation(&self, _: &[u8], _: &[u8]) -> Result<ExpiryDuration, DynError> {
        Ok(ExpiryDuration::Forever)
    }
    fn for_access(&self, _: &[u8], _: &ValueHolder) -> Result<Option<ExpiryDuration>, DynError> {
        Err("expiry backend offline".into())
    }
    fn for_update(
        &self,
        _: &[u8],
        _: &ValueHolder,
        _: &[u8],
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }
}

#[test]
fn test_failing_access_expiry_is_treated_as_zero() {
    let (store, _, listener) = store_with(Arc::new(FailingAccess));
    store.put(b"k", b"v").unwrap();

    assert!(store.get(b"k").unwrap().is_none());
    assert_eq!(listener.expired_count(), 1);
}

#[test]
fn test_forever_access_clears_expiration() {
    /// Grants eternity on every read.
    struct ForeverAccess;
    impl Expiry for ForeverAccess {
        fn for_creation(&self, _: &[u8], _: &[u8]) -> Result<ExpiryDuration, DynError> {
            Ok(ExpiryDuration::Finite(Duration::from_millis(1_000)))
        }
        fn for_access(
            &self,
            _: &[u8],
            _: &ValueHolder,
        ) -> Result<Option<ExpiryDuration>, DynError> {
            Ok(Some(ExpiryDuration::Forever))
        }
        fn for_update(
            &self,
            _: &[u8],
            _: &ValueHolder,
            _: &[u8],
        ) -> Result<Option<ExpiryDuration>, DynError> {
            Ok(None)
        }
    }

    let (store, time, _) = store_with(Arc::new(ForeverAccess));
    store.put(b"k", b"v").unwrap();
    assert!(store.get(b"k").unwrap().is_some());

    // Would have expired at t=1000 without the access touch.
    time.set(5_000);
    assert!(store.get(b"k").unwrap().is_some());
    assert_eq!(
        store.iter().next().unwrap().1.expiration_time_ms(),
        offheap_store::NO_EXPIRE
    );
}

// =============================================================================
// Compute
// =============================================================================

#[test]
fn test_compute_create_update_remove() {
    let (store, _, listener) = store_with(Arc::new(NoExpiry));

    let created = store
        .compute(b"k", |_, current| {
            assert!(current.is_none());
            Ok(Some(b"v1".to_vec()))
        })
        .unwrap()
        .unwrap();
    assert_eq!(created.value(), b"v1");

    let updated = store
        .compute(b"k", |_, current| {
            assert_eq!(current.unwrap(), b"v1");
            Ok(Some(b"v2".to_vec()))
        })
        .unwrap()
        .unwrap();
    assert_eq!(updated.value(), b"v2");
    assert!(updated.id() > created.id());

    let removed = store.compute(b"k", |_, _| Ok(None)).unwrap();
    assert!(removed.is_none());
    assert!(store.get(b"k").unwrap().is_none());

    let kinds: Vec<_> = listener
        .events()
        .iter()
        .map(|e| match e {
            StoreEvent::Created { .. } => "created",
            StoreEvent::Updated { .. } => "updated",
            StoreEvent::Removed { .. } => "removed",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["created", "updated", "removed"]);
}

#[test]
fn test_compute_equal_value_without_replace_only_touches() {
    let (store, _, listener) = store_with(Arc::new(NoExpiry));
    store.put(b"k", b"v").unwrap();
    let before = store.get(b"k").unwrap().unwrap();

    let after = store
        .compute_with(b"k", |_, _| Ok(Some(b"v".to_vec())), false)
        .unwrap()
        .unwrap();
    assert_eq!(after.id(), before.id());

    let updated = listener
        .events()
        .iter()
        .filter(|e| matches!(e, StoreEvent::Updated { .. }))
        .count();
    assert_eq!(updated, 0);
}

#[test]
fn test_compute_closure_failure_publishes_nothing() {
    let (store, _, listener) = store_with(Arc::new(NoExpiry));
    store.put(b"k", b"v").unwrap();
    let published_before = listener.events().len();

    let result = store.compute(b"k", |_, _| Err("user closure failed".into()));
    assert!(matches!(result, Err(StoreError::StoreAccess(_))));

    // Mapping untouched, and the failed operation published nothing.
    assert_eq!(store.get(b"k").unwrap().unwrap().value(), b"v");
    assert_eq!(listener.events().len(), published_before);
}

#[test]
fn test_compute_if_absent_runs_once() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));

    let mut calls = 0;
    let holder = store
        .compute_if_absent(b"k", |_| {
            calls += 1;
            Ok(Some(b"v".to_vec()))
        })
        .unwrap()
        .unwrap();
    assert_eq!(holder.value(), b"v");
    assert_eq!(calls, 1);

    // Present: the mapping function must not run.
    let hit = store
        .compute_if_absent(b"k", |_| {
            panic!("mapping function ran for a present key");
        })
        .unwrap()
        .unwrap();
    assert_eq!(hit.value(), b"v");
}

#[test]
fn test_bulk_compute() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));
    store.put(b"a", b"1").unwrap();

    let results = store
        .bulk_compute(&[b"a".as_slice(), b"b".as_slice()], |_, current| {
            Ok(Some(match current {
                Some(v) => [v, b"!".as_slice()].concat(),
                None => b"fresh".to_vec(),
            }))
        })
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].1.as_ref().unwrap().value(), b"1!");
    assert_eq!(results[1].1.as_ref().unwrap().value(), b"fresh");
}

#[test]
fn test_bulk_compute_if_absent() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));
    store.put(b"a", b"old").unwrap();

    let results = store
        .bulk_compute_if_absent(&[b"a".as_slice(), b"b".as_slice()], |key| {
            Ok(Some([b"new-".as_slice(), key].concat()))
        })
        .unwrap();

    assert_eq!(results[0].1.as_ref().unwrap().value(), b"old");
    assert_eq!(results[1].1.as_ref().unwrap().value(), b"new-b");
}

// =============================================================================
// Validation, iteration, stats
// =============================================================================

#[test]
fn test_invalid_arguments_fail_fast() {
    let (store, _, listener) = store_with(Arc::new(NoExpiry));

    assert!(matches!(
        store.put(b"", b"v"),
        Err(StoreError::InvalidArgument(_))
    ));
    let long_key = vec![b'k'; 5_000];
    assert!(matches!(
        store.get(&long_key),
        Err(StoreError::InvalidArgument(_))
    ));
    let long_value = vec![b'v'; 64 * 1024];
    assert!(matches!(
        store.put(b"k", &long_value),
        Err(StoreError::InvalidArgument(_))
    ));

    assert!(listener.events().is_empty());
    assert!(store.get(b"k").unwrap().is_none());
}

#[test]
fn test_iterator_yields_live_entries() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));
    for i in 0..20u32 {
        store
            .put(format!("key-{i}").as_bytes(), &i.to_le_bytes())
            .unwrap();
    }
    store.remove(b"key-3").unwrap();

    let mut keys: Vec<_> = store.iter().map(|(k, _)| k).collect();
    keys.sort();
    assert_eq!(keys.len(), 19);
    assert!(!keys.contains(&b"key-3".to_vec().into_boxed_slice()));
}

#[test]
fn test_clear_drops_everything_silently() {
    let (store, _, listener) = store_with(Arc::new(NoExpiry));
    for i in 0..10u32 {
        store.put(format!("key-{i}").as_bytes(), b"v").unwrap();
    }
    let published = listener.events().len();

    store.clear().unwrap();
    assert_eq!(store.memory_stats().long_size, 0);
    assert_eq!(store.memory_stats().occupied_memory, 0);
    assert!(store.get(b"key-0").unwrap().is_none());
    // clear publishes no events
    assert_eq!(listener.events().len(), published);
}

#[test]
fn test_ids_increase_per_key() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));
    let mut last = 0;
    for i in 0..5u32 {
        store.put(b"k", &i.to_le_bytes()).unwrap();
        let id = store.get(b"k").unwrap().unwrap().id();
        assert!(id > last);
        last = id;
    }
}

#[test]
fn test_memory_stats_track_entries() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));
    let empty = store.memory_stats();
    assert_eq!(empty.long_size, 0);
    assert_eq!(empty.occupied_memory, 0);

    store.put(b"key", b"some-value-bytes").unwrap();
    let one = store.memory_stats();
    assert_eq!(one.long_size, 1);
    assert!(one.occupied_memory > 0);
    assert!(one.allocated_memory >= one.occupied_memory);
    assert_eq!(one.data_size, (b"key".len() + b"some-value-bytes".len()) as u64);
    assert_eq!(one.used_slot_count, 1);
    assert!(one.table_capacity >= 32);

    store.remove(b"key").unwrap();
    let gone = store.memory_stats();
    assert_eq!(gone.long_size, 0);
    assert_eq!(gone.occupied_memory, 0);
    assert_eq!(gone.removed_slot_count, 1);
}

#[test]
fn test_outcome_counters() {
    let (store, _, _) = store_with(Arc::new(NoExpiry));

    store.put(b"k", b"v1").unwrap();
    store.put(b"k", b"v2").unwrap();
    store.get(b"k").unwrap();
    store.get(b"missing").unwrap();
    store.remove(b"k").unwrap();
    store.remove(b"k").unwrap();

    let stats = store.stats();
    assert_eq!(stats.put_put, 1);
    assert_eq!(stats.put_update, 1);
    assert_eq!(stats.get_hit, 1);
    assert_eq!(stats.get_miss, 1);
    assert_eq!(stats.remove_removed, 1);
    assert_eq!(stats.remove_miss, 1);
}

// =============================================================================
// Oversize protocol
// =============================================================================

fn tiny_store() -> OffHeapStore {
    // One 64KiB page total: two 32KiB-class blocks fit, a third does not.
    OffHeapStore::builder()
        .config(
            StoreConfig::new()
                .with_segment_count(1)
                .with_arena_capacity(64 * 1024)
                .with_page_size(64 * 1024)
                .with_initial_slots_per_segment(8),
        )
        .build()
        .unwrap()
}

#[test]
fn test_oversize_resolved_by_valve() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let store = Arc::new(tiny_store());
    let value = vec![0u8; 20 * 1024];

    store.put(b"k1", &value).unwrap();
    store.put(b"k2", &value).unwrap();
    // Pin both so neither self-eviction nor shrink can reclaim them.
    store.get_and_fault(b"k1").unwrap().unwrap();
    store.get_and_fault(b"k2").unwrap().unwrap();

    let invoked = Arc::new(AtomicBool::new(false));
    {
        let inner = store.clone();
        let flag = invoked.clone();
        store.register_emergency_valve(move || {
            flag.store(true, Ordering::SeqCst);
            // Drain: give up the oldest pinned entry.
            inner.invalidate(b"k1")?;
            Ok(())
        });
    }

    assert_eq!(store.put(b"k3", &value).unwrap(), PutStatus::Put);
    assert!(invoked.load(Ordering::SeqCst));
    assert_eq!(store.get(b"k3").unwrap().unwrap().value(), &value[..]);
    assert!(store.get(b"k1").unwrap().is_none());
}

#[test]
fn test_oversize_without_valve_is_store_access_error() {
    let store = tiny_store();
    let value = vec![0u8; 20 * 1024];

    store.put(b"k1", &value).unwrap();
    store.put(b"k2", &value).unwrap();
    store.get_and_fault(b"k1").unwrap().unwrap();
    store.get_and_fault(b"k2").unwrap().unwrap();

    let result = store.put(b"k3", &value);
    assert!(matches!(result, Err(StoreError::StoreAccess(_))));
    assert!(store.get(b"k3").unwrap().is_none());
    // The survivors were vetoed by the remediation walk.
    for (_, holder) in store.iter() {
        assert!(holder.is_vetoed());
    }
}

#[test]
fn test_element_too_large_for_empty_store() {
    let store = OffHeapStore::builder()
        .config(
            StoreConfig::new()
                .with_segment_count(1)
                .with_arena_capacity(64 * 1024)
                .with_page_size(64 * 1024)
                .with_max_value_len(256 * 1024),
        )
        .build()
        .unwrap();

    // Larger than the largest size class: no remediation can help.
    let huge = vec![0u8; 128 * 1024];
    let result = store.put(b"k", &huge);
    assert!(matches!(result, Err(StoreError::StoreAccess(_))));
}
