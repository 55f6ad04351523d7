//! Value holders and the arena entry layout.
//!
//! A [`ValueHolder`] is the owned working copy of one arena-backed entry,
//! decoded under the owning segment's write lock. Mutators touch only the
//! copy; [`ValueHolder::write_back`] requests that the segment persist the
//! mutable header fields into the block before the lock is released.
//!
//! # Entry layout
//!
//! ```text
//! offset  field
//!      0  id            u64 le
//!      8  creation      u64 le (ms)
//!     16  last_access   u64 le (ms)
//!     24  expiration    u64 le (ms, NO_EXPIRE = never)
//!     32  hits          u64 le
//!     40  key_len       u32 le
//!     44  value_len     u32 le
//!     48  key bytes, then value bytes
//! ```
//!
//! `id`, `creation`, and the key/value bytes are immutable for the lifetime
//! of a block; write-back rewrites only `last_access`, `expiration`, and
//! `hits`.

use crate::expiry::ExpiryDuration;

/// Sentinel expiration meaning "never expire".
pub const NO_EXPIRE: u64 = u64::MAX;

/// Fixed entry header length in bytes.
pub(crate) const ENTRY_HEADER_LEN: usize = 48;

const OFF_ID: usize = 0;
const OFF_CREATION: usize = 8;
const OFF_LAST_ACCESS: usize = 16;
const OFF_EXPIRATION: usize = 24;
const OFF_HITS: usize = 32;
const OFF_KEY_LEN: usize = 40;
const OFF_VALUE_LEN: usize = 44;

/// Lifecycle metadata and value bytes for one stored entry.
#[derive(Debug, Clone)]
pub struct ValueHolder {
    id: u64,
    creation_ms: u64,
    last_access_ms: u64,
    expiration_ms: u64,
    hits: u64,
    value: Box<[u8]>,
    pinned: bool,
    vetoed: bool,
    dirty: bool,
    detached: bool,
}

impl ValueHolder {
    /// Create a holder for a freshly created mapping.
    pub fn new(id: u64, value: &[u8], now_ms: u64, expiration_ms: u64) -> Self {
        Self {
            id,
            creation_ms: now_ms,
            last_access_ms: now_ms,
            expiration_ms,
            hits: 0,
            value: value.into(),
            pinned: false,
            vetoed: false,
            dirty: false,
            detached: false,
        }
    }

    /// Create a holder that transfers an existing entry between tiers,
    /// preserving its identity, timestamps, and hit count.
    pub fn transfer(
        id: u64,
        value: &[u8],
        creation_ms: u64,
        last_access_ms: u64,
        expiration_ms: u64,
        hits: u64,
    ) -> Self {
        Self {
            id,
            creation_ms,
            last_access_ms,
            expiration_ms,
            hits,
            value: value.into(),
            pinned: false,
            vetoed: false,
            dirty: false,
            detached: false,
        }
    }

    /// Segment-assigned identifier, strictly increasing per key.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Creation time in milliseconds.
    #[inline]
    pub fn creation_time_ms(&self) -> u64 {
        self.creation_ms
    }

    /// Last access time in milliseconds.
    #[inline]
    pub fn last_access_time_ms(&self) -> u64 {
        self.last_access_ms
    }

    /// Absolute expiration time in milliseconds, [`NO_EXPIRE`] for never.
    #[inline]
    pub fn expiration_time_ms(&self) -> u64 {
        self.expiration_ms
    }

    /// Number of recorded accesses.
    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Stored value bytes.
    #[inline]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Whether the slot was pinned (faulted into an upper tier) when this
    /// copy was taken.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Whether the eviction policy had vetoed the slot when this copy was
    /// taken.
    #[inline]
    pub fn is_vetoed(&self) -> bool {
        self.vetoed
    }

    /// Whether the entry is expired at `now_ms`.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_ms != NO_EXPIRE && now_ms >= self.expiration_ms
    }

    /// Record an access at `now_ms` and apply the expiry verdict.
    ///
    /// A zero verdict never reaches the holder; the caller expires the entry
    /// instead. `None` leaves the expiration unchanged.
    pub fn accessed(&mut self, now_ms: u64, duration: Option<&ExpiryDuration>) {
        debug_assert!(!matches!(duration, Some(d) if d.is_zero()));
        self.last_access_ms = now_ms;
        self.hits += 1;
        if let Some(duration) = duration {
            self.expiration_ms = crate::expiry::expire_time_ms(now_ms, duration);
        }
    }

    /// Copy access/expiration/hit metadata from `other` iff the ids match.
    pub fn update_metadata(&mut self, other: &ValueHolder) {
        if other.id == self.id {
            self.last_access_ms = other.last_access_ms;
            self.expiration_ms = other.expiration_ms;
            self.hits = other.hits;
        }
    }

    /// Request that in-memory metadata changes be persisted to the backing
    /// block. The owning segment performs the write while its lock is held.
    pub fn write_back(&mut self) {
        self.dirty = true;
    }

    /// Mark the holder as independent of its slot, for upper-tier handoff.
    /// A write-back requested before detaching still lands on the resident
    /// block; the detached copy itself is self-contained from here on.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    /// Whether a write-back is pending.
    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the holder has been handed off to an upper tier.
    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    #[inline]
    pub(crate) fn set_slot_flags(&mut self, pinned: bool, vetoed: bool) {
        self.pinned = pinned;
        self.vetoed = vetoed;
    }
}

/// Total encoded length of an entry.
#[inline]
pub(crate) fn encoded_entry_len(key_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_LEN + key_len + value_len
}

/// Encode a holder and its key into `block`.
///
/// `block` must be exactly `encoded_entry_len(key.len(), value.len())` bytes.
pub(crate) fn encode_entry(holder: &ValueHolder, key: &[u8], block: &mut [u8]) {
    let value = holder.value();
    debug_assert_eq!(block.len(), encoded_entry_len(key.len(), value.len()));

    block[OFF_ID..OFF_ID + 8].copy_from_slice(&holder.id.to_le_bytes());
    block[OFF_CREATION..OFF_CREATION + 8].copy_from_slice(&holder.creation_ms.to_le_bytes());
    block[OFF_LAST_ACCESS..OFF_LAST_ACCESS + 8]
        .copy_from_slice(&holder.last_access_ms.to_le_bytes());
    block[OFF_EXPIRATION..OFF_EXPIRATION + 8].copy_from_slice(&holder.expiration_ms.to_le_bytes());
    block[OFF_HITS..OFF_HITS + 8].copy_from_slice(&holder.hits.to_le_bytes());
    block[OFF_KEY_LEN..OFF_KEY_LEN + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    block[OFF_VALUE_LEN..OFF_VALUE_LEN + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());

    let key_end = ENTRY_HEADER_LEN + key.len();
    block[ENTRY_HEADER_LEN..key_end].copy_from_slice(key);
    block[key_end..key_end + value.len()].copy_from_slice(value);
}

/// Decode a block into an owned holder (value bytes copied out).
pub(crate) fn decode_entry(block: &[u8]) -> ValueHolder {
    let key_len = read_u32(block, OFF_KEY_LEN) as usize;
    let value_len = read_u32(block, OFF_VALUE_LEN) as usize;
    let value_start = ENTRY_HEADER_LEN + key_len;

    ValueHolder {
        id: read_u64(block, OFF_ID),
        creation_ms: read_u64(block, OFF_CREATION),
        last_access_ms: read_u64(block, OFF_LAST_ACCESS),
        expiration_ms: read_u64(block, OFF_EXPIRATION),
        hits: read_u64(block, OFF_HITS),
        value: block[value_start..value_start + value_len].into(),
        pinned: false,
        vetoed: false,
        dirty: false,
        detached: false,
    }
}

/// Borrow the key bytes of an encoded entry.
#[inline]
pub(crate) fn entry_key(block: &[u8]) -> &[u8] {
    let key_len = read_u32(block, OFF_KEY_LEN) as usize;
    &block[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + key_len]
}

/// Payload length (key + value, excluding the header) of an encoded entry.
#[inline]
pub(crate) fn entry_payload_len(block: &[u8]) -> usize {
    read_u32(block, OFF_KEY_LEN) as usize + read_u32(block, OFF_VALUE_LEN) as usize
}

/// Rewrite the mutable header fields of an encoded entry.
pub(crate) fn write_back_entry(holder: &ValueHolder, block: &mut [u8]) {
    debug_assert_eq!(read_u64(block, OFF_ID), holder.id);
    block[OFF_LAST_ACCESS..OFF_LAST_ACCESS + 8]
        .copy_from_slice(&holder.last_access_ms.to_le_bytes());
    block[OFF_EXPIRATION..OFF_EXPIRATION + 8].copy_from_slice(&holder.expiration_ms.to_le_bytes());
    block[OFF_HITS..OFF_HITS + 8].copy_from_slice(&holder.hits.to_le_bytes());
}

#[inline]
fn read_u64(block: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(block[offset..offset + 8].try_into().unwrap())
}

#[inline]
fn read_u32(block: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap())
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_roundtrip_entry_encoding() {
        let holder = ValueHolder::new(7, b"value-bytes", 100, 1_100);
        let key = b"some-key";
        let mut block = vec![0u8; encoded_entry_len(key.len(), holder.value().len())];
        encode_entry(&holder, key, &mut block);

        assert_eq!(entry_key(&block), key);
        assert_eq!(entry_payload_len(&block), key.len() + holder.value().len());

        let decoded = decode_entry(&block);
        assert_eq!(decoded.id(), 7);
        assert_eq!(decoded.creation_time_ms(), 100);
        assert_eq!(decoded.last_access_time_ms(), 100);
        assert_eq!(decoded.expiration_time_ms(), 1_100);
        assert_eq!(decoded.hits(), 0);
        assert_eq!(decoded.value(), b"value-bytes");
    }

    #[test]
    fn test_write_back_touches_only_mutable_fields() {
        let mut holder = ValueHolder::new(3, b"v", 0, 500);
        let key = b"k";
        let mut block = vec![0u8; encoded_entry_len(key.len(), 1)];
        encode_entry(&holder, key, &mut block);

        holder.accessed(250, Some(&ExpiryDuration::Finite(Duration::from_millis(500))));
        write_back_entry(&holder, &mut block);

        let decoded = decode_entry(&block);
        assert_eq!(decoded.creation_time_ms(), 0);
        assert_eq!(decoded.last_access_time_ms(), 250);
        assert_eq!(decoded.expiration_time_ms(), 750);
        assert_eq!(decoded.hits(), 1);
        assert_eq!(decoded.value(), b"v");
    }

    #[test]
    fn test_accessed_applies_verdicts() {
        let mut holder = ValueHolder::new(1, b"v", 0, 1_000);

        holder.accessed(10, None);
        assert_eq!(holder.expiration_time_ms(), 1_000);
        assert_eq!(holder.last_access_time_ms(), 10);
        assert_eq!(holder.hits(), 1);

        holder.accessed(20, Some(&ExpiryDuration::Forever));
        assert_eq!(holder.expiration_time_ms(), NO_EXPIRE);

        holder.accessed(30, Some(&ExpiryDuration::Finite(Duration::from_millis(70))));
        assert_eq!(holder.expiration_time_ms(), 100);
    }

    #[test]
    fn test_update_metadata_requires_matching_id() {
        let mut resident = ValueHolder::new(5, b"v", 0, 1_000);
        let mut upstairs = ValueHolder::transfer(5, b"v", 0, 0, 1_000, 0);
        upstairs.accessed(400, None);

        resident.update_metadata(&upstairs);
        assert_eq!(resident.last_access_time_ms(), 400);
        assert_eq!(resident.hits(), 1);

        let stranger = ValueHolder::new(6, b"v", 0, 2_000);
        resident.update_metadata(&stranger);
        assert_eq!(resident.expiration_time_ms(), 1_000);
    }

    #[test]
    fn test_detach_keeps_requested_write_back() {
        let mut holder = ValueHolder::new(1, b"v", 0, NO_EXPIRE);
        holder.write_back();
        holder.detach();
        assert!(holder.is_dirty());
        assert!(holder.is_detached());
    }

    #[test]
    fn test_expiry_boundary() {
        let holder = ValueHolder::new(1, b"v", 0, 1_000);
        assert!(!holder.is_expired(999));
        assert!(holder.is_expired(1_000));
        assert!(holder.is_expired(2_000));

        let forever = ValueHolder::new(2, b"v", 0, NO_EXPIRE);
        assert!(!forever.is_expired(u64::MAX));
    }
}
