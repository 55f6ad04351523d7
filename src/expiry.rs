//! Expiry policy collaborator.
//!
//! The store never computes lifetimes itself; every create, access, and
//! update consults an [`Expiry`] implementation. A verdict of zero means
//! "expire immediately", [`ExpiryDuration::Forever`] means "never expire",
//! and `None` (where allowed) means "leave the current expiration alone".
//!
//! A failing expiry collaborator must not take the store down: callers catch
//! the error, log it, and proceed with a zero duration.

use std::time::Duration;

use crate::error::DynError;
use crate::holder::{ValueHolder, NO_EXPIRE};

/// A lifetime verdict from the expiry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryDuration {
    /// Expire this long after the decision point. Zero expires immediately.
    Finite(Duration),
    /// Never expire.
    Forever,
}

impl ExpiryDuration {
    /// The immediate-expiry verdict.
    pub const ZERO: ExpiryDuration = ExpiryDuration::Finite(Duration::ZERO);

    /// Whether this verdict expires the entry immediately.
    #[inline]
    pub fn is_zero(&self) -> bool {
        matches!(self, ExpiryDuration::Finite(d) if d.is_zero())
    }
}

/// Compute an absolute expiration time in milliseconds.
///
/// Finite durations saturate: any overflow past `u64::MAX` (which doubles as
/// the no-expire sentinel) simply never expires.
pub(crate) fn expire_time_ms(now_ms: u64, duration: &ExpiryDuration) -> u64 {
    match duration {
        ExpiryDuration::Forever => NO_EXPIRE,
        ExpiryDuration::Finite(d) => {
            let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            now_ms.saturating_add(millis)
        }
    }
}

/// Expiry policy consulted on create, access, and update.
pub trait Expiry: Send + Sync {
    /// Lifetime of a newly created mapping. Zero suppresses the install.
    fn for_creation(&self, key: &[u8], value: &[u8]) -> Result<ExpiryDuration, DynError>;

    /// Lifetime adjustment for a successful read. `None` leaves the
    /// expiration unchanged; zero expires the entry now.
    fn for_access(&self, key: &[u8], holder: &ValueHolder)
        -> Result<Option<ExpiryDuration>, DynError>;

    /// Lifetime adjustment for an update. `None` keeps the previous holder's
    /// expiration; zero expires the fresh value immediately.
    fn for_update(
        &self,
        key: &[u8],
        existing: &ValueHolder,
        new_value: &[u8],
    ) -> Result<Option<ExpiryDuration>, DynError>;
}

/// Entries never expire.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExpiry;

impl Expiry for NoExpiry {
    fn for_creation(&self, _key: &[u8], _value: &[u8]) -> Result<ExpiryDuration, DynError> {
        Ok(ExpiryDuration::Forever)
    }

    fn for_access(
        &self,
        _key: &[u8],
        _holder: &ValueHolder,
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }

    fn for_update(
        &self,
        _key: &[u8],
        _existing: &ValueHolder,
        _new_value: &[u8],
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }
}

/// Fixed time-to-live from creation and from every update.
///
/// Reads do not extend the lifetime.
#[derive(Debug, Clone, Copy)]
pub struct TimeToLive {
    ttl: Duration,
}

impl TimeToLive {
    /// Create a TTL policy.
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl Expiry for TimeToLive {
    fn for_creation(&self, _key: &[u8], _value: &[u8]) -> Result<ExpiryDuration, DynError> {
        Ok(ExpiryDuration::Finite(self.ttl))
    }

    fn for_access(
        &self,
        _key: &[u8],
        _holder: &ValueHolder,
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(None)
    }

    fn for_update(
        &self,
        _key: &[u8],
        _existing: &ValueHolder,
        _new_value: &[u8],
    ) -> Result<Option<ExpiryDuration>, DynError> {
        Ok(Some(ExpiryDuration::Finite(self.ttl)))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_zero_detection() {
        assert!(ExpiryDuration::ZERO.is_zero());
        assert!(!ExpiryDuration::Finite(Duration::from_millis(1)).is_zero());
        assert!(!ExpiryDuration::Forever.is_zero());
    }

    #[test]
    fn test_expire_time_saturates() {
        let near_max = ExpiryDuration::Finite(Duration::from_millis(u64::MAX - 10));
        assert_eq!(expire_time_ms(100, &near_max), u64::MAX);
        assert_eq!(expire_time_ms(100, &ExpiryDuration::Forever), NO_EXPIRE);
        assert_eq!(
            expire_time_ms(100, &ExpiryDuration::Finite(Duration::from_millis(900))),
            1_000
        );
    }

    #[test]
    fn test_time_to_live_policy() {
        let expiry = TimeToLive::new(Duration::from_secs(1));
        assert_eq!(
            expiry.for_creation(b"k", b"v").unwrap(),
            ExpiryDuration::Finite(Duration::from_secs(1))
        );
        let holder = ValueHolder::new(1, b"v", 0, 1_000);
        assert_eq!(expiry.for_access(b"k", &holder).unwrap(), None);
    }
}
