//! Synchronization primitives with optional loom support.
//!
//! Atomic types resolve to std in production builds and to loom under the
//! `loom` feature, so the lock-free arena paths can be model checked without
//! paying for it in release builds.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
