//! Size-class byte arena over an explicitly managed memory region.
//!
//! The arena reserves one contiguous region at construction and partitions
//! it on demand into fixed-size pages. Each page is carved into slots of a
//! single size class; free slots and free pages recycle through lock-free
//! queues, so any number of segments can allocate and free concurrently.
//!
//! Allocation failure is the oversize signal: the arena does not defragment
//! or grow. Remediation (shrinking other segments, the emergency valve, the
//! veto walk) is coordinated above it by the segmented map.
//!
//! Each slot stores a 4-byte length prefix followed by the block data, so
//! the arena can account for exact occupancy without knowing the entry
//! layout.

use std::alloc::{alloc, dealloc, Layout};

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::sync::{AtomicU64, Ordering};

/// Smallest slot size. Below this, class overhead dominates.
const MIN_SLOT_SIZE: usize = 64;

/// Per-block length prefix.
const BLOCK_PREFIX: usize = 4;

/// Handle to an allocated block: packed `(class, page, slot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle(u64);

impl BlockHandle {
    #[inline]
    fn pack(class: usize, page: u32, slot: u16) -> Self {
        BlockHandle(((class as u64) << 48) | ((page as u64) << 16) | slot as u64)
    }

    #[inline]
    fn class(self) -> usize {
        (self.0 >> 48) as usize
    }

    #[inline]
    fn page(self) -> u32 {
        ((self.0 >> 16) & 0xFFFF_FFFF) as u32
    }

    #[inline]
    fn slot(self) -> u16 {
        self.0 as u16
    }
}

/// One size class: a slot size plus its free list.
struct SizeClass {
    slot_size: usize,
    /// Free slots, packed as `page << 16 | slot`.
    free: Injector<u64>,
}

/// Backing region obtained from the global allocator.
struct Region {
    ptr: *mut u8,
    layout: Layout,
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc with this exact layout and is
        // deallocated exactly once.
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// Concurrent size-class arena.
pub struct Arena {
    region: Region,
    page_size: usize,
    capacity: usize,
    classes: Vec<SizeClass>,
    free_pages: Injector<u32>,
    /// Serializes page carving so two allocators don't both grab a page for
    /// the same class.
    carve_lock: Mutex<()>,

    allocated: AtomicU64,
    occupied: AtomicU64,
    data_occupied: AtomicU64,
    live_blocks: AtomicU64,
}

// SAFETY: the region pointer is stable for the arena's lifetime, slot
// ownership is handed out exclusively through the lock-free free lists, and
// all block data access goes through the unsafe accessors whose contract
// requires the owning segment's lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an arena over a fresh region of `capacity` bytes, carved into
    /// pages of `page_size` bytes.
    ///
    /// `page_size` must be a power of two no smaller than [`MIN_SLOT_SIZE`];
    /// `capacity` is rounded down to whole pages and must cover at least one.
    pub fn new(capacity: usize, page_size: usize) -> StoreResult<Self> {
        if !page_size.is_power_of_two() || page_size < MIN_SLOT_SIZE {
            return Err(StoreError::InvalidArgument(
                "arena page size must be a power of two of at least 64 bytes",
            ));
        }
        let page_count = capacity / page_size;
        if page_count == 0 {
            return Err(StoreError::InvalidArgument(
                "arena capacity smaller than one page",
            ));
        }
        let capacity = page_count * page_size;

        let layout = Layout::from_size_align(capacity, MIN_SLOT_SIZE)
            .map_err(|e| StoreError::StoreAccess(format!("arena layout: {e}")))?;
        // SAFETY: layout has non-zero size (checked above).
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(StoreError::StoreAccess(
                "arena region allocation failed".to_string(),
            ));
        }

        let mut classes = Vec::new();
        let mut slot_size = MIN_SLOT_SIZE;
        while slot_size <= page_size {
            classes.push(SizeClass {
                slot_size,
                free: Injector::new(),
            });
            slot_size *= 2;
        }

        let free_pages = Injector::new();
        for page in 0..page_count as u32 {
            free_pages.push(page);
        }

        Ok(Self {
            region: Region { ptr, layout },
            page_size,
            capacity,
            classes,
            free_pages,
            carve_lock: Mutex::new(()),
            allocated: AtomicU64::new(0),
            occupied: AtomicU64::new(0),
            data_occupied: AtomicU64::new(0),
            live_blocks: AtomicU64::new(0),
        })
    }

    /// Allocate a block of `len` bytes.
    ///
    /// Returns `None` when the request cannot be satisfied: either `len`
    /// exceeds the largest class, or every page is carved and the class free
    /// list is empty. Both are oversize conditions for the caller.
    pub(crate) fn allocate(&self, len: usize) -> Option<BlockHandle> {
        let total = len + BLOCK_PREFIX;
        let class_idx = self.classes.iter().position(|c| c.slot_size >= total)?;

        let packed = loop {
            if let Some(packed) = self.pop_slot(class_idx) {
                break packed;
            }
            // No free slot; carve a page or report exhaustion.
            self.carve_page_for(class_idx)?;
        };

        let handle = BlockHandle::pack(class_idx, (packed >> 16) as u32, packed as u16);
        let slot_size = self.classes[class_idx].slot_size;

        // SAFETY: the slot was just popped from a free list, so no live
        // block aliases it.
        unsafe {
            let ptr = self.slot_ptr(handle);
            ptr.cast::<[u8; BLOCK_PREFIX]>()
                .write((len as u32).to_le_bytes());
        }

        self.occupied.fetch_add(slot_size as u64, Ordering::Relaxed);
        self.data_occupied.fetch_add(len as u64, Ordering::Relaxed);
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        Some(handle)
    }

    /// Return a block to its class free list.
    pub(crate) fn free(&self, handle: BlockHandle) {
        let class = &self.classes[handle.class()];
        // SAFETY: handle refers to a live block owned by the caller.
        let len = unsafe { self.block_len(handle) };

        self.occupied
            .fetch_sub(class.slot_size as u64, Ordering::Relaxed);
        self.data_occupied.fetch_sub(len as u64, Ordering::Relaxed);
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);

        class
            .free
            .push(((handle.page() as u64) << 16) | handle.slot() as u64);
    }

    /// Borrow a block's data bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the block (hold the lock of the segment whose
    /// slot references it) and must not hold a mutable borrow of the same
    /// block.
    pub(crate) unsafe fn block_bytes<'a>(&self, handle: BlockHandle) -> &'a [u8] {
        // SAFETY: per the function contract.
        unsafe {
            let len = self.block_len(handle);
            std::slice::from_raw_parts(self.slot_ptr(handle).add(BLOCK_PREFIX), len)
        }
    }

    /// Borrow a block's data bytes mutably.
    ///
    /// # Safety
    ///
    /// The caller must own the block (hold the lock of the segment whose
    /// slot references it); no other borrow of the block may exist.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn block_bytes_mut<'a>(&self, handle: BlockHandle) -> &'a mut [u8] {
        // SAFETY: per the function contract.
        unsafe {
            let len = self.block_len(handle);
            std::slice::from_raw_parts_mut(self.slot_ptr(handle).add(BLOCK_PREFIX), len)
        }
    }

    /// Total region capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    /// Bytes carved into pages so far.
    #[inline]
    pub fn allocated_memory(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Slot bytes held by live blocks (includes class rounding and the
    /// per-block prefix).
    #[inline]
    pub fn occupied_memory(&self) -> u64 {
        self.occupied.load(Ordering::Relaxed)
    }

    /// Slot bytes held by live blocks minus arena bookkeeping.
    #[inline]
    pub fn data_allocated_memory(&self) -> u64 {
        self.occupied_memory()
            .saturating_sub(self.live_blocks() * BLOCK_PREFIX as u64)
    }

    /// Exact bytes requested by live blocks.
    #[inline]
    pub fn data_occupied_memory(&self) -> u64 {
        self.data_occupied.load(Ordering::Relaxed)
    }

    /// Number of live blocks.
    #[inline]
    pub fn live_blocks(&self) -> u64 {
        self.live_blocks.load(Ordering::Relaxed)
    }

    fn pop_slot(&self, class_idx: usize) -> Option<u64> {
        let class = &self.classes[class_idx];
        loop {
            match class.free.steal() {
                Steal::Success(packed) => return Some(packed),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Carve one fresh page into slots for `class_idx`.
    fn carve_page_for(&self, class_idx: usize) -> Option<()> {
        let _guard = self.carve_lock.lock();

        // Another thread may have carved while we waited for the lock.
        if !self.classes[class_idx].free.is_empty() {
            return Some(());
        }

        let page = loop {
            match self.free_pages.steal() {
                Steal::Success(page) => break page,
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        };

        let class = &self.classes[class_idx];
        let slots = self.page_size / class.slot_size;
        for slot in 0..slots as u16 {
            class.free.push(((page as u64) << 16) | slot as u64);
        }
        self.allocated
            .fetch_add(self.page_size as u64, Ordering::Relaxed);
        Some(())
    }

    #[inline]
    fn slot_ptr(&self, handle: BlockHandle) -> *mut u8 {
        let class = &self.classes[handle.class()];
        let offset = handle.page() as usize * self.page_size + handle.slot() as usize * class.slot_size;
        debug_assert!(offset + class.slot_size <= self.capacity);
        // SAFETY: offset is within the region (slot came from a free list
        // populated only with in-bounds slots).
        unsafe { self.region.ptr.add(offset) }
    }

    /// # Safety
    ///
    /// `handle` must refer to a live block.
    #[inline]
    unsafe fn block_len(&self, handle: BlockHandle) -> usize {
        // SAFETY: per the function contract; the prefix was written at
        // allocation time.
        let prefix = unsafe { self.slot_ptr(handle).cast::<[u8; BLOCK_PREFIX]>().read() };
        u32::from_le_bytes(prefix) as usize
    }
}
