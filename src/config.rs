//! Store configuration.

/// Sizing and validation knobs for an off-heap store.
///
/// Segment count is rounded up to a power of two; the arena capacity is
/// rounded down to whole pages.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of concurrent segments.
    pub(crate) segment_count: usize,
    /// Arena region size in bytes.
    pub(crate) arena_capacity: usize,
    /// Arena page size in bytes (power of two).
    pub(crate) page_size: usize,
    /// Initial slot-table capacity per segment.
    pub(crate) initial_slots_per_segment: usize,
    /// Longest accepted key.
    pub(crate) max_key_len: usize,
    /// Longest accepted value.
    pub(crate) max_value_len: usize,
    /// Entries a single cross-segment shrink pass may evict per segment.
    pub(crate) shrink_budget: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_count: 16,
            arena_capacity: 64 * 1024 * 1024,
            page_size: 64 * 1024,
            initial_slots_per_segment: 64,
            max_key_len: 4 * 1024,
            max_value_len: 32 * 1024,
            shrink_budget: 8,
        }
    }
}

impl StoreConfig {
    /// Create a config with default sizing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of segments.
    pub fn with_segment_count(mut self, count: usize) -> Self {
        self.segment_count = count;
        self
    }

    /// Set the arena region size in bytes.
    pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = bytes;
        self
    }

    /// Set the arena page size in bytes.
    pub fn with_page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Set the initial slot-table capacity per segment.
    pub fn with_initial_slots_per_segment(mut self, slots: usize) -> Self {
        self.initial_slots_per_segment = slots;
        self
    }

    /// Set the longest accepted key.
    pub fn with_max_key_len(mut self, len: usize) -> Self {
        self.max_key_len = len;
        self
    }

    /// Set the longest accepted value.
    pub fn with_max_value_len(mut self, len: usize) -> Self {
        self.max_value_len = len;
        self
    }

    /// Set the per-segment eviction budget of a shrink pass.
    pub fn with_shrink_budget(mut self, entries: usize) -> Self {
        self.shrink_budget = entries.max(1);
        self
    }
}
