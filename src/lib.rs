//! Off-heap, partitioned, LRU-ordered key/value hash-entry engine.
//!
//! Entries of arbitrary byte length live outside the managed heap as chains
//! of fixed-size blocks. A fixed table of partitions indexes entries by
//! hash; each partition keeps an intrusive doubly-linked LRU list threaded
//! through the entry headers. The engine covers chain serialization, lookup,
//! LRU maintenance, entry-level locking, streaming reads/writes over chains
//! and bulk eviction; cache policy (what to insert, when to evict) belongs
//! to the layer above.

mod blocks;
mod entries;
mod layout;
mod partitions;
mod raw;
mod source;
mod stream;

pub(crate) mod metrics;
pub(crate) mod sync;

use blocks::Blocks;
use layout::Geometry;
use partitions::Partitions;

pub use layout::{round_up8, BLOCK_HEADER_SIZE, ENTRY_HEADER_SIZE};
pub use metrics::{Counter, Gauge, StoreMetrics};
pub use partitions::PartitionGuard;
pub use source::{BytesSink, BytesSource};
pub use stream::{EntryReader, EntryWriter, StreamError};

use clocksource::coarse::AtomicInstant;

const MB: usize = 1024 * 1024;

const DEFAULT_BLOCK_SIZE: usize = 4096;
const DEFAULT_HEAP_SIZE: usize = 64 * MB;
const DEFAULT_PARTITION_COUNT: usize = 128;
const DEFAULT_LRU_WARN_THRESHOLD: usize = 512;

/// The hash-entry store: a block heap, a partition table and the metrics
/// shared by every operation.
///
/// All entry operations live on this type; see the methods defined in the
/// engine module. Entry addresses handed out by
/// [`create_entry`](Store::create_entry) stay valid until the entry is freed
/// or [`remove_all`](Store::remove_all) runs.
pub struct Store {
    pub(crate) blocks: Blocks,
    pub(crate) partitions: Partitions,
    pub(crate) metrics: StoreMetrics,
    pub(crate) geometry: Geometry,
    pub(crate) lru_warn_threshold: usize,
    pub(crate) next_lru_warn: AtomicInstant,
    hash_builder: Box<ahash::RandomState>,
}

/// Builder for constructing a [`Store`] with custom configuration.
pub struct StoreBuilder {
    block_size: usize,
    heap_size: usize,
    partition_count: usize,
    lru_warn_threshold: usize,
}

impl StoreBuilder {
    /// Create a new StoreBuilder with default settings.
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
            partition_count: DEFAULT_PARTITION_COUNT,
            lru_warn_threshold: DEFAULT_LRU_WARN_THRESHOLD,
        }
    }

    /// Set the block size in bytes.
    ///
    /// Must be a power of two of at least 128. Default is 4 KiB. Larger
    /// blocks mean fewer links per entry but more slack in the last block.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the total off-heap size in bytes.
    ///
    /// Must be a positive multiple of the block size. Default is 64 MiB.
    /// This determines the total entry capacity.
    pub fn heap_size(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    /// Set the number of partitions.
    ///
    /// Must be a power of two. Default is 128. More partitions shorten LRU
    /// lists and reduce lock contention at the cost of table memory.
    pub fn partition_count(mut self, count: usize) -> Self {
        self.partition_count = count;
        self
    }

    /// Set the LRU walk length at which a lookup logs the rate-limited
    /// degraded-performance warning. Default is 512.
    pub fn lru_warn_threshold(mut self, threshold: usize) -> Self {
        self.lru_warn_threshold = threshold;
        self
    }

    /// Build the Store with the configured settings.
    pub fn build(self) -> Store {
        assert!(
            self.heap_size >= self.block_size,
            "heap size must be at least one block"
        );
        assert!(
            self.heap_size % self.block_size == 0,
            "heap size must be a multiple of the block size"
        );
        assert!(
            self.lru_warn_threshold >= 1,
            "LRU warn threshold must be positive"
        );

        let geometry = Geometry::new(self.block_size);
        let block_count = self.heap_size / self.block_size;

        // Fixed seeds in tests for deterministic behavior, random in
        // production.
        #[cfg(test)]
        let hash_builder = ahash::RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = ahash::RandomState::new();

        let metrics = StoreMetrics::new();
        metrics.blocks_free.set(block_count as i64);

        Store {
            blocks: Blocks::new(self.block_size, block_count),
            partitions: Partitions::new(self.partition_count),
            metrics,
            geometry,
            lru_warn_threshold: self.lru_warn_threshold,
            next_lru_warn: AtomicInstant::now(),
            hash_builder: Box::new(hash_builder),
        }
    }
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a Store with default settings (4 KiB blocks, 64 MiB heap,
    /// 128 partitions). Use [`StoreBuilder`] for custom configuration:
    ///
    /// ```
    /// use blockcache::StoreBuilder;
    ///
    /// let store = StoreBuilder::new()
    ///     .heap_size(8 * 1024 * 1024)
    ///     .block_size(8192)
    ///     .partition_count(256)
    ///     .build();
    /// # drop(store);
    /// ```
    pub fn new() -> Self {
        StoreBuilder::new().build()
    }

    /// Create a new builder.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Get a reference to the store metrics.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// The configured block size in bytes.
    pub fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    /// The number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.count()
    }

    /// Total number of blocks in the heap.
    pub fn block_count(&self) -> usize {
        self.blocks.block_count()
    }

    /// The partition index owning `hash`.
    pub fn partition_index(&self, hash: u64) -> usize {
        self.partitions.index_for_hash(hash)
    }

    /// Lock the partition owning `hash` and return the guard proving it.
    pub fn lock_partition_for_hash(&self, hash: u64) -> PartitionGuard<'_> {
        self.partitions.lock_for_hash(hash)
    }

    /// Hash a key with this store's hasher. The engine itself only consumes
    /// hashes; this helper keeps callers and tests on one hash function.
    pub fn hash_key(&self, key: &[u8]) -> u64 {
        use std::hash::{BuildHasher, Hash, Hasher};

        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
