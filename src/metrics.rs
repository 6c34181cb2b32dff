use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: i64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn sub(&self, value: i64) {
        self.0.fetch_sub(value, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-store metrics for observability and testing
///
/// Each Store instance has its own set of metrics, allowing multiple store
/// instances with independent metrics and clean metric validation in tests.
pub struct StoreMetrics {
    // Entry lifecycle
    pub entry_create: Counter,
    pub entry_create_oom: Counter,
    pub entry_free: Counter,

    // Lookup
    pub find_hit: Counter,
    pub find_miss: Counter,

    // LRU maintenance
    pub lru_promote: Counter,
    pub lru_warn: Counter,

    // Bulk operations
    pub remove_all: Counter,

    // Block allocator
    pub chain_allocate: Counter,
    pub chain_allocate_fail: Counter,
    pub chain_free: Counter,

    // Current state gauges
    pub entries_live: Gauge,
    pub blocks_free: Gauge,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            entry_create: Counter::new(),
            entry_create_oom: Counter::new(),
            entry_free: Counter::new(),
            find_hit: Counter::new(),
            find_miss: Counter::new(),
            lru_promote: Counter::new(),
            lru_warn: Counter::new(),
            remove_all: Counter::new(),
            chain_allocate: Counter::new(),
            chain_allocate_fail: Counter::new(),
            chain_free: Counter::new(),
            entries_live: Gauge::new(),
            blocks_free: Gauge::new(),
        }
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}
