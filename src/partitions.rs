use parking_lot::{Mutex, MutexGuard};

/// Fixed table of partitions. Each partition owns its LRU head address
/// behind a parking mutex.
///
/// The partition lock protects the head pointer and the `lru_prev`/`lru_next`
/// words of every entry on that partition's list. It is held across lookup,
/// LRU mutation and iteration, which can take a while on long lists, so a
/// parking lock fits better than a spinlock here.
pub(crate) struct Partitions {
    parts: Box<[Partition]>,
    mask: u64,
}

struct Partition {
    lru_head: Mutex<u64>,
}

/// RAII proof that a partition is locked.
///
/// Produced by [`Store::lock_partition_for_hash`](crate::Store::lock_partition_for_hash);
/// unlocks the partition when dropped. LRU mutation operations take the
/// guard mutably, which also lets them work against the cached head instead
/// of re-reading it.
pub struct PartitionGuard<'a> {
    head: MutexGuard<'a, u64>,
    index: usize,
}

impl PartitionGuard<'_> {
    /// Address of the most-recently-used entry, or 0 for an empty partition.
    pub fn lru_head(&self) -> u64 {
        *self.head
    }

    pub(crate) fn set_lru_head(&mut self, addr: u64) {
        *self.head = addr;
    }

    /// Index of the locked partition.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Partitions {
    pub fn new(count: usize) -> Self {
        assert!(
            count.is_power_of_two(),
            "partition count must be a power of two, got {count}"
        );

        let parts: Vec<Partition> = (0..count)
            .map(|_| Partition {
                lru_head: Mutex::new(0),
            })
            .collect();

        Self {
            parts: parts.into_boxed_slice(),
            mask: count as u64 - 1,
        }
    }

    pub fn count(&self) -> usize {
        self.parts.len()
    }

    pub fn index_for_hash(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    pub fn lock_for_hash(&self, hash: u64) -> PartitionGuard<'_> {
        self.lock_index(self.index_for_hash(hash))
    }

    pub fn lock_index(&self, index: usize) -> PartitionGuard<'_> {
        PartitionGuard {
            head: self.parts[index].lru_head.lock(),
            index,
        }
    }
}
