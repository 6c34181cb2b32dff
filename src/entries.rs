//! The hash-entry engine: chain writing, lookup, LRU maintenance, entry
//! locking and bulk operations over off-heap block chains.

use crate::layout::*;
use crate::raw;
use crate::source::{BytesSink, BytesSource};
use crate::stream::{EntryReader, EntryWriter, StreamError};
use crate::sync::Ordering;
use crate::PartitionGuard;
use crate::Store;
use clocksource::coarse::{Duration, Instant};

/// Value streams and sinks are length-prefixed with a signed 32-bit size.
const VALUE_STREAM_LIMIT: u64 = i32::MAX as u64;

/// Follow a block's next-link. The chain must not end here; a missing link
/// while payload bytes remain means the chain is corrupt.
fn next_block(addr: u64) -> u64 {
    let next = raw::get_long_volatile(addr + OFF_NEXT_BLOCK as u64);
    if next == 0 {
        panic!("entry chain ended at {addr:#x} while payload bytes remain");
    }
    next
}

/// Payload write position while serializing an entry: current block, offset
/// into it, and bytes left before the block boundary.
struct WriteCursor {
    addr: u64,
    offset: usize,
    remaining: usize,
}

impl WriteCursor {
    fn new(head: u64, geometry: &Geometry) -> Self {
        Self {
            addr: head,
            offset: ENTRY_HEADER_SIZE,
            remaining: geometry.first_block_payload,
        }
    }

    fn step_block(&mut self, geometry: &Geometry) {
        self.addr = next_block(self.addr);
        self.offset = BLOCK_HEADER_SIZE;
        self.remaining = geometry.next_block_payload;
    }

    /// Stream a source's bytes into the chain, largest runs first. The
    /// next-block link is only followed when another byte has to be written,
    /// so a payload ending exactly on a block boundary never chases a link.
    fn write_source<S: BytesSource + ?Sized>(&mut self, geometry: &Geometry, source: &S) {
        if let Some(arr) = source.as_slice() {
            let mut index = 0usize;
            while index < arr.len() {
                if self.remaining == 0 {
                    self.step_block(geometry);
                }
                let run = (arr.len() - index).min(self.remaining);
                raw::copy_from_slice(&arr[index..index + run], self.addr + self.offset as u64);
                index += run;
                self.offset += run;
                self.remaining -= run;
            }
        } else {
            for index in 0..source.size() {
                if self.remaining == 0 {
                    self.step_block(geometry);
                }
                raw::put_byte(self.addr + self.offset as u64, source.byte_at(index));
                self.offset += 1;
                self.remaining -= 1;
            }
        }
    }

    /// Advance to the next 8-byte boundary. The padding bytes are left as
    /// whatever the allocator produced; they are never read back. Block ends
    /// are 8-aligned (the block size is a power of two >= 128), so padding
    /// never crosses a block boundary.
    fn skip_padding(&mut self) {
        let pad = round_up8_rel(self.offset);
        self.offset += pad;
        self.remaining -= pad;
    }
}

impl Store {
    // ---------------------------------------------------------------------
    // Chain writer
    // ---------------------------------------------------------------------

    /// Serialize a new entry for `(hash, key, value)` into a freshly
    /// allocated block chain and return its head address.
    ///
    /// The entry is fully initialized but not yet linked into any partition
    /// LRU; callers insert it with [`add_as_head`](Store::add_as_head) under
    /// the owning partition's lock. Returns `None` when the allocator cannot
    /// supply enough blocks (the caller typically evicts and retries).
    pub fn create_entry<K, V>(&self, hash: u64, key: &K, value: &V) -> Option<u64>
    where
        K: BytesSource + ?Sized,
        V: BytesSource + ?Sized,
    {
        self.create_chain(hash, key, Some(value), value.size())
    }

    /// Like [`create_entry`](Store::create_entry), but only reserves
    /// `value_len` bytes for the value region, leaving it uninitialized.
    ///
    /// The caller is expected to fill the region through
    /// [`value_writer`](Store::value_writer) before making the entry
    /// visible to readers.
    pub fn create_entry_reserved<K>(&self, hash: u64, key: &K, value_len: u64) -> Option<u64>
    where
        K: BytesSource + ?Sized,
    {
        self.create_chain::<K, [u8]>(hash, key, None, value_len)
    }

    fn create_chain<K, V>(&self, hash: u64, key: &K, value: Option<&V>, value_len: u64) -> Option<u64>
    where
        K: BytesSource + ?Sized,
        V: BytesSource + ?Sized,
    {
        let key_len = key.size();
        let blocks = self.geometry.required_blocks(key_len, value_len);
        assert!(
            blocks >= 1,
            "computed zero blocks for entry (key_len={key_len}, value_len={value_len})"
        );

        let head = self.blocks.allocate_chain(blocks, &self.metrics);
        if head == 0 {
            self.metrics.entry_create_oom.increment();
            return None;
        }

        // Header initialization. Release stores pair with the acquire loads
        // of readers that discover this entry through a partition head.
        raw::put_long_volatile(head + OFF_HASH as u64, hash);
        raw::put_long_volatile(head + OFF_LRU_PREV as u64, 0);
        raw::put_long_volatile(head + OFF_LRU_NEXT as u64, 0);
        raw::put_long_volatile(head + OFF_ENTRY_LOCK as u64, 0);
        raw::put_long_volatile(head + OFF_KEY_LENGTH as u64, key_len);
        raw::put_long_volatile(head + OFF_VALUE_LENGTH as u64, value_len);

        let mut cursor = WriteCursor::new(head, &self.geometry);
        cursor.write_source(&self.geometry, key);
        cursor.skip_padding();
        if let Some(value) = value {
            cursor.write_source(&self.geometry, value);
        }

        self.metrics.entry_create.increment();
        self.metrics.entries_live.increment();
        Some(head)
    }

    /// Return an entry's chain to the block allocator.
    ///
    /// The entry must already be unlinked from its partition LRU (or never
    /// have been linked).
    pub fn free_entry(&self, entry_addr: u64) {
        if entry_addr == 0 {
            return;
        }
        self.blocks.free_chain(entry_addr, &self.metrics);
        self.metrics.entry_free.increment();
        self.metrics.entries_live.decrement();
    }

    // ---------------------------------------------------------------------
    // Header accessors
    // ---------------------------------------------------------------------

    /// The 64-bit hash stored in the entry header.
    pub fn entry_hash(&self, entry_addr: u64) -> u64 {
        raw::get_long_volatile(entry_addr + OFF_HASH as u64)
    }

    /// The serialized key length in bytes.
    pub fn entry_key_length(&self, entry_addr: u64) -> u64 {
        raw::get_long_volatile(entry_addr + OFF_KEY_LENGTH as u64)
    }

    /// The serialized value length in bytes.
    pub fn entry_value_length(&self, entry_addr: u64) -> u64 {
        raw::get_long_volatile(entry_addr + OFF_VALUE_LENGTH as u64)
    }

    /// The next entry on the partition LRU list, or 0 at the tail. Only
    /// meaningful under the owning partition's lock.
    pub fn entry_lru_next(&self, entry_addr: u64) -> u64 {
        raw::get_long_volatile(entry_addr + OFF_LRU_NEXT as u64)
    }

    /// The previous entry on the partition LRU list, or 0 at the head. Only
    /// meaningful under the owning partition's lock.
    pub fn entry_lru_prev(&self, entry_addr: u64) -> u64 {
        raw::get_long_volatile(entry_addr + OFF_LRU_PREV as u64)
    }

    fn set_lru_next(&self, entry_addr: u64, next: u64) {
        raw::put_long_volatile(entry_addr + OFF_LRU_NEXT as u64, next);
    }

    fn set_lru_prev(&self, entry_addr: u64, prev: u64) {
        raw::put_long_volatile(entry_addr + OFF_LRU_PREV as u64, prev);
    }

    // ---------------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------------

    /// Compare the key stored in an entry with a search key of equal length.
    ///
    /// When the search key exposes a contiguous slice, 8 bytes are compared
    /// per step; the chain-side cursor stays 8-aligned until fewer than 8
    /// bytes remain (block payload starts and the block size are multiples
    /// of 8), at which point the tail is compared byte by byte.
    pub(crate) fn compare_key<K>(&self, entry_addr: u64, key: &K, key_len: u64) -> bool
    where
        K: BytesSource + ?Sized,
    {
        let block_size = self.geometry.block_size;
        let mut addr = entry_addr;
        let mut offset = ENTRY_HEADER_SIZE;

        if let Some(arr) = key.as_slice() {
            let key_len = key_len as usize;
            let mut index = 0usize;
            while index < key_len {
                if offset == block_size {
                    addr = next_block(addr);
                    offset = BLOCK_HEADER_SIZE;
                }
                if key_len - index >= 8 && block_size - offset >= 8 {
                    let stored = raw::get_long(addr + offset as u64);
                    let searched = raw::get_long_from_slice(arr, index);
                    if stored != searched {
                        return false;
                    }
                    offset += 8;
                    index += 8;
                } else {
                    if raw::get_byte(addr + offset as u64) != arr[index] {
                        return false;
                    }
                    offset += 1;
                    index += 1;
                }
            }
            return true;
        }

        // last-resort byte-by-byte compare
        for index in 0..key_len {
            if offset == block_size {
                addr = next_block(addr);
                offset = BLOCK_HEADER_SIZE;
            }
            if raw::get_byte(addr + offset as u64) != key.byte_at(index) {
                return false;
            }
            offset += 1;
        }
        true
    }

    /// Walk a partition's LRU list for the entry matching `(hash, key)`.
    ///
    /// Candidates are filtered cheapest-first: stored hash word, then key
    /// length, then key bytes. The guard must be the one locking the
    /// partition that owns `hash`. Returns the first match, or `None`.
    ///
    /// # Panics
    ///
    /// Panics if the walk revisits the list head - the intrusive list would
    /// otherwise spin forever.
    pub fn find_entry<K>(&self, partition: &PartitionGuard<'_>, hash: u64, key: &K) -> Option<u64>
    where
        K: BytesSource + ?Sized,
    {
        let first = partition.lru_head();
        let mut entry = first;
        let mut links = 0usize;

        while entry != 0 {
            if links > 0 && entry == first {
                panic!(
                    "endless loop: partition {} LRU list contains a cycle",
                    partition.index()
                );
            }

            if self.entry_hash(entry) == hash {
                let key_len = self.entry_key_length(entry);
                if key_len == key.size() && self.compare_key(entry, key, key_len) {
                    if links >= self.lru_warn_threshold {
                        self.lru_walk_warn(links);
                    }
                    self.metrics.find_hit.increment();
                    return Some(entry);
                }
            }

            entry = self.entry_lru_next(entry);
            links += 1;
        }

        if links >= self.lru_warn_threshold {
            self.lru_walk_warn(links);
        }
        self.metrics.find_miss.increment();
        None
    }

    /// Rate-limited observability signal: a single lookup needed `links`
    /// LRU hops, so the partition table is undersized for the entry count.
    /// At most one warning per 10 seconds per store; a racing duplicate is
    /// harmless, so the timestamp update is not atomic with the check.
    fn lru_walk_warn(&self, links: usize) {
        let now = Instant::now();
        if self.next_lru_warn.load(Ordering::Relaxed) <= now {
            self.next_lru_warn
                .store(now + Duration::from_secs(10), Ordering::Relaxed);
            self.metrics.lru_warn.increment();
            tracing::warn!(
                links,
                "degraded lookup performance: LRU list very long - check the partition count \
                 (this warning reappears in 10 seconds if the problem persists)"
            );
        }
    }

    // ---------------------------------------------------------------------
    // LRU list maintenance (all require the partition lock, proven by the
    // guard parameter)
    // ---------------------------------------------------------------------

    /// Insert an entry as the most-recently-used of its partition.
    pub fn add_as_head(&self, partition: &mut PartitionGuard<'_>, entry_addr: u64) {
        if entry_addr == 0 {
            return;
        }

        let old_head = partition.lru_head();
        if old_head != 0 {
            self.set_lru_next(entry_addr, old_head);
            self.set_lru_prev(old_head, entry_addr);
        } else {
            self.set_lru_next(entry_addr, 0);
        }
        self.set_lru_prev(entry_addr, 0);

        partition.set_lru_head(entry_addr);
    }

    /// Remove an entry from its partition's LRU list.
    ///
    /// The entry's own `lru_prev`/`lru_next` are left stale; they are never
    /// read after the unlink (the chain is freed or re-linked shortly).
    pub fn unlink(&self, partition: &mut PartitionGuard<'_>, entry_addr: u64) {
        if entry_addr == 0 {
            return;
        }

        let prev = self.entry_lru_prev(entry_addr);
        let next = self.entry_lru_next(entry_addr);

        if next != 0 {
            self.set_lru_prev(next, prev);
        }
        if prev != 0 {
            self.set_lru_next(prev, next);
        }
        if partition.lru_head() == entry_addr {
            partition.set_lru_head(next);
        }
    }

    /// Move an entry to the head of its partition's LRU list. Cheap no-op
    /// when it already is the head.
    pub fn promote_to_head(&self, partition: &mut PartitionGuard<'_>, entry_addr: u64) {
        if entry_addr == 0 {
            return;
        }

        if partition.lru_head() != entry_addr {
            self.unlink(partition, entry_addr);
            self.add_as_head(partition, entry_addr);
            self.metrics.lru_promote.increment();
        }
    }

    // ---------------------------------------------------------------------
    // Entry-level lock
    // ---------------------------------------------------------------------

    /// Acquire the entry's payload lock. Orders payload mutation
    /// independently of the partition lock; never acquire a second entry
    /// lock while holding one.
    pub fn lock_entry(&self, entry_addr: u64) {
        if entry_addr != 0 {
            raw::lock(entry_addr + OFF_ENTRY_LOCK as u64);
        }
    }

    /// Release the entry's payload lock.
    pub fn unlock_entry(&self, entry_addr: u64) {
        if entry_addr != 0 {
            raw::unlock(entry_addr + OFF_ENTRY_LOCK as u64);
        }
    }

    // ---------------------------------------------------------------------
    // Streaming access
    // ---------------------------------------------------------------------

    /// Position of the first value byte: skip the 8-byte-rounded key from
    /// the head's payload start, hopping continuation blocks as needed.
    ///
    /// The returned block address may be 0 for a zero-length value that ends
    /// exactly on a block boundary; such a cursor has a zero budget and
    /// never dereferences it.
    fn value_start(&self, entry_addr: u64) -> (u64, usize) {
        let mut skip = round_up8(self.entry_key_length(entry_addr));
        let first_payload = self.geometry.first_block_payload as u64;

        if skip >= first_payload {
            skip -= first_payload;
            let next_payload = self.geometry.next_block_payload as u64;
            let mut addr = raw::get_long_volatile(entry_addr + OFF_NEXT_BLOCK as u64);

            while skip >= next_payload && addr != 0 {
                skip -= next_payload;
                addr = raw::get_long_volatile(addr + OFF_NEXT_BLOCK as u64);
            }

            (addr, BLOCK_HEADER_SIZE + skip as usize)
        } else {
            (entry_addr, ENTRY_HEADER_SIZE + skip as usize)
        }
    }

    /// Open a byte stream over the entry's key.
    pub fn key_reader(&self, entry_addr: u64) -> EntryReader<'_> {
        let budget = self.entry_key_length(entry_addr);
        EntryReader::new(self, entry_addr, ENTRY_HEADER_SIZE, budget)
    }

    /// Open a byte stream over the entry's value.
    ///
    /// Fails with [`StreamError::Overflow`] when the value length exceeds
    /// the signed 32-bit stream limit; the entry itself is untouched.
    pub fn value_reader(&self, entry_addr: u64) -> Result<EntryReader<'_>, StreamError> {
        let budget = self.entry_value_length(entry_addr);
        if budget > VALUE_STREAM_LIMIT {
            return Err(StreamError::Overflow);
        }

        let (addr, offset) = self.value_start(entry_addr);
        assert!(
            addr != 0 || budget == 0,
            "entry chain ended before the value region"
        );
        Ok(EntryReader::new(self, addr, offset, budget))
    }

    /// Open a write stream over the entry's value region, for entries
    /// created with [`create_entry_reserved`](Store::create_entry_reserved).
    ///
    /// Writing exactly `value_length` bytes makes the entry equivalent to
    /// one created with the value up front. Callers serialize against
    /// readers through the partition or entry lock.
    pub fn value_writer(&self, entry_addr: u64) -> Result<EntryWriter<'_>, StreamError> {
        let budget = self.entry_value_length(entry_addr);
        if budget > VALUE_STREAM_LIMIT {
            return Err(StreamError::Overflow);
        }

        let (addr, offset) = self.value_start(entry_addr);
        assert!(
            addr != 0 || budget == 0,
            "entry chain ended before the value region"
        );
        Ok(EntryWriter::new(self, addr, offset, budget))
    }

    /// Copy the entry's value into a sink: size the sink to `value_length`,
    /// then store every byte at its index.
    pub fn write_value_to_sink<S>(&self, entry_addr: u64, sink: &mut S) -> Result<(), StreamError>
    where
        S: BytesSink + ?Sized,
    {
        let mut reader = self.value_reader(entry_addr)?;
        sink.set_size(reader.remaining() as usize);

        let mut index = 0usize;
        while let Some(byte) = reader.read_byte() {
            sink.put_byte(index, byte);
            index += 1;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Bulk and iteration operations
    // ---------------------------------------------------------------------

    /// Drop every entry in the store.
    ///
    /// Each partition's list is snapshotted and reset under its lock, then
    /// freed with no lock held, so clears never stall lookups on other
    /// partitions for the duration of the frees. Entries are locked before
    /// their chain is freed and deliberately not unlocked; the lock word is
    /// rewritten when the block next serves as an entry head.
    pub fn remove_all(&self) {
        for index in 0..self.partitions.count() {
            let head = {
                let mut partition = self.partitions.lock_index(index);
                let head = partition.lru_head();
                partition.set_lru_head(0);
                head
            };

            let mut entry = head;
            while entry != 0 {
                // read the next link before the chain goes back to the
                // allocator
                let next = self.entry_lru_next(entry);
                self.lock_entry(entry);
                self.blocks.free_chain(entry, &self.metrics);
                self.metrics.entry_free.increment();
                self.metrics.entries_live.decrement();
                entry = next;
            }
        }

        self.metrics.remove_all.increment();
    }

    /// Per-partition LRU list lengths, each counted under its partition's
    /// lock.
    pub fn lru_lengths(&self) -> Vec<usize> {
        let mut lengths = Vec::with_capacity(self.partitions.count());

        for index in 0..self.partitions.count() {
            let partition = self.partitions.lock_index(index);
            let mut len = 0usize;
            let mut entry = partition.lru_head();
            while entry != 0 {
                len += 1;
                entry = self.entry_lru_next(entry);
            }
            lengths.push(len);
        }

        lengths
    }

    /// Invoke `callback` for every entry of `hash`'s partition in LRU order
    /// (most recently used first).
    ///
    /// The callback runs with the partition lock held; keep it short and do
    /// not call back into operations that take partition locks.
    pub fn hot_n<F>(&self, hash: u64, mut callback: F)
    where
        F: FnMut(u64),
    {
        let partition = self.partitions.lock_for_hash(hash);
        let mut entry = partition.lru_head();
        while entry != 0 {
            callback(entry);
            entry = self.entry_lru_next(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreBuilder;

    fn small_store() -> Store {
        StoreBuilder::new()
            .block_size(256)
            .heap_size(256 * 64)
            .partition_count(4)
            .build()
    }

    #[test]
    fn oversize_value_length_yields_overflow() {
        let store = small_store();
        let entry = store.create_entry(7, b"key", b"value").unwrap();

        // Force an oversize value length into the header; the chain behind
        // it is irrelevant because the overflow check fires first.
        raw::put_long_volatile(entry + OFF_VALUE_LENGTH as u64, 1 << 31);

        assert_eq!(store.value_reader(entry).err(), Some(StreamError::Overflow));
        assert_eq!(store.value_writer(entry).err(), Some(StreamError::Overflow));

        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(
            store.write_value_to_sink(entry, &mut sink),
            Err(StreamError::Overflow)
        );

        // The rest of the header is not corrupted by the failed opens.
        assert_eq!(store.entry_hash(entry), 7);
        assert_eq!(store.entry_key_length(entry), 3);
        let mut key = Vec::new();
        std::io::Read::read_to_end(&mut store.key_reader(entry), &mut key).unwrap();
        assert_eq!(key, b"key");
    }

    #[test]
    fn entry_lock_roundtrip() {
        let store = small_store();
        let entry = store.create_entry(1, b"k", b"v").unwrap();

        store.lock_entry(entry);
        store.unlock_entry(entry);
        store.lock_entry(entry);
        store.unlock_entry(entry);

        // locking the null entry is a no-op
        store.lock_entry(0);
        store.unlock_entry(0);
    }

    #[test]
    fn value_starts_on_eight_byte_boundary() {
        let store = small_store();

        for key_len in [0usize, 1, 3, 7, 8, 9, 15] {
            let key = vec![0x5Au8; key_len];
            let value = [0xC3u8; 24];
            let entry = store.create_entry(99, &key[..], &value).unwrap();

            let mut out = Vec::new();
            store.write_value_to_sink(entry, &mut out).unwrap();
            assert_eq!(out, &value[..], "key_len={key_len}");
        }
    }
}
