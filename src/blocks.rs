use crate::layout::OFF_NEXT_BLOCK;
use crate::metrics::StoreMetrics;
use crate::raw;
use std::alloc::{alloc_zeroed, Layout};

/// Fixed-size block allocator backing every entry chain.
///
/// One contiguous off-heap region is carved into `block_count` blocks of
/// `block_size` bytes. Free blocks sit in a lock-free queue of addresses;
/// allocation pops the requested number of blocks and pre-links them through
/// their next-block header words.
///
/// Blocks handed back by [`free_chain`](Blocks::free_chain) keep whatever
/// bytes they held; only a fresh entry's header initialization overwrites
/// them. The initial allocation is zeroed.
pub(crate) struct Blocks {
    heap_ptr: *mut u8,
    heap_layout: Layout,
    block_size: usize,
    block_count: usize,

    free_queue: crossbeam_deque::Injector<u64>,
}

// Safety: the heap is only reached through addresses handed out by the
// free queue, and all mutation of shared words goes through the atomic
// accessors in `raw`.
unsafe impl Send for Blocks {}
unsafe impl Sync for Blocks {}

impl Blocks {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        assert!(block_count > 0, "block count must be positive");

        let heap_size = block_size * block_count;

        // Allocate the heap as a single page-aligned, zero-initialized
        // region. Block starts are then at least `block_size`-aligned
        // relative to the page, which keeps every 8-byte field aligned.
        const PAGE_SIZE: usize = 4096;

        let layout =
            Layout::from_size_align(heap_size, PAGE_SIZE).expect("Failed to create layout");

        let heap_ptr = unsafe { alloc_zeroed(layout) };
        if heap_ptr.is_null() {
            panic!("Failed to allocate {heap_size} bytes for block heap");
        }

        // Pre-fault all pages by touching one word per page. This forces the
        // OS to back the region now rather than during entry writes.
        unsafe {
            for i in (0..heap_size).step_by(PAGE_SIZE) {
                std::ptr::write_volatile(heap_ptr.add(i) as *mut u64, 0);
            }
        }

        let free_queue = crossbeam_deque::Injector::new();
        for i in 0..block_count {
            free_queue.push(heap_ptr as u64 + (i * block_size) as u64);
        }

        Self {
            heap_ptr,
            heap_layout: layout,
            block_size,
            block_count,
            free_queue,
        }
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Reserve a chain of `blocks` blocks, pre-linked through their
    /// next-block words (the last link is 0), and return the head address.
    ///
    /// Returns 0 when fewer than `blocks` blocks are free; any blocks popped
    /// before the shortfall was detected go back onto the free queue.
    pub fn allocate_chain(&self, blocks: usize, metrics: &StoreMetrics) -> u64 {
        debug_assert!(blocks >= 1);

        let mut chain = Vec::with_capacity(blocks);
        while chain.len() < blocks {
            match self.free_queue.steal() {
                crossbeam_deque::Steal::Success(addr) => chain.push(addr),
                crossbeam_deque::Steal::Retry => continue,
                crossbeam_deque::Steal::Empty => {
                    // Not enough free blocks - roll back what we took.
                    for addr in chain {
                        self.free_queue.push(addr);
                    }
                    metrics.chain_allocate_fail.increment();
                    return 0;
                }
            }
        }

        for pair in chain.windows(2) {
            raw::put_long_volatile(pair[0] + OFF_NEXT_BLOCK as u64, pair[1]);
        }
        raw::put_long_volatile(chain[blocks - 1] + OFF_NEXT_BLOCK as u64, 0);

        metrics.chain_allocate.increment();
        metrics.blocks_free.sub(blocks as i64);
        chain[0]
    }

    /// Return every block of the chain rooted at `head_addr` to the free
    /// queue. The chain's links must be intact; entry payloads are never
    /// rewritten in place, so they always are.
    pub fn free_chain(&self, head_addr: u64, metrics: &StoreMetrics) {
        let mut addr = head_addr;
        let mut freed = 0i64;

        while addr != 0 {
            let next = raw::get_long_volatile(addr + OFF_NEXT_BLOCK as u64);
            self.free_queue.push(addr);
            freed += 1;
            addr = next;
        }

        metrics.chain_free.increment();
        metrics.blocks_free.add(freed);
    }
}

impl Drop for Blocks {
    fn drop(&mut self) {
        unsafe {
            std::alloc::dealloc(self.heap_ptr, self.heap_layout);
        }
    }
}
