//! Raw access to off-heap memory.
//!
//! All functions take absolute addresses. Callers must only pass addresses
//! inside the block heap owned by [`crate::blocks::Blocks`]; 8-byte accesses
//! additionally require 8-aligned addresses, which the entry layout
//! guarantees (every header field offset and block start is a multiple of 8).
//!
//! Header fields are written with release stores and read with acquire
//! loads, so a reader that observes an entry through a partition's LRU head
//! sees a fully initialized header.

use crate::sync::*;

#[inline]
fn atomic_at(addr: u64) -> &'static AtomicU64 {
    debug_assert!(addr != 0, "null address");
    debug_assert!(addr % 8 == 0, "unaligned 8-byte access at {addr:#x}");
    unsafe { &*(addr as usize as *const AtomicU64) }
}

/// Relaxed 8-byte load.
#[inline]
pub(crate) fn get_long(addr: u64) -> u64 {
    atomic_at(addr).load(Ordering::Relaxed)
}

/// Relaxed 8-byte store.
#[allow(dead_code)] // counterpart of get_long; payload stores go through copies
#[inline]
pub(crate) fn put_long(addr: u64, value: u64) {
    atomic_at(addr).store(value, Ordering::Relaxed);
}

/// Acquire 8-byte load.
#[inline]
pub(crate) fn get_long_volatile(addr: u64) -> u64 {
    atomic_at(addr).load(Ordering::Acquire)
}

/// Release 8-byte store.
#[inline]
pub(crate) fn put_long_volatile(addr: u64, value: u64) {
    atomic_at(addr).store(value, Ordering::Release);
}

#[inline]
pub(crate) fn get_byte(addr: u64) -> u8 {
    unsafe { (addr as usize as *const u8).read() }
}

#[inline]
pub(crate) fn put_byte(addr: u64, value: u8) {
    unsafe { (addr as usize as *mut u8).write(value) }
}

/// Copy `src` into off-heap memory starting at `dst_addr`.
#[inline]
pub(crate) fn copy_from_slice(src: &[u8], dst_addr: u64) {
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst_addr as usize as *mut u8, src.len());
    }
}

/// Copy off-heap memory starting at `src_addr` into `dst`.
#[inline]
pub(crate) fn copy_to_slice(src_addr: u64, dst: &mut [u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(src_addr as usize as *const u8, dst.as_mut_ptr(), dst.len());
    }
}

/// Native-endian 8-byte load from a host slice. The slice side of the
/// word-wise key compare; the offset does not have to be aligned.
#[inline]
pub(crate) fn get_long_from_slice(buf: &[u8], offset: usize) -> u64 {
    let bytes: [u8; 8] = buf[offset..offset + 8].try_into().unwrap();
    u64::from_ne_bytes(bytes)
}

/// Acquire the spinlock word at `addr`.
///
/// CAS 0 -> 1 with exponential-backoff spinning. Critical sections guarded
/// by this lock are short (payload mutation of a single entry), so spinning
/// beats parking here.
pub(crate) fn lock(addr: u64) {
    let word = atomic_at(addr);
    let mut attempt = 0u32;

    loop {
        if word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        // Exponential backoff with a cap: 1, 2, 4, ... up to 64 spins,
        // then 128 spins per retry.
        let spins = if attempt < 7 { 1u32 << attempt } else { 128 };
        for _ in 0..spins {
            spin_loop();
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Release the spinlock word at `addr`.
pub(crate) fn unlock(addr: u64) {
    atomic_at(addr).store(0, Ordering::Release);
}
