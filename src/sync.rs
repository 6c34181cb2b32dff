// Central re-export of the atomics used across the crate, so call sites
// share one import and one ordering vocabulary.

pub(crate) use std::sync::atomic::{AtomicU64, Ordering};

// Helper for spin loop hints
#[inline]
pub(crate) fn spin_loop() {
    std::hint::spin_loop();
}
