//! Process-wide monotonic id counters.
//!
//! The reference implementation keeps three bare `uint32_t` globals
//! (`ctx_id`, `sock_id`, `chan_id`) and increments them without
//! synchronisation, relying on callers to serialise creation externally.
//! Atomics give the same "never reused, opaque, monotonically increasing"
//! contract without that caller obligation (spec §5, §9).

use std::sync::atomic::{AtomicU32, Ordering};

static CTX_ID: AtomicU32 = AtomicU32::new(0);
static SOCK_ID: AtomicU32 = AtomicU32::new(0);
static CHAN_ID: AtomicU32 = AtomicU32::new(0);

pub(crate) fn next_ctx_id() -> u32 {
    CTX_ID.fetch_add(1, Ordering::Relaxed) + 1
}

pub(crate) fn next_sock_id() -> u32 {
    SOCK_ID.fetch_add(1, Ordering::Relaxed) + 1
}

pub(crate) fn next_chan_id() -> u32 {
    CHAN_ID.fetch_add(1, Ordering::Relaxed) + 1
}
