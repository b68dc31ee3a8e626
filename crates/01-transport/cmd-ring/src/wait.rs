//! Atomic wait/notify shims used by the result hand-off.
//!
//! Native targets park on the hand-off state word through the `atomic-wait`
//! crate (futex-backed where available). Loom builds stub the wait with a
//! scheduler yield so the model checker can explore the spin instead.

use crate::sync::AtomicU32;

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitResult {
    /// The caller parked and was woken (possibly spuriously).
    Ok,
    /// The wait returned without parking.
    #[cfg_attr(not(feature = "loom"), allow(dead_code))]
    NotEqual,
}

#[cfg(feature = "loom")]
mod imp {
    use super::{AtomicU32, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        let _ = (atomic, expected);
        loom::thread::yield_now();
        WaitResult::NotEqual
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        let _ = atomic;
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use super::{AtomicU32, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        atomic_wait::wait(atomic, expected);
        WaitResult::Ok
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

/// Blocks the caller while `atomic` still holds `expected`, until a wakeup occurs.
#[inline]
pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    imp::wait_u32(atomic, expected)
}

/// Wakes every waiter parked on `atomic`.
#[inline]
pub(crate) fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}
