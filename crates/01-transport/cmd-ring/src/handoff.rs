//! Reusable single-value result hand-off owned by every slot.
//!
//! Each slot carries one hand-off for its whole lifetime. A cycle moves the
//! state word through:
//!
//! ```text
//!          arm                complete              recv
//!   Idle ───────► Pending ───────────────► Filled ───────► Idle
//!                   │  └─ completer dropped ─► Disconnected ─► Idle (recv → Err)
//!                   └─ handle dropped ─► Abandoned ─► Idle (complete discards value)
//! ```
//!
//! A producer only arms the hand-off after it reads `Idle`, so a value from a
//! previous cycle can never be observed by the next producer of the same slot.

use crate::sync::{yield_now, AtomicU32, Ordering, UnsafeCell};
use crate::wait::{wait_u32, wake_all};
use crossbeam_utils::Backoff;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

const IDLE: u32 = 0;
const PENDING: u32 = 1;
const FILLED: u32 = 2;
const ABANDONED: u32 = 3;
const DISCONNECTED: u32 = 4;

/// Upper bound on a single sleep inside [`ResultHandle::recv_timeout`].
const PARK_SLICE: Duration = Duration::from_micros(500);

/// Stable identity of a slot's hand-off.
///
/// Two handles with equal ids refer to the same underlying hand-off; combine
/// with the admission sequence number to tell cycles apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    /// Index of the owning slot inside the ring.
    pub fn index(self) -> usize {
        self.0
    }
}

/// The pairing side dropped its [`Completer`] without delivering a result.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("result hand-off disconnected before a value was delivered")]
pub struct RecvError;

/// Outcome of a failed [`ResultHandle::try_recv`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TryRecvError {
    /// No result has been delivered yet.
    #[error("result not delivered yet")]
    Empty,
    /// The completer was dropped without delivering.
    #[error("result hand-off disconnected before a value was delivered")]
    Disconnected,
}

/// Outcome of a failed [`ResultHandle::recv_timeout`].
pub enum RecvTimeoutError<'r, R> {
    /// The deadline passed; the handle is returned so the caller may keep waiting.
    Timeout(ResultHandle<'r, R>),
    /// The completer was dropped without delivering.
    Disconnected,
}

impl<R> fmt::Debug for RecvTimeoutError<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvTimeoutError::Timeout(handle) => f.debug_tuple("Timeout").field(handle).finish(),
            RecvTimeoutError::Disconnected => f.write_str("Disconnected"),
        }
    }
}

impl<R> fmt::Display for RecvTimeoutError<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvTimeoutError::Timeout(_) => f.write_str("timed out waiting for result"),
            RecvTimeoutError::Disconnected => {
                f.write_str("result hand-off disconnected before a value was delivered")
            }
        }
    }
}

impl<R> std::error::Error for RecvTimeoutError<'_, R> {}

pub(crate) struct Handoff<R> {
    state: AtomicU32,
    value: UnsafeCell<Option<R>>,
}

// SAFETY: `value` is only touched by the party the state word designates: the
// completer while Pending/Abandoned, the handle while Filled. Transitions are
// published with release stores and observed with acquire loads.
unsafe impl<R: Send> Sync for Handoff<R> {}

impl<R> Handoff<R> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(IDLE),
            value: UnsafeCell::new(None),
        }
    }

    /// Waits until the previous cycle released the hand-off, then arms it.
    ///
    /// Returns `true` when the caller had to wait for a slow receiver.
    pub(crate) fn arm(&self) -> bool {
        let mut waited = false;
        while self.state.load(Ordering::Acquire) != IDLE {
            waited = true;
            yield_now();
        }
        self.state.store(PENDING, Ordering::Release);
        waited
    }

    fn fill(&self, value: R) {
        // SAFETY: Pending/Abandoned grant the completer exclusive access to `value`.
        self.value.with_mut(|slot| unsafe { *slot = Some(value) });
        match self
            .state
            .compare_exchange(PENDING, FILLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => wake_all(&self.state),
            Err(ABANDONED) => {
                // SAFETY: the handle is gone; nobody else reads `value` until Idle.
                let stale = self.value.with_mut(|slot| unsafe { (*slot).take() });
                self.state.store(IDLE, Ordering::Release);
                drop(stale);
            }
            Err(state) => unreachable!("result hand-off completed in state {state}"),
        }
    }

    fn disconnect(&self) {
        match self.state.compare_exchange(
            PENDING,
            DISCONNECTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => wake_all(&self.state),
            Err(ABANDONED) => self.state.store(IDLE, Ordering::Release),
            Err(_) => {}
        }
    }

    fn abandon(&self) {
        match self
            .state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(FILLED) => {
                // SAFETY: Filled grants the handle exclusive access to `value`.
                let unread = self.value.with_mut(|slot| unsafe { (*slot).take() });
                self.state.store(IDLE, Ordering::Release);
                drop(unread);
            }
            Err(DISCONNECTED) => self.state.store(IDLE, Ordering::Release),
            Err(_) => {}
        }
    }

    fn try_take(&self) -> Option<Result<R, RecvError>> {
        match self.state.load(Ordering::Acquire) {
            FILLED => {
                // SAFETY: Filled grants the handle exclusive access to `value`.
                let value = self.value.with_mut(|slot| unsafe { (*slot).take() });
                self.state.store(IDLE, Ordering::Release);
                Some(value.ok_or(RecvError))
            }
            DISCONNECTED => {
                self.state.store(IDLE, Ordering::Release);
                Some(Err(RecvError))
            }
            _ => None,
        }
    }
}

/// Producer-side view of a slot's hand-off for one admission.
///
/// Dropping the handle before the result arrives abandons it: the eventual
/// result is discarded, but the slot is not reclaimed until the pairing actor
/// completes it.
pub struct ResultHandle<'r, R> {
    handoff: &'r Handoff<R>,
    channel: ChannelId,
    seq: u64,
    done: bool,
}

impl<'r, R> ResultHandle<'r, R> {
    pub(crate) fn new(handoff: &'r Handoff<R>, channel: ChannelId, seq: u64) -> Self {
        Self {
            handoff,
            channel,
            seq,
            done: false,
        }
    }

    /// Identity of the slot hand-off this handle waits on.
    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    /// Ticket drawn from the write cursor at admission.
    ///
    /// While the ring is saturated, two tickets that map onto the same slot
    /// may acquire it out of ticket order, so this can differ from
    /// [`Completer::seq`] for the same cycle. [`ResultHandle::channel_id`]
    /// always matches.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Blocks until the pairing actor delivers the result.
    pub fn recv(mut self) -> Result<R, RecvError> {
        loop {
            if let Some(result) = self.poll() {
                return result;
            }
            wait_u32(&self.handoff.state, PENDING);
        }
    }

    /// Returns the result if it has already been delivered.
    pub fn try_recv(&mut self) -> Result<R, TryRecvError> {
        if self.done {
            return Err(TryRecvError::Disconnected);
        }
        match self.poll() {
            Some(Ok(value)) => Ok(value),
            Some(Err(RecvError)) => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Waits at most `timeout` for the result.
    ///
    /// On timeout the handle is handed back inside the error so the caller can
    /// retry or drop it.
    pub fn recv_timeout(mut self, timeout: Duration) -> Result<R, RecvTimeoutError<'r, R>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.recv().map_err(|RecvError| RecvTimeoutError::Disconnected);
        };
        let backoff = Backoff::new();
        loop {
            if let Some(result) = self.poll() {
                return result.map_err(|RecvError| RecvTimeoutError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvTimeoutError::Timeout(self));
            }
            if backoff.is_completed() {
                std::thread::sleep(PARK_SLICE.min(deadline - now));
            } else {
                backoff.snooze();
            }
        }
    }

    fn poll(&mut self) -> Option<Result<R, RecvError>> {
        let result = self.handoff.try_take()?;
        self.done = true;
        Some(result)
    }
}

impl<R> Drop for ResultHandle<'_, R> {
    fn drop(&mut self) {
        if !self.done {
            self.handoff.abandon();
        }
    }
}

impl<R> fmt::Debug for ResultHandle<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("channel", &self.channel)
            .field("seq", &self.seq)
            .field("done", &self.done)
            .finish()
    }
}

/// Pairing-side write end of a slot's hand-off for one cycle.
///
/// Dropping it without calling [`Completer::complete`] disconnects the
/// waiting producer with [`RecvError`].
pub struct Completer<'p, R> {
    handoff: &'p Handoff<R>,
    channel: ChannelId,
    seq: u64,
    done: bool,
}

impl<'p, R> Completer<'p, R> {
    pub(crate) fn new(handoff: &'p Handoff<R>, channel: ChannelId, seq: u64) -> Self {
        Self {
            handoff,
            channel,
            seq,
            done: false,
        }
    }

    /// Identity of the slot hand-off this completer writes to.
    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    /// Pair-cursor position of the cycle being completed.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Delivers `result` to the producer and wakes it.
    pub fn complete(mut self, result: R) {
        self.done = true;
        self.handoff.fill(result);
    }
}

impl<R> Drop for Completer<'_, R> {
    fn drop(&mut self) {
        if !self.done {
            self.handoff.disconnect();
        }
    }
}

impl<R> fmt::Debug for Completer<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("channel", &self.channel)
            .field("seq", &self.seq)
            .finish()
    }
}
