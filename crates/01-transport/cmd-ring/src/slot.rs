//! Ring slots and the command batches they carry.
//!
//! A slot cycles `Free → Writing → Ready → Draining → Free`. Each arrow is
//! taken by exactly one role:
//!
//! | transition          | taken by  | how                    |
//! |---------------------|-----------|------------------------|
//! | Free → Writing      | producer  | CAS, spins on failure  |
//! | Writing → Ready     | producer  | release store          |
//! | Ready → Draining    | drainer   | CAS                    |
//! | Draining → Free     | pairer    | CAS, fatal on failure  |
//!
//! The batch lives behind an `Arc` so drain and pairing can hold owned views
//! after the slot moves on; producers refill it in place whenever no view of
//! the previous cycle survives.

use crate::handoff::Handoff;
use crate::sync::{AtomicU32, Ordering, UnsafeCell};
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// One wire command: an ordered list of opaque argument tokens.
pub type Command = Vec<String>;

pub(crate) type Items = SmallVec<[Command; 1]>;

/// Lifecycle state of a slot.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Available for admission.
    Free = 0,
    /// Reserved by a producer that is writing its batch.
    Writing = 1,
    /// Published and waiting for the drain actor.
    Ready = 2,
    /// Handed to the transport writer; waiting for its reply.
    Draining = 3,
}

impl SlotState {
    /// Decodes a raw state word; `None` for values outside the cycle.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Writing),
            2 => Some(SlotState::Ready),
            3 => Some(SlotState::Draining),
            _ => None,
        }
    }
}

const FREE: u32 = SlotState::Free as u32;
const WRITING: u32 = SlotState::Writing as u32;
const READY: u32 = SlotState::Ready as u32;
const DRAINING: u32 = SlotState::Draining as u32;

/// Read-only view of the commands admitted into one slot cycle.
///
/// Cloning is a reference-count bump.
#[derive(Clone)]
pub struct Batch(Arc<Items>);

impl Deref for Batch {
    type Target = [Command];

    fn deref(&self) -> &[Command] {
        self.0.as_slice()
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl PartialEq for Batch {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for Batch {}

impl PartialEq<[Command]> for Batch {
    fn eq(&self, other: &[Command]) -> bool {
        **self == *other
    }
}

impl PartialEq<Vec<Command>> for Batch {
    fn eq(&self, other: &Vec<Command>) -> bool {
        **self == other[..]
    }
}

pub(crate) struct Slot<R> {
    state: AtomicU32,
    items: UnsafeCell<Arc<Items>>,
    handoff: Handoff<R>,
}

// SAFETY: `items` is written only by the producer holding the slot in Writing
// and read only in Ready (drainer) or Draining (pairer); the state word's
// acquire/release transitions order those accesses.
unsafe impl<R: Send> Sync for Slot<R> {}

impl<R> Slot<R> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(FREE),
            items: UnsafeCell::new(Arc::new(SmallVec::new())),
            handoff: Handoff::new(),
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        let raw = self.state.load(Ordering::Acquire);
        SlotState::from_u32(raw).unwrap_or_else(|| unreachable!("slot state word {raw}"))
    }

    pub(crate) fn handoff(&self) -> &Handoff<R> {
        &self.handoff
    }

    /// Attempts the Free → Writing transition.
    pub(crate) fn try_acquire(&self) -> Option<SlotWriter<'_, R>> {
        self.state
            .compare_exchange(FREE, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SlotWriter { slot: self })
    }

    /// Ready → Draining. Only the drain actor may call this.
    ///
    /// Returns `None` when the slot has not been published yet.
    pub(crate) fn try_begin_drain(&self) -> Option<Batch> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        // SAFETY: Ready is left only by the drain actor, so the producer is done
        // and the pairer cannot free the slot until the transition below.
        let batch = Batch(self.items.with(|items| Arc::clone(unsafe { &*items })));
        if let Err(state) =
            self.state
                .compare_exchange(READY, DRAINING, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!("slot left Ready under the drain actor (state word {state})");
        }
        Some(batch)
    }

    /// Draining → Free. Only the pairing actor may call this.
    ///
    /// On failure returns the state observed instead of Draining.
    pub(crate) fn release(&self) -> Result<Batch, SlotState> {
        let state = self.state();
        if state != SlotState::Draining {
            return Err(state);
        }
        // SAFETY: Draining is left only by the pairing actor; no producer can
        // write until the Free store below publishes the slot again.
        let batch = Batch(self.items.with(|items| Arc::clone(unsafe { &*items })));
        match self
            .state
            .compare_exchange(DRAINING, FREE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(batch),
            Err(raw) => Err(SlotState::from_u32(raw)
                .unwrap_or_else(|| unreachable!("slot state word {raw}"))),
        }
    }
}

/// Exclusive write access to a slot in the Writing state.
pub(crate) struct SlotWriter<'s, R> {
    slot: &'s Slot<R>,
}

impl<R> SlotWriter<'_, R> {
    fn refill(&mut self, f: impl FnOnce(&mut Arc<Items>)) {
        self.slot.items.with_mut(|items| {
            // SAFETY: Writing grants this writer exclusive access to `items`.
            f(unsafe { &mut *items })
        })
    }

    /// Replaces the batch with a single command, reusing storage when possible.
    pub(crate) fn fill_one(&mut self, command: Command) {
        self.refill(|items| match Arc::get_mut(items) {
            Some(buf) => {
                buf.clear();
                buf.push(command);
            }
            None => *items = Arc::new(smallvec![command]),
        });
    }

    /// Replaces the batch wholesale.
    pub(crate) fn fill_batch(&mut self, commands: Vec<Command>) {
        self.refill(|items| match Arc::get_mut(items) {
            Some(buf) => *buf = SmallVec::from_vec(commands),
            None => *items = Arc::new(SmallVec::from_vec(commands)),
        });
    }

    /// Writing → Ready.
    pub(crate) fn publish(self) {
        self.slot.state.store(READY, Ordering::Release);
    }
}
