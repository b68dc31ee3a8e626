//! The admission ring and its drain/pairing roles.
//!
//! Layout:
//!
//! ```text
//! +--------------+--------------+--------------+----------------+
//! | write cursor | drain cursor | pair cursor  | capacity, mask |   one cache line each
//! +--------------+--------------+--------------+----------------+
//! | slots[0] | slots[1] | ... | slots[capacity - 1]              |   boxed, never resized
//! +-------------------------------------------------------------+
//! ```
//!
//! Sequence numbers start at 1 and map to `slots[seq & mask]`. Producers draw
//! them from the write cursor with an atomic increment; that increment is the
//! only source of admission order. The drain and pair cursors each have a
//! single owner ([`Drainer`] / [`Pairer`]) and replay the same sequence.

use crate::handoff::{ChannelId, Completer, ResultHandle};
use crate::slot::{Batch, Command, Slot, SlotState, SlotWriter};
use crate::sync::{yield_now, AtomicU64, Ordering};
use crate::{RingConfig, RingResult};
use crossbeam_utils::CachePadded;
use log::{debug, error, trace};
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
struct Geometry {
    capacity: usize,
    mask: u64,
}

/// Fixed-capacity, lock-free admission ring.
///
/// Producers share the ring (usually through the `Arc` returned by
/// [`Ring::build`]) and call [`Ring::submit_one`] / [`Ring::submit_batch`].
/// Admission blocks only while every slot is in flight.
pub struct Ring<R> {
    write: CachePadded<AtomicU64>,
    drain: CachePadded<AtomicU64>,
    pair: CachePadded<AtomicU64>,
    geometry: CachePadded<Geometry>,
    slots: Box<[Slot<R>]>,
}

impl<R: Send> Ring<R> {
    /// Builds a ring plus its single drain and pairing roles.
    ///
    /// The roles are unique handles: whoever owns the [`Drainer`] is the only
    /// thread able to take admitted batches, and whoever owns the [`Pairer`] is
    /// the only one able to match replies back to producers.
    pub fn build(config: RingConfig) -> RingResult<(Arc<Self>, Drainer<R>, Pairer<R>)> {
        config.validate()?;
        let slots = (0..config.capacity).map(|_| Slot::new()).collect();
        let ring = Arc::new(Self {
            write: CachePadded::new(AtomicU64::new(0)),
            drain: CachePadded::new(AtomicU64::new(0)),
            pair: CachePadded::new(AtomicU64::new(0)),
            geometry: CachePadded::new(Geometry {
                capacity: config.capacity,
                mask: config.mask(),
            }),
            slots,
        });
        debug!("built command ring with {} slots", config.capacity);
        let drainer = Drainer {
            ring: Arc::clone(&ring),
        };
        let pairer = Pairer {
            ring: Arc::clone(&ring),
        };
        Ok((ring, drainer, pairer))
    }
}

impl<R> Ring<R> {
    /// Number of slots, and the bound on in-flight admissions.
    pub fn capacity(&self) -> usize {
        self.geometry.capacity
    }

    /// Mask mapping sequence numbers onto slot indices.
    pub fn mask(&self) -> u64 {
        self.geometry.mask
    }

    /// Sequence numbers handed out so far.
    pub fn admitted(&self) -> u64 {
        self.write.load(Ordering::Relaxed)
    }

    /// Admissions not yet paired. A snapshot; it races with every role.
    pub fn in_flight(&self) -> u64 {
        let paired = self.pair.load(Ordering::Relaxed);
        self.admitted().saturating_sub(paired)
    }

    /// Current state of the slot at `index`, for diagnostics.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn slot_state(&self, index: usize) -> SlotState {
        assert!(index < self.capacity(), "slot {index} out of range");
        self.slots[index].state()
    }

    /// Admits a single command and returns the handle its result arrives on.
    ///
    /// Spins, yielding between attempts, while the target slot is still in
    /// flight from its previous cycle.
    pub fn submit_one(&self, command: Command) -> ResultHandle<'_, R> {
        let (seq, mut writer) = self.acquire();
        writer.fill_one(command);
        self.publish(seq, writer)
    }

    /// Admits `commands` as one unit: drained in one piece and completed with
    /// a single result.
    pub fn submit_batch(&self, commands: Vec<Command>) -> ResultHandle<'_, R> {
        let (seq, mut writer) = self.acquire();
        writer.fill_batch(commands);
        self.publish(seq, writer)
    }

    fn slot(&self, seq: u64) -> (ChannelId, &Slot<R>) {
        let index = (seq & self.geometry.mask) as usize;
        (ChannelId(index), &self.slots[index])
    }

    fn acquire(&self) -> (u64, SlotWriter<'_, R>) {
        let seq = self.write.fetch_add(1, Ordering::AcqRel) + 1;
        let (channel, slot) = self.slot(seq);
        let mut stalled = false;
        let writer = loop {
            if let Some(writer) = slot.try_acquire() {
                break writer;
            }
            if !stalled {
                trace!("admission {seq} waiting for slot {}", channel.index());
                stalled = true;
            }
            yield_now();
        };
        if slot.handoff().arm() {
            trace!(
                "admission {seq} waited for slot {} result to be received",
                channel.index()
            );
        }
        (seq, writer)
    }

    fn publish(&self, seq: u64, writer: SlotWriter<'_, R>) -> ResultHandle<'_, R> {
        writer.publish();
        let (channel, slot) = self.slot(seq);
        ResultHandle::new(slot.handoff(), channel, seq)
    }
}

impl<R> fmt::Debug for Ring<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.geometry.capacity)
            .field("write", &self.write.load(Ordering::Relaxed))
            .field("drain", &self.drain.load(Ordering::Relaxed))
            .field("pair", &self.pair.load(Ordering::Relaxed))
            .finish()
    }
}

/// The single drain role: takes admitted batches in admission order.
pub struct Drainer<R> {
    ring: Arc<Ring<R>>,
}

impl<R> Drainer<R> {
    /// The ring this role drains.
    pub fn ring(&self) -> &Arc<Ring<R>> {
        &self.ring
    }

    /// Takes the next batch if it has been published, without waiting.
    ///
    /// `None` leaves the drain cursor where it was, so the next call retries
    /// the same sequence number.
    pub fn try_next_command(&mut self) -> Option<Batch> {
        let next = self.ring.drain.load(Ordering::Relaxed) + 1;
        let (_, slot) = self.ring.slot(next);
        let batch = slot.try_begin_drain()?;
        self.ring.drain.store(next, Ordering::Relaxed);
        Some(batch)
    }

    /// Takes the next batch, spinning until it is published.
    pub fn next_command(&mut self) -> Batch {
        let next = self.ring.drain.load(Ordering::Relaxed) + 1;
        self.ring.drain.store(next, Ordering::Relaxed);
        let (_, slot) = self.ring.slot(next);
        loop {
            if let Some(batch) = slot.try_begin_drain() {
                return batch;
            }
            yield_now();
        }
    }
}

impl<R> fmt::Debug for Drainer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drainer")
            .field("cursor", &self.ring.drain.load(Ordering::Relaxed))
            .finish()
    }
}

/// The single pairing role: matches replies to producers in admission order.
pub struct Pairer<R> {
    ring: Arc<Ring<R>>,
}

impl<R> Pairer<R> {
    /// The ring this role pairs.
    pub fn ring(&self) -> &Arc<Ring<R>> {
        &self.ring
    }

    /// Frees the next drained slot and returns its batch with the completer
    /// that delivers the result to its producer.
    ///
    /// # Panics
    ///
    /// Panics when the next slot has not been drained yet. That means a reply
    /// arrived for a request that was never written, and every later reply
    /// would be attributed to the wrong producer.
    pub fn next_result(&mut self) -> (Batch, Completer<'_, R>) {
        let seq = self.ring.pair.load(Ordering::Relaxed) + 1;
        self.ring.pair.store(seq, Ordering::Relaxed);
        let (channel, slot) = self.ring.slot(seq);
        match slot.release() {
            Ok(batch) => (batch, Completer::new(slot.handoff(), channel, seq)),
            Err(state) => {
                error!(
                    "pairing ran ahead of draining: sequence {seq} at slot {} is {state:?}",
                    channel.index()
                );
                panic!(
                    "next_result reached slot {} (sequence {seq}) in state {state:?}, expected Draining",
                    channel.index()
                );
            }
        }
    }
}

impl<R> fmt::Debug for Pairer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pairer")
            .field("cursor", &self.ring.pair.load(Ordering::Relaxed))
            .finish()
    }
}
