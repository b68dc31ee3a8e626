//! Ring semantics integration tests.
//! Covers admission order, slot exclusivity, result pairing, backpressure,
//! wrap-around, batch atomicity and the fatal pairing check, plus
//! (optionally) property-based checks.
#![cfg(not(feature = "loom"))]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cmd_ring::{
    Batch, Command, Drainer, Pairer, RecvError, Ring, RingConfig, SlotState, TryRecvError,
};
use rand::prelude::*;

type Harness = (Arc<Ring<String>>, Drainer<String>, Pairer<String>);

fn ring(capacity: usize) -> Harness {
    Ring::build(RingConfig::with_capacity(capacity)).expect("build ring")
}

fn cmd(args: &[&str]) -> Command {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// Pairs the next drained slot and answers with the first token of its batch.
fn echo_next(pairer: &mut Pairer<String>) -> Batch {
    let (batch, completer) = pairer.next_result();
    completer.complete(batch[0][0].clone());
    batch
}

/// Admissions from several threads drain in sequence-number order.
#[test]
fn fifo_follows_admission_order() {
    let (ring, mut drainer, mut pairer) = ring(64);
    let mut admitted = thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|producer| {
                let ring = &ring;
                scope.spawn(move || {
                    (0..8)
                        .map(|i| {
                            let command = cmd(&[&format!("p{producer}-{i}")]);
                            let handle = ring.submit_one(command.clone());
                            (handle.seq(), command, handle)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().expect("producer thread"))
            .collect::<Vec<_>>()
    });
    admitted.sort_by_key(|(seq, _, _)| *seq);

    let seqs: Vec<u64> = admitted.iter().map(|(seq, _, _)| *seq).collect();
    assert_eq!(seqs, (1..=32).collect::<Vec<u64>>());

    for (_, command, _) in &admitted {
        let batch = drainer.try_next_command().expect("admitted batch");
        assert_eq!(batch, vec![command.clone()]);
    }
    assert!(drainer.try_next_command().is_none());

    for _ in 0..admitted.len() {
        echo_next(&mut pairer);
    }
    for (_, command, handle) in admitted {
        assert_eq!(handle.recv().expect("result"), command[0]);
    }
}

/// Many producers on a small ring: every admission is drained exactly once and
/// every producer gets back the reply for its own command.
#[test]
fn concurrent_producers_never_share_a_slot() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 500;

    let (ring, mut drainer, mut pairer) = ring(8);
    let (wire_tx, wire_rx) = crossbeam_channel::unbounded::<Batch>();

    let drained = thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let ring = &ring;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(producer as u64);
                for i in 0..PER_PRODUCER {
                    let tag = format!("{producer}:{i}");
                    let extra = rng.gen_range(0..3);
                    let handle = if extra == 0 {
                        ring.submit_one(cmd(&[&tag]))
                    } else {
                        let batch = (0..=extra).map(|_| cmd(&[&tag])).collect();
                        ring.submit_batch(batch)
                    };
                    assert_eq!(handle.recv().expect("result"), tag);
                }
            });
        }

        let writer = scope.spawn(move || {
            let mut seen = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
            for _ in 0..PRODUCERS * PER_PRODUCER {
                let batch = drainer.next_command();
                seen.push(batch[0][0].clone());
                wire_tx.send(batch).expect("wire open");
            }
            seen
        });

        scope.spawn(move || {
            for sent in wire_rx.iter() {
                let paired = echo_next(&mut pairer);
                assert_eq!(paired, sent, "pairing follows drain order");
            }
        });

        writer.join().expect("writer thread")
    });

    let unique: HashSet<_> = drained.iter().collect();
    assert_eq!(drained.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(unique.len(), drained.len(), "no admission drained twice");
}

/// The hand-off returned by admission is the one the pairing actor completes.
#[test]
fn round_trip_pairs_handle_with_completer() {
    let (ring, mut drainer, mut pairer) = ring(4);
    let sent = vec![cmd(&["SET", "k", "v"]), cmd(&["GET", "k"])];
    let handle = ring.submit_batch(sent.clone());

    let drained = drainer.next_command();
    let (paired, completer) = pairer.next_result();
    assert_eq!(completer.channel_id(), handle.channel_id());
    assert_eq!(completer.seq(), handle.seq());
    assert_eq!(paired, sent);
    assert_eq!(paired, drained);

    completer.complete("OK v".into());
    assert_eq!(handle.recv().as_deref(), Ok("OK v"));
}

/// With every slot in flight, the next admission waits for a full drain and
/// pair cycle of the oldest one.
#[test]
fn admission_blocks_at_capacity() {
    let (ring, mut drainer, mut pairer) = ring(4);
    let returned = AtomicBool::new(false);

    thread::scope(|scope| {
        let mut handles: Vec<_> = (0..4)
            .map(|i| ring.submit_one(cmd(&[&i.to_string()])))
            .collect();

        let fifth = scope.spawn(|| {
            let handle = ring.submit_one(cmd(&["4"]));
            returned.store(true, Ordering::SeqCst);
            handle.seq()
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!returned.load(Ordering::SeqCst), "fifth admission must stall");

        drainer.next_command();
        thread::sleep(Duration::from_millis(20));
        assert!(!returned.load(Ordering::SeqCst), "draining alone frees nothing");

        echo_next(&mut pairer);
        let first = handles.remove(0);
        assert_eq!(first.recv().as_deref(), Ok("0"));

        assert_eq!(fifth.join().expect("fifth producer"), 5);
        assert!(returned.load(Ordering::SeqCst));
    });
}

/// Ten cycles through four slots keep results attributed in order.
#[test]
fn wrap_around_keeps_attribution() {
    let (ring, mut drainer, mut pairer) = ring(4);
    for i in 0..10u64 {
        let handle = ring.submit_one(cmd(&[&format!("item-{i}")]));
        assert_eq!(handle.channel_id().index(), ((i + 1) & 3) as usize);

        let batch = drainer.next_command();
        assert_eq!(batch, vec![cmd(&[&format!("item-{i}")])]);
        echo_next(&mut pairer);
        assert_eq!(handle.recv().expect("result"), format!("item-{i}"));
    }
    assert_eq!(ring.admitted(), 10);
    assert_eq!(ring.in_flight(), 0);
    for index in 0..4 {
        assert_eq!(ring.slot_state(index), SlotState::Free);
    }
}

/// A batch is drained in one call, never split, and paired once.
#[test]
fn batch_drains_as_one_unit() {
    let (ring, mut drainer, mut pairer) = ring(8);
    let before = ring.submit_one(cmd(&["PING"]));
    let batch: Vec<Command> = (0..5).map(|i| cmd(&["INCR", &i.to_string()])).collect();
    let multi = ring.submit_batch(batch.clone());
    let after = ring.submit_one(cmd(&["PING"]));

    assert_eq!(drainer.try_next_command().expect("first").len(), 1);
    let drained = drainer.try_next_command().expect("batch");
    assert_eq!(drained.len(), 5);
    assert_eq!(drained, batch);
    assert_eq!(drainer.try_next_command().expect("last").len(), 1);

    for _ in 0..3 {
        echo_next(&mut pairer);
    }
    assert_eq!(before.recv().as_deref(), Ok("PING"));
    assert_eq!(multi.recv().as_deref(), Ok("INCR"));
    assert_eq!(after.recv().as_deref(), Ok("PING"));
}

/// Pairing a slot that was published but never drained is fatal.
#[test]
#[should_panic(expected = "expected Draining")]
fn pairing_ahead_of_drain_panics() {
    let (ring, _drainer, mut pairer) = ring(4);
    let _handle = ring.submit_one(cmd(&["PING"]));
    let _ = pairer.next_result();
}

/// Pairing an idle ring is just as fatal.
#[test]
#[should_panic(expected = "in state Free")]
fn pairing_an_empty_ring_panics() {
    let (_ring, _drainer, mut pairer) = ring(4);
    let _ = pairer.next_result();
}

/// An abandoned wait never leaks its late result into the slot's next cycle.
#[test]
fn abandoned_result_is_not_seen_by_next_producer() {
    let (ring, mut drainer, mut pairer) = ring(1);

    drop(ring.submit_one(cmd(&["stale"])));
    drainer.next_command();
    echo_next(&mut pairer);

    let mut fresh = ring.submit_one(cmd(&["fresh"]));
    assert_eq!(fresh.try_recv(), Err(TryRecvError::Empty));
    drainer.next_command();
    echo_next(&mut pairer);
    assert_eq!(fresh.try_recv().as_deref(), Ok("fresh"));
}

/// A producer that has not read its result yet holds the slot's hand-off;
/// the next producer of that slot waits instead of reading the old value.
#[test]
fn slow_receiver_delays_slot_reuse() {
    let (ring, mut drainer, mut pairer) = ring(1);
    let first = ring.submit_one(cmd(&["one"]));
    drainer.next_command();
    echo_next(&mut pairer);
    assert_eq!(ring.slot_state(0), SlotState::Free);

    thread::scope(|scope| {
        let second = scope.spawn(|| ring.submit_one(cmd(&["two"])).seq());
        thread::sleep(Duration::from_millis(30));
        assert!(!second.is_finished(), "second admission waits for the first receive");

        assert_eq!(first.recv().as_deref(), Ok("one"));
        assert_eq!(second.join().expect("second producer"), 2);
    });
}

/// Dropping the completer wakes the producer with an error instead of hanging it.
#[test]
fn dropped_completer_disconnects_producer() {
    let (ring, mut drainer, mut pairer) = ring(2);
    let handle = ring.submit_one(cmd(&["PING"]));
    drainer.next_command();
    let (_, completer) = pairer.next_result();
    drop(completer);
    assert_eq!(handle.recv(), Err(RecvError));

    let next = ring.submit_one(cmd(&["PING"]));
    drainer.next_command();
    echo_next(&mut pairer);
    assert_eq!(next.recv().as_deref(), Ok("PING"));
}

#[cfg(feature = "proptests")]
mod prop {
    use super::*;
    use proptest::collection;
    use proptest::prelude::*;

    proptest! {
        /// Random batch sizes through a small ring keep order, size and attribution.
        #[test]
        fn batches_keep_order_and_size(sizes in collection::vec(1usize..6, 1..64)) {
            let (ring, mut drainer, mut pairer) = ring(4);
            for (round, chunk) in sizes.chunks(4).enumerate() {
                let expected: Vec<Vec<Command>> = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, &len)| {
                        (0..len).map(|j| cmd(&[&format!("{round}-{i}"), &j.to_string()])).collect()
                    })
                    .collect();

                let handles: Vec<_> = expected
                    .iter()
                    .map(|commands| {
                        if commands.len() == 1 {
                            ring.submit_one(commands[0].clone())
                        } else {
                            ring.submit_batch(commands.clone())
                        }
                    })
                    .collect();

                for commands in &expected {
                    let drained = drainer.try_next_command().expect("published batch");
                    prop_assert_eq!(drained.len(), commands.len());
                    prop_assert!(drained == *commands);
                }
                prop_assert!(drainer.try_next_command().is_none());

                for _ in &expected {
                    echo_next(&mut pairer);
                }
                for (handle, commands) in handles.into_iter().zip(&expected) {
                    prop_assert_eq!(handle.recv().expect("result"), commands[0][0].clone());
                }
            }
        }
    }
}
