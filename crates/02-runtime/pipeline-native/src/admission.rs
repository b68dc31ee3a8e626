//! Permit gate in front of the ring.
//!
//! One permit per slot. A producer takes a permit before it draws a ticket and
//! the reader returns it once that cycle is paired, so a ticket never waits on
//! a slot still held by an earlier cycle. Waiting for a permit honours the
//! caller's deadline and wakes on shutdown.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::PipelineError;

struct GateState {
    available: usize,
    closed: bool,
}

pub(crate) struct AdmissionGate {
    state: Mutex<GateState>,
    freed: Condvar,
}

impl AdmissionGate {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                available: permits,
                closed: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Takes a permit, waiting until `deadline` (forever when `None`).
    ///
    /// `timeout` is only used to report [`PipelineError::Timeout`].
    pub(crate) fn acquire(
        &self,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PipelineError::Closed);
            }
            if state.available > 0 {
                state.available -= 1;
                return Ok(());
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(PipelineError::Timeout(timeout));
                }
                Some(deadline) => {
                    self.freed.wait_until(&mut state, deadline);
                }
                None => self.freed.wait(&mut state),
            }
        }
    }

    pub(crate) fn release(&self) {
        self.state.lock().available += 1;
        self.freed.notify_one();
    }

    /// Fails every current and future [`AdmissionGate::acquire`] with `Closed`.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.freed.notify_all();
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.state.lock().available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn permits_run_out_and_time_out() {
        let gate = AdmissionGate::new(2);
        let soon = Some(Instant::now() + Duration::from_millis(10));
        gate.acquire(soon, Duration::from_millis(10)).expect("first");
        gate.acquire(soon, Duration::from_millis(10)).expect("second");
        assert!(matches!(
            gate.acquire(soon, Duration::from_millis(10)),
            Err(PipelineError::Timeout(_))
        ));
        gate.release();
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn release_wakes_a_waiter() {
        let gate = AdmissionGate::new(1);
        gate.acquire(None, Duration::ZERO).expect("permit");
        thread::scope(|scope| {
            let waiter = scope.spawn(|| gate.acquire(None, Duration::ZERO));
            thread::sleep(Duration::from_millis(20));
            assert!(!waiter.is_finished());
            gate.release();
            waiter.join().expect("waiter").expect("permit after release");
        });
        assert_eq!(gate.available(), 0);
    }

    #[test]
    fn close_wakes_waiters_with_closed() {
        let gate = AdmissionGate::new(0);
        thread::scope(|scope| {
            let waiter = scope.spawn(|| gate.acquire(None, Duration::ZERO));
            thread::sleep(Duration::from_millis(20));
            gate.close();
            assert!(matches!(
                waiter.join().expect("waiter"),
                Err(PipelineError::Closed)
            ));
        });
        gate.release();
        assert!(matches!(
            gate.acquire(None, Duration::ZERO),
            Err(PipelineError::Closed)
        ));
    }
}
