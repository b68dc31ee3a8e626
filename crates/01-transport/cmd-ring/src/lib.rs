//! Lock-free admission ring for pipelined request/response clients.
//!
//! Many producers submit commands concurrently; one drain actor writes them to
//! an ordered transport in admission order; one pairing actor reads replies in
//! that same order and hands each result back to the producer that asked.
//!
//! * [`Ring`] – fixed set of slots sequencing submissions into FIFO order.
//! * [`Drainer`] / [`Pairer`] – the unique drain and pairing roles.
//! * [`ResultHandle`] / [`Completer`] – the per-slot result hand-off, reused on every cycle.
//! * [`RingConfig`] / [`RingError`] – construction-time configuration and its errors.
//!
//! ```no_run
//! use cmd_ring::{Ring, RingConfig};
//!
//! let (ring, mut drainer, mut pairer) = Ring::<String>::build(RingConfig::default())?;
//! let handle = ring.submit_one(vec!["PING".into()]);
//!
//! let batch = drainer.next_command();
//! // ... write `batch` to the transport, read the reply ...
//! let (_batch, completer) = pairer.next_result();
//! completer.complete("PONG".into());
//!
//! assert_eq!(handle.recv().as_deref(), Ok("PONG"));
//! # Ok::<(), cmd_ring::RingError>(())
//! ```

mod config;
mod error;
mod handoff;
mod ring;
mod slot;
mod sync;
mod wait;

pub use config::{RingConfig, CAPACITY_ENV, DEFAULT_CAPACITY, MAX_CAPACITY};
pub use error::{RingError, RingResult};
pub use handoff::{ChannelId, Completer, RecvError, RecvTimeoutError, ResultHandle, TryRecvError};
pub use ring::{Drainer, Pairer, Ring};
pub use slot::{Batch, Command, SlotState};
