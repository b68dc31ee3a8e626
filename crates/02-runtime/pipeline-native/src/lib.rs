#![deny(missing_docs)]
//! Native pipelining harness around the command ring.
//!
//! A [`Pipeline`] owns one writer thread (the drain role) and one reader thread
//! (the pairing role) bridging a [`cmd_ring::Ring`] to an ordered
//! [`Transport`]. Any number of threads may call [`Pipeline::do_one`] or
//! [`Pipeline::do_batch`] concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cmd_ring::{
    Command, Drainer, Pairer, RecvTimeoutError, ResultHandle, Ring, RingConfig, RingError,
};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

mod admission;
mod loopback;

use admission::AdmissionGate;

pub use loopback::{LoopbackReader, LoopbackTransport, LoopbackWriter, Reply};

/// What a producer receives for one admission: one reply per command.
pub type Response = Vec<Reply>;

/// Most commands the writer packs into one frame before flushing.
pub const MAX_FRAME_COMMANDS: usize = 256;

const IDLE_PARK: Duration = Duration::from_micros(50);

/// Errors surfaced by the pipeline harness.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No result arrived within the caller's timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The pipeline is shut down or lost its reader mid-request.
    #[error("pipeline closed")]
    Closed,
    /// Empty batches carry no commands and would never be answered.
    #[error("batch must contain at least one command")]
    EmptyBatch,
    /// The reply count did not match the command count.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The wire failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// A worker thread could not be started.
    #[error("failed to spawn {role} thread")]
    Spawn {
        /// Worker role.
        role: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The ring configuration was rejected.
    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Writing half of an ordered wire.
pub trait FrameWriter: Send + 'static {
    /// Writes every command in `frame`, in order.
    fn write_frame(&mut self, frame: Vec<Command>) -> Result<(), PipelineError>;
}

/// Reading half of an ordered wire.
pub trait ReplyReader: Send + 'static {
    /// Blocks for the next reply. An error ends the reader thread.
    fn read_reply(&mut self) -> Result<Reply, PipelineError>;
}

/// An ordered request/response wire: replies arrive in request order.
pub trait Transport {
    /// Writing half.
    type Writer: FrameWriter;
    /// Reading half.
    type Reader: ReplyReader;

    /// Splits the wire so each half can move to its own thread.
    fn split(self) -> (Self::Writer, Self::Reader);
}

/// Pipelined client over a command ring.
pub struct Pipeline {
    ring: Arc<Ring<Response>>,
    gate: Arc<AdmissionGate>,
    closing: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Builds the ring and starts the writer and reader threads.
    pub fn start<T: Transport>(config: RingConfig, transport: T) -> Result<Self, PipelineError> {
        let (ring, drainer, pairer) = Ring::<Response>::build(config)?;
        let (writer, reader) = transport.split();
        let gate = Arc::new(AdmissionGate::new(ring.capacity()));
        let closing = Arc::new(AtomicBool::new(false));

        let writer_closing = Arc::clone(&closing);
        let writer_thread = thread::Builder::new()
            .name("ring-writer".into())
            .spawn(move || run_writer(drainer, writer, &writer_closing))
            .map_err(|source| PipelineError::Spawn {
                role: "writer",
                source,
            })?;
        let reader_gate = Arc::clone(&gate);
        let reader_thread = match thread::Builder::new()
            .name("ring-reader".into())
            .spawn(move || run_reader(pairer, reader, &reader_gate))
        {
            Ok(handle) => handle,
            Err(source) => {
                closing.store(true, Ordering::Release);
                let _ = writer_thread.join();
                return Err(PipelineError::Spawn {
                    role: "reader",
                    source,
                });
            }
        };

        info!(capacity = ring.capacity(), "pipeline started");
        Ok(Self {
            ring,
            gate,
            closing,
            workers: Mutex::new(vec![writer_thread, reader_thread]),
        })
    }

    /// Starts a pipeline over a fresh [`LoopbackTransport`], sized from the
    /// environment.
    pub fn loopback_from_env() -> Result<Self, PipelineError> {
        Self::start(RingConfig::from_env()?, LoopbackTransport::spawn()?)
    }

    /// The underlying ring, for diagnostics.
    pub fn ring(&self) -> &Arc<Ring<Response>> {
        &self.ring
    }

    /// Sends one command and waits up to `timeout` for its reply. The timeout
    /// covers waiting for a free slot as well as waiting for the reply.
    pub fn do_one(&self, command: Command, timeout: Duration) -> Result<Reply, PipelineError> {
        let deadline = self.admit(timeout)?;
        let replies = wait(self.ring.submit_one(command), deadline, timeout)?;
        let count = replies.len();
        match <[Reply; 1]>::try_from(replies) {
            Ok([reply]) => Ok(reply),
            Err(_) => Err(PipelineError::Protocol(format!(
                "expected 1 reply, got {count}"
            ))),
        }
    }

    /// Sends `commands` as one unit and waits up to `timeout` for all replies.
    pub fn do_batch(
        &self,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> Result<Response, PipelineError> {
        if commands.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }
        let expected = commands.len();
        let deadline = self.admit(timeout)?;
        let replies = wait(self.ring.submit_batch(commands), deadline, timeout)?;
        if replies.len() != expected {
            return Err(PipelineError::Protocol(format!(
                "expected {expected} replies, got {}",
                replies.len()
            )));
        }
        Ok(replies)
    }

    /// Stops accepting work, fails producers still waiting for a slot with
    /// [`PipelineError::Closed`], lets the writer flush what is already
    /// published, and joins both threads. Calling it again is a no-op.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.gate.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_owned();
            if worker.join().is_err() {
                error!(thread = %name, "pipeline thread panicked");
            }
        }
        info!(admitted = self.ring.admitted(), "pipeline stopped");
    }

    /// Takes a slot permit before any ticket is drawn, so admission itself
    /// never spins past the caller's deadline or a shutdown.
    fn admit(&self, timeout: Duration) -> Result<Option<Instant>, PipelineError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        let deadline = Instant::now().checked_add(timeout);
        self.gate.acquire(deadline, timeout)?;
        Ok(deadline)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait(
    handle: ResultHandle<'_, Response>,
    deadline: Option<Instant>,
    timeout: Duration,
) -> Result<Response, PipelineError> {
    let seq = handle.seq();
    let remaining = deadline.map_or(timeout, |deadline| {
        deadline.saturating_duration_since(Instant::now())
    });
    match handle.recv_timeout(remaining) {
        Ok(replies) => Ok(replies),
        Err(RecvTimeoutError::Timeout(handle)) => {
            warn!(seq, ?timeout, "abandoning admission after timeout");
            drop(handle);
            Err(PipelineError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Closed),
    }
}

/// Drain role: packs published batches into frames and writes them in order.
fn run_writer<W: FrameWriter>(mut drainer: Drainer<Response>, mut writer: W, closing: &AtomicBool) {
    let mut frame: Vec<Command> = Vec::new();
    let mut frames = 0u64;
    let backoff = Backoff::new();
    loop {
        match drainer.try_next_command() {
            Some(batch) => {
                backoff.reset();
                frame.extend(batch.iter().cloned());
                if frame.len() < MAX_FRAME_COMMANDS {
                    continue;
                }
            }
            None if frame.is_empty() => {
                if closing.load(Ordering::Acquire) {
                    break;
                }
                if backoff.is_completed() {
                    thread::sleep(IDLE_PARK);
                } else {
                    backoff.snooze();
                }
                continue;
            }
            None => {}
        }
        if let Err(err) = writer.write_frame(std::mem::take(&mut frame)) {
            error!(%err, "writer stopping");
            return;
        }
        frames += 1;
    }
    debug!(frames, "writer drained");
}

/// Pairing role: reads replies in order, completes each batch's hand-off and
/// returns its slot permit.
fn run_reader<Rd: ReplyReader>(mut pairer: Pairer<Response>, mut reader: Rd, gate: &AdmissionGate) {
    let mut paired = 0u64;
    loop {
        // A reply only exists once its request was written, so its slot is
        // already Draining when next_result runs.
        let first = match reader.read_reply() {
            Ok(reply) => reply,
            Err(err) => {
                debug!(paired, %err, "reader finished");
                return;
            }
        };
        let (batch, completer) = pairer.next_result();
        let mut replies = Vec::with_capacity(batch.len());
        replies.push(first);
        while replies.len() < batch.len() {
            match reader.read_reply() {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    warn!(seq = completer.seq(), %err, "reply stream ended inside a batch");
                    drop(completer);
                    gate.release();
                    return;
                }
            }
        }
        completer.complete(replies);
        gate.release();
        paired += 1;
    }
}
