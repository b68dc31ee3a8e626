//! In-memory ordered wire with a tiny key/value server on the far end.

use std::collections::HashMap;
use std::thread;

use cmd_ring::Command;
use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::{FrameWriter, PipelineError, ReplyReader, Transport};

/// One server reply. Every command on the wire produces exactly one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Answer to `PING` with no argument.
    Pong,
    /// Simple acknowledgement.
    Ok,
    /// String payload.
    Bulk(String),
    /// Integer payload.
    Integer(i64),
    /// Missing key.
    Nil,
    /// The server rejected the command.
    Error(String),
}

/// Ordered request/response wire backed by two `crossbeam-channel`s.
///
/// The server thread answers frames in the order they were written and exits
/// once the writing half is dropped.
pub struct LoopbackTransport {
    requests: Sender<Vec<Command>>,
    replies: Receiver<Reply>,
}

impl LoopbackTransport {
    /// Starts the loopback server.
    pub fn spawn() -> Result<Self, PipelineError> {
        let (requests, frames) = crossbeam_channel::unbounded();
        let (reply_tx, replies) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("loopback-server".into())
            .spawn(move || serve(frames, reply_tx))
            .map_err(|source| PipelineError::Spawn {
                role: "loopback-server",
                source,
            })?;
        Ok(Self { requests, replies })
    }
}

impl Transport for LoopbackTransport {
    type Writer = LoopbackWriter;
    type Reader = LoopbackReader;

    fn split(self) -> (LoopbackWriter, LoopbackReader) {
        (
            LoopbackWriter {
                requests: self.requests,
            },
            LoopbackReader {
                replies: self.replies,
            },
        )
    }
}

/// Request half of [`LoopbackTransport`].
pub struct LoopbackWriter {
    requests: Sender<Vec<Command>>,
}

impl FrameWriter for LoopbackWriter {
    fn write_frame(&mut self, frame: Vec<Command>) -> Result<(), PipelineError> {
        self.requests
            .send(frame)
            .map_err(|_| PipelineError::Transport("loopback server is gone".into()))
    }
}

/// Reply half of [`LoopbackTransport`].
pub struct LoopbackReader {
    replies: Receiver<Reply>,
}

impl ReplyReader for LoopbackReader {
    fn read_reply(&mut self) -> Result<Reply, PipelineError> {
        self.replies
            .recv()
            .map_err(|_| PipelineError::Transport("loopback reply stream closed".into()))
    }
}

fn serve(frames: Receiver<Vec<Command>>, replies: Sender<Reply>) {
    let mut store = HashMap::new();
    let mut answered = 0u64;
    for frame in frames.iter() {
        for command in &frame {
            if replies.send(execute(&mut store, command)).is_err() {
                debug!(answered, "reply reader went away");
                return;
            }
            answered += 1;
        }
    }
    debug!(answered, "loopback server drained");
}

fn execute(store: &mut HashMap<String, String>, command: &[String]) -> Reply {
    let Some((name, args)) = command.split_first() else {
        return Reply::Error("ERR empty command".into());
    };
    match (name.to_ascii_uppercase().as_str(), args) {
        ("PING", []) => Reply::Pong,
        ("PING", [message]) | ("ECHO", [message]) => Reply::Bulk(message.clone()),
        ("SET", [key, value]) => {
            store.insert(key.clone(), value.clone());
            Reply::Ok
        }
        ("GET", [key]) => store.get(key).cloned().map_or(Reply::Nil, Reply::Bulk),
        ("DEL", [key]) => Reply::Integer(i64::from(store.remove(key).is_some())),
        ("INCR", [key]) => {
            let current = store.get(key).map_or(Ok(0), |value| value.parse::<i64>());
            match current {
                Ok(current) => {
                    let next = current.wrapping_add(1);
                    store.insert(key.clone(), next.to_string());
                    Reply::Integer(next)
                }
                Err(_) => Reply::Error("ERR value is not an integer".into()),
            }
        }
        (other, _) => Reply::Error(format!(
            "ERR unknown command or wrong arity '{}'",
            other.to_ascii_lowercase()
        )),
    }
}
