//! Per-session log multiplexer.
//!
//! Builders, the bridge's stderr relay and the agent's log frames all write
//! into one [`LogSink`]. The caller reads a [`RunStream`] of chunks:
//!
//! ```text
//!   builder    ──┐
//!   bridge     ──┼──▶ LogSink (bounded mpsc) ──▶ RunStream ──▶ PartialResult*
//!   agent logs ──┘                                             then terminal
//! ```
//!
//! Entries from one producer keep their order. The stream ends with exactly
//! one terminal item: the completed chunk or the error. Dropping the stream
//! cancels the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use vessel_types::{LogEntry, PartialResult, SerializedObject, VesselError};

/// Events buffered between producers and the consumer.
pub const DEFAULT_CAPACITY: usize = 256;

/// Largest number of entries folded into one non-terminal chunk.
const MAX_BATCH: usize = 64;

#[derive(Debug)]
enum SessionEvent {
    Log(LogEntry),
    Finished(Result<SerializedObject, VesselError>),
}

/// Cloneable write side of a session's log stream.
///
/// Writes wait when the consumer is behind. If the consumer is gone the
/// entry is dropped, same as writing to a closed pipe.
#[derive(Clone, Debug)]
pub struct LogSink {
    sender: mpsc::Sender<SessionEvent>,
    finished: Arc<AtomicBool>,
}

impl LogSink {
    /// A sink nobody reads.
    pub fn discard() -> Self {
        let (sender, _receiver) = mpsc::channel(1);
        Self {
            sender,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn emit(&self, entry: LogEntry) {
        if self.finished.load(Ordering::Acquire) {
            tracing::trace!(%entry, "log after terminal result dropped");
            return;
        }
        let _ = self.sender.send(SessionEvent::Log(entry)).await;
    }

    /// Deliver the terminal outcome. A second call is an invariant violation.
    pub async fn finish(
        &self,
        outcome: Result<SerializedObject, VesselError>,
    ) -> Result<(), VesselError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(VesselError::InvariantViolation(
                "session produced more than one terminal result".to_string(),
            ));
        }
        let _ = self.sender.send(SessionEvent::Finished(outcome)).await;
        Ok(())
    }

    /// True once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Create a sink/stream pair. Dropping the stream cancels `cancel`.
pub fn channel(capacity: usize, cancel: CancellationToken) -> (LogSink, RunStream) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        LogSink {
            sender,
            finished: Arc::new(AtomicBool::new(false)),
        },
        RunStream {
            receiver,
            pending: None,
            done: false,
            _cancel: cancel.drop_guard(),
        },
    )
}

/// Read side of a session: log chunks, then one terminal item.
pub struct RunStream {
    receiver: mpsc::Receiver<SessionEvent>,
    pending: Option<Result<PartialResult, VesselError>>,
    done: bool,
    _cancel: DropGuard,
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream").field("done", &self.done).finish()
    }
}

impl RunStream {
    /// Next chunk, or `None` after the terminal item was returned.
    pub async fn next(&mut self) -> Option<Result<PartialResult, VesselError>> {
        if let Some(terminal) = self.pending.take() {
            self.done = true;
            return Some(terminal);
        }
        if self.done {
            return None;
        }
        match self.receiver.recv().await {
            None => {
                self.done = true;
                Some(Err(VesselError::InvariantViolation(
                    "session ended without a terminal result".to_string(),
                )))
            }
            Some(SessionEvent::Finished(outcome)) => {
                self.done = true;
                Some(outcome.map(|result| PartialResult::complete(Vec::new(), result)))
            }
            Some(SessionEvent::Log(entry)) => {
                let mut logs = vec![entry];
                while logs.len() < MAX_BATCH {
                    match self.receiver.try_recv() {
                        Ok(SessionEvent::Log(entry)) => logs.push(entry),
                        Ok(SessionEvent::Finished(Ok(result))) => {
                            self.done = true;
                            return Some(Ok(PartialResult::complete(logs, result)));
                        }
                        Ok(SessionEvent::Finished(Err(err))) => {
                            // Logs first, the error on the next call.
                            self.pending = Some(Err(err));
                            break;
                        }
                        Err(_) => break,
                    }
                }
                Some(Ok(PartialResult::logs(logs)))
            }
        }
    }

    /// Consume every chunk and fold them into one outcome.
    pub async fn drain(mut self) -> RunOutcome {
        let mut logs = Vec::new();
        let mut chunks = 0;
        let mut result = Err(VesselError::InvariantViolation(
            "session ended without a terminal result".to_string(),
        ));
        while let Some(item) = self.next().await {
            chunks += 1;
            match item {
                Ok(chunk) => {
                    logs.extend(chunk.logs);
                    if chunk.is_complete {
                        result = chunk.result.ok_or_else(|| {
                            VesselError::InvariantViolation(
                                "terminal chunk carried no result".to_string(),
                            )
                        });
                    }
                }
                Err(err) => result = Err(err),
            }
        }
        RunOutcome {
            logs,
            result,
            chunks,
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<PartialResult, VesselError>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

/// Everything a session produced, folded together.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub logs: Vec<LogEntry>,
    pub result: Result<SerializedObject, VesselError>,
    /// Number of items the stream yielded, terminal included.
    pub chunks: usize,
}
