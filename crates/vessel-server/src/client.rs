//! Minimal client for the TCP front.

use std::collections::BTreeMap;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use vessel_kernel::config::DEFAULT_MAX_MESSAGE_LENGTH;
use vessel_types::{BoundFunction, LogEntry, PartialResult, SerializedObject, TaskId, TaskInfo};

use crate::protocol::{FunctionSpec, Request, Response};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error response.
    #[error("{kind}: {message}")]
    Remote {
        kind: String,
        message: String,
        /// Logs received before the error, including build logs.
        logs: Vec<LogEntry>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// The remote error kind, if this came from the server.
    pub fn kind(&self) -> Option<&str> {
        match self {
            ClientError::Remote { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// A completed Run.
#[derive(Debug, Clone)]
pub struct RunReply {
    pub logs: Vec<LogEntry>,
    pub result: SerializedObject,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    max_send_message_length: usize,
    max_receive_message_length: usize,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_send_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_receive_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_send_message_length(mut self, len: usize) -> Self {
        self.max_send_message_length = len;
        self
    }

    pub fn with_max_receive_message_length(mut self, len: usize) -> Self {
        self.max_receive_message_length = len;
        self
    }

    async fn open(&self, request: &Request) -> Result<Framed<TcpStream, LinesCodec>, ClientError> {
        let line = serde_json::to_string(request)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if line.len() > self.max_send_message_length {
            return Err(ClientError::Remote {
                kind: "transport_limit_exceeded".to_string(),
                message: format!(
                    "Sent message larger than max ({} vs. {})",
                    line.len(),
                    self.max_send_message_length
                ),
                logs: Vec::new(),
            });
        }
        let stream = TcpStream::connect(&self.addr).await?;
        let mut framed = Framed::new(
            stream,
            LinesCodec::new_with_max_length(self.max_receive_message_length),
        );
        framed.send(line).await.map_err(codec_error)?;
        Ok(framed)
    }

    async fn single(&self, request: &Request) -> Result<Response, ClientError> {
        let mut framed = self.open(request).await?;
        match next_response(&mut framed).await? {
            Response::Error {
                kind,
                message,
                logs,
            } => Err(ClientError::Remote {
                kind,
                message,
                logs,
            }),
            response => Ok(response),
        }
    }

    /// Run and collect every chunk.
    pub async fn run(&self, bound: &BoundFunction) -> Result<RunReply, ClientError> {
        self.run_with(bound, |_| {}).await
    }

    /// Run, calling `on_chunk` for each chunk as it arrives.
    pub async fn run_with<F>(&self, bound: &BoundFunction, mut on_chunk: F) -> Result<RunReply, ClientError>
    where
        F: FnMut(&PartialResult),
    {
        let request = Request::Run {
            bound: FunctionSpec::from_bound(bound),
        };
        let mut framed = self.open(&request).await?;
        let mut logs = Vec::new();
        let mut chunks = 0;
        loop {
            match next_response(&mut framed).await? {
                Response::Chunk { chunk } => {
                    chunks += 1;
                    on_chunk(&chunk);
                    logs.extend(chunk.logs);
                    if chunk.is_complete {
                        let result = chunk.result.ok_or_else(|| {
                            ClientError::Protocol("terminal chunk without result".to_string())
                        })?;
                        return Ok(RunReply {
                            logs,
                            result,
                            chunks,
                        });
                    }
                }
                Response::Error {
                    kind,
                    message,
                    logs: error_logs,
                } => {
                    logs.extend(error_logs);
                    return Err(ClientError::Remote {
                        kind,
                        message,
                        logs,
                    });
                }
                other => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected response to run: {other:?}"
                    )));
                }
            }
        }
    }

    pub async fn submit(&self, bound: &BoundFunction) -> Result<TaskId, ClientError> {
        let request = Request::Submit {
            bound: FunctionSpec::from_bound(bound),
        };
        match self.single(&request).await? {
            Response::Submitted { task_id } => Ok(task_id),
            other => Err(ClientError::Protocol(format!(
                "unexpected response to submit: {other:?}"
            ))),
        }
    }

    pub async fn set_metadata(
        &self,
        task_id: TaskId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        expect_ack(self.single(&Request::SetMetadata { task_id, metadata }).await?)
    }

    pub async fn list(&self) -> Result<Vec<TaskInfo>, ClientError> {
        match self.single(&Request::List).await? {
            Response::Tasks { tasks } => Ok(tasks),
            other => Err(ClientError::Protocol(format!(
                "unexpected response to list: {other:?}"
            ))),
        }
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<(), ClientError> {
        expect_ack(self.single(&Request::Cancel { task_id }).await?)
    }
}

fn expect_ack(response: Response) -> Result<(), ClientError> {
    match response {
        Response::Ack => Ok(()),
        other => Err(ClientError::Protocol(format!("expected ack, got {other:?}"))),
    }
}

async fn next_response(framed: &mut Framed<TcpStream, LinesCodec>) -> Result<Response, ClientError> {
    let line = framed
        .next()
        .await
        .ok_or_else(|| ClientError::Protocol("connection closed before a response".to_string()))?
        .map_err(codec_error)?;
    serde_json::from_str(&line).map_err(|e| ClientError::Protocol(format!("bad response: {e}")))
}

fn codec_error(err: tokio_util::codec::LinesCodecError) -> ClientError {
    match err {
        tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => ClientError::Remote {
            kind: "transport_limit_exceeded".to_string(),
            message: "Received message larger than max".to_string(),
            logs: Vec::new(),
        },
        tokio_util::codec::LinesCodecError::Io(e) => ClientError::Io(e),
    }
}
