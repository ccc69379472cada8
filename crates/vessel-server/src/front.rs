//! TCP front: one JSON request line per connection, JSON response lines.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use vessel_kernel::Service;
use vessel_types::VesselError;

use crate::protocol::{Request, Response};

/// How long to wait for the tail of an oversized request.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    service: Service,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("front shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let service = service.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, "connection opened");
                    if let Err(e) = handle_connection(stream, service).await {
                        tracing::debug!(%peer, "connection ended with error: {}", e);
                    }
                });
            }
        }
    }
}

struct Responder {
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    max_send_message_length: usize,
}

impl Responder {
    /// Write one response. A response over the send limit is replaced with
    /// a transport error and the exchange ends.
    async fn send(&mut self, response: &Response) -> Result<(), VesselError> {
        let line = serde_json::to_string(response)
            .map_err(|e| VesselError::InvariantViolation(format!("encode response: {e}")))?;
        if line.len() > self.max_send_message_length {
            let err = VesselError::TransportLimitExceeded(format!(
                "Sent message larger than max ({} vs. {})",
                line.len(),
                self.max_send_message_length
            ));
            self.write(serde_json::to_string(&Response::error(&err)).unwrap_or_default())
                .await?;
            return Err(err);
        }
        self.write(line).await
    }

    async fn write(&mut self, line: String) -> Result<(), VesselError> {
        self.writer
            .send(line)
            .await
            .map_err(|e| VesselError::Io(e.to_string()))
    }
}

async fn handle_connection(stream: TcpStream, service: Service) -> Result<(), VesselError> {
    let max_receive = service.settings().max_receive_message_length;
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, LinesCodec::new_with_max_length(max_receive));
    let mut responder = Responder {
        writer: FramedWrite::new(write, LinesCodec::new()),
        max_send_message_length: service.settings().max_send_message_length,
    };

    let line = match reader.next().await {
        None => return Ok(()),
        Some(Ok(line)) => line,
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            let err = VesselError::TransportLimitExceeded(format!(
                "Received message larger than max (limit {max_receive})"
            ));
            let sent = responder.send(&Response::error(&err)).await;
            // Consume the rest of the request so closing does not reset the
            // connection before the client has read the error.
            let _ = SinkExt::<String>::close(&mut responder.writer).await;
            let mut rest = reader.into_inner();
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, tokio::io::copy(&mut rest, &mut tokio::io::sink()))
                .await;
            return sent;
        }
        Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
    };

    let request: Request = match serde_json::from_str(&line) {
        Ok(request) => request,
        Err(e) => {
            let response = Response::Error {
                kind: "invalid_request".to_string(),
                message: e.to_string(),
                logs: Vec::new(),
            };
            return responder.send(&response).await;
        }
    };

    match request {
        Request::Run { bound } => {
            let bound = match bound.into_bound() {
                Ok(bound) => bound,
                Err(err) => return responder.send(&Response::error(&err)).await,
            };
            tracing::info!(function = %bound.describe(), "run");
            let mut run = service.run(bound);
            loop {
                tokio::select! {
                    item = run.next() => {
                        let Some(item) = item else { break };
                        let response = match item {
                            Ok(chunk) => Response::Chunk { chunk },
                            Err(err) => Response::error(&err),
                        };
                        // Dropping `run` on the way out cancels the session.
                        responder.send(&response).await?;
                    }
                    _ = reader.next() => {
                        tracing::info!("client went away, cancelling run");
                        return Err(VesselError::Cancelled);
                    }
                }
            }
            Ok(())
        }
        Request::Submit { bound } => {
            let response = match bound.into_bound() {
                Ok(bound) => {
                    tracing::info!(function = %bound.describe(), "submit");
                    Response::Submitted {
                        task_id: service.submit(bound).await,
                    }
                }
                Err(err) => Response::error(&err),
            };
            responder.send(&response).await
        }
        Request::SetMetadata { task_id, metadata } => {
            let response = match service.set_metadata(task_id, metadata).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::error(&err),
            };
            responder.send(&response).await
        }
        Request::List => {
            let tasks = service.list().await;
            responder.send(&Response::Tasks { tasks }).await
        }
        Request::Cancel { task_id } => {
            let response = match service.cancel(task_id).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::error(&err),
            };
            responder.send(&response).await
        }
    }
}
