use crate::proto::{StreamingRecognizeRequest, StreamingRecognizeResponse};
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voxstream_core::{TerminalStatus, TransportError};

/// Dials bidirectional recognize streams.
///
/// The session state machine only ever talks to this contract, so any
/// bidirectional-streaming mechanism can back it (gRPC in production, an
/// in-process loopback for offline use).
#[async_trait]
pub trait StreamTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Open a new stream. Implementations must give up after `deadline`
    /// with [`TransportError::DialTimeout`].
    async fn open(&self, deadline: Duration) -> Result<OpenStream, TransportError>;
}

/// Outbound half of a stream. Only one task may own it.
#[async_trait]
pub trait StreamWriter: Send {
    async fn send(&mut self, request: StreamingRecognizeRequest) -> Result<(), TransportError>;

    /// Signal that no more requests will be sent. Idempotent.
    async fn half_close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a stream, owned exclusively by the drain task.
#[async_trait]
pub trait StreamReader: Send {
    /// Next response; `Ok(None)` once the peer ends the stream cleanly.
    async fn receive(&mut self) -> Result<Option<StreamingRecognizeResponse>, TransportError>;
}

/// Both halves of a freshly opened stream.
pub struct OpenStream {
    pub writer: Box<dyn StreamWriter>,
    pub reader: Box<dyn StreamReader>,
}

/// A live stream owned by a session: the writer, plus the drain task that
/// owns the reader and reports how the stream ended.
pub struct ActiveStream {
    writer: Box<dyn StreamWriter>,
    cancel: CancellationToken,
    drain: Option<JoinHandle<TerminalStatus>>,
}

impl ActiveStream {
    pub fn new(
        writer: Box<dyn StreamWriter>,
        cancel: CancellationToken,
        drain: JoinHandle<TerminalStatus>,
    ) -> Self {
        Self {
            writer,
            cancel,
            drain: Some(drain),
        }
    }

    pub async fn send(&mut self, request: StreamingRecognizeRequest) -> Result<(), TransportError> {
        self.writer.send(request).await
    }

    pub async fn half_close(&mut self) -> Result<(), TransportError> {
        self.writer.half_close().await
    }

    /// Wait up to `deadline` for the peer to end the stream, then cancel
    /// whatever is left. Returns the stream's terminal status.
    pub async fn finish(mut self, deadline: Duration) -> TerminalStatus {
        let Some(mut drain) = self.drain.take() else {
            return TerminalStatus::cancelled();
        };
        match tokio::time::timeout(deadline, &mut drain).await {
            Ok(joined) => joined_status(joined),
            Err(_) => {
                self.cancel.cancel();
                let _ = drain.await;
                TerminalStatus::deadline_exceeded(deadline)
            }
        }
    }

    /// Abort the stream immediately and wait for the drain task to exit.
    pub async fn cancel(mut self) -> TerminalStatus {
        self.cancel.cancel();
        match self.drain.take() {
            Some(drain) => joined_status(drain.await),
            None => TerminalStatus::cancelled(),
        }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        // Unblocks a drain task parked in receive().
        self.cancel.cancel();
    }
}

fn joined_status(joined: Result<TerminalStatus, tokio::task::JoinError>) -> TerminalStatus {
    match joined {
        Ok(status) => status,
        Err(e) => TerminalStatus::new(
            voxstream_core::StatusCode::Internal,
            format!("drain task failed: {e}"),
        ),
    }
}
