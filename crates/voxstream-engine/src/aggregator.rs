use crate::proto::StreamingRecognizeResponse;
use crate::transport::StreamReader;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use voxstream_core::{RecognitionResult, StatusCode, TerminalStatus, TransportError};

/// Holds the most recent recognition result for one session.
///
/// The drain task writes, the host reads through [`take_result`](Self::take_result).
/// Neither side ever waits on the network while holding the slot.
pub struct ResultAggregator {
    log_id: String,
    slot: Mutex<Option<RecognitionResult>>,
    failure: Mutex<Option<TransportError>>,
    stopping: AtomicBool,
    ended: AtomicBool,
    responses: AtomicUsize,
    done_tx: watch::Sender<bool>,
}

impl ResultAggregator {
    pub fn new(log_id: &str) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            log_id: log_id.to_string(),
            slot: Mutex::new(None),
            failure: Mutex::new(None),
            stopping: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            responses: AtomicUsize::new(0),
            done_tx,
        }
    }

    /// Clear per-stream flags before a new stream starts. An unconsumed
    /// result from the previous stream is kept.
    pub fn reset_stream(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        self.ended.store(false, Ordering::SeqCst);
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.done_tx.send_replace(false);
    }

    /// Record one response. Returns `true` if it carried a result.
    pub fn record(&self, response: StreamingRecognizeResponse) -> bool {
        self.responses.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = response.error.filter(|e| e.code != 0) {
            let status = TerminalStatus::new(StatusCode::from_i32(error.code), error.message);
            tracing::error!(session = %self.log_id, "service reported error {status}");
            self.record_failure(TransportError::Protocol(status));
            return false;
        }

        let Some(first) = response.results.into_iter().next() else {
            return false;
        };
        let is_final = first.is_final;
        let stability = first.stability;
        let Some(alternative) = first.alternatives.into_iter().next() else {
            return false;
        };

        tracing::info!(
            session = %self.log_id,
            is_final,
            stability,
            "recognized: {:?}",
            alternative.transcript
        );

        let result = RecognitionResult {
            text: alternative.transcript,
            is_final,
            stability,
            confidence: alternative.confidence,
        };

        {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(pending) if pending.is_final && !is_final => {
                    tracing::trace!(session = %self.log_id, "keeping unconsumed final over interim");
                }
                _ => *slot = Some(result),
            }
        }

        if is_final {
            self.done_tx.send_replace(true);
        }
        true
    }

    /// Return and clear the current result. Never blocks on I/O.
    pub fn take_result(&self) -> Option<RecognitionResult> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn has_result(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Record a mid-stream failure. The first failure wins.
    pub fn record_failure(&self, error: TransportError) {
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    /// Take the recorded failure, if any.
    pub fn take_failure(&self) -> Option<TransportError> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Describe the recorded failure without consuming it.
    pub fn failure_message(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(ToString::to_string)
    }

    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn mark_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    /// The peer has closed the current stream.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// A final result has been recorded on the current stream.
    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn response_count(&self) -> usize {
        self.responses.load(Ordering::Relaxed)
    }
}

/// Drain loop run on its own task: owns the reader until the stream ends or
/// `cancel` fires, feeding every response into `aggregator`.
pub async fn drain(
    mut reader: Box<dyn StreamReader>,
    aggregator: std::sync::Arc<ResultAggregator>,
    cancel: CancellationToken,
) -> TerminalStatus {
    let status = loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break TerminalStatus::cancelled(),
            received = reader.receive() => received,
        };

        match received {
            Ok(Some(response)) => {
                aggregator.record(response);
            }
            Ok(None) => break TerminalStatus::ok(),
            Err(e) => {
                let status = e
                    .status()
                    .cloned()
                    .unwrap_or_else(|| TerminalStatus::new(StatusCode::Unknown, e.to_string()));
                if status.code == StatusCode::Cancelled || aggregator.is_stopping() {
                    tracing::debug!(session = %aggregator.log_id, "read ended during shutdown: {e}");
                } else {
                    tracing::error!(session = %aggregator.log_id, "stream read failed: {e}");
                    aggregator.record_failure(e);
                }
                break status;
            }
        }
    };

    aggregator.mark_ended();
    tracing::debug!(
        session = %aggregator.log_id,
        responses = aggregator.response_count(),
        "drain finished with status {status}"
    );
    status
}
