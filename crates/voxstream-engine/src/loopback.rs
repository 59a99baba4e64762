use crate::proto::{
    SpeechRecognitionAlternative, StreamingRecognitionResult, StreamingRecognizeRequest,
    StreamingRecognizeResponse,
};
use crate::transport::{OpenStream, StreamReader, StreamTransport, StreamWriter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voxstream_core::{TerminalStatus, TransportError};

/// How the in-process peer behaves.
#[derive(Debug, Clone)]
pub struct LoopbackScript {
    /// Answer every audio message with an interim result.
    pub interim_per_chunk: bool,
    /// Answer half-close with a final result before ending the stream.
    pub final_on_half_close: bool,
    pub fail_open: bool,
    /// Refuse this many opens, then accept.
    pub fail_first_opens: usize,
    pub open_delay: Duration,
    /// Reject the first (configuration) message.
    pub fail_config: bool,
    /// Accept this many audio messages, then fail every further send.
    pub fail_audio_after: Option<usize>,
    /// After this many audio messages the peer aborts the stream.
    pub peer_error_after: Option<(usize, TerminalStatus)>,
}

impl Default for LoopbackScript {
    fn default() -> Self {
        Self {
            interim_per_chunk: true,
            final_on_half_close: true,
            fail_open: false,
            fail_first_opens: 0,
            open_delay: Duration::ZERO,
            fail_config: false,
            fail_audio_after: None,
            peer_error_after: None,
        }
    }
}

impl LoopbackScript {
    /// A peer that never recognizes anything.
    pub fn silent() -> Self {
        Self {
            interim_per_chunk: false,
            final_on_half_close: false,
            ..Self::default()
        }
    }
}

type PeerItem = Result<StreamingRecognizeResponse, TransportError>;

/// In-process stand-in for the recognition service. Every request written to
/// any stream it opened is recorded for inspection.
pub struct LoopbackTransport {
    script: LoopbackScript,
    requests: Arc<Mutex<Vec<StreamingRecognizeRequest>>>,
    attempts: AtomicUsize,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub fn new(script: LoopbackScript) -> Self {
        Self {
            script,
            requests: Arc::new(Mutex::new(Vec::new())),
            attempts: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// All requests sent so far, in order, across every stream.
    pub fn requests(&self) -> Vec<StreamingRecognizeRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Successful opens.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams whose reader has not been dropped yet.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackScript::default())
    }
}

#[async_trait]
impl StreamTransport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn open(&self, deadline: Duration) -> Result<OpenStream, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.script.open_delay > deadline {
            tokio::time::sleep(deadline).await;
            return Err(TransportError::DialTimeout(deadline));
        }
        tokio::time::sleep(self.script.open_delay).await;
        if self.script.fail_open || attempt < self.script.fail_first_opens {
            return Err(TransportError::Dial("loopback peer refused the stream".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(OpenStream {
            writer: Box::new(LoopbackWriter {
                script: self.script.clone(),
                requests: Arc::clone(&self.requests),
                responses: Some(tx),
                sent: 0,
                aborted: false,
                audio_chunks: 0,
                audio_bytes: 0,
            }),
            reader: Box::new(LoopbackReader {
                responses: rx,
                live: Arc::clone(&self.live),
            }),
        })
    }
}

struct LoopbackWriter {
    script: LoopbackScript,
    requests: Arc<Mutex<Vec<StreamingRecognizeRequest>>>,
    responses: Option<mpsc::UnboundedSender<PeerItem>>,
    sent: usize,
    aborted: bool,
    audio_chunks: usize,
    audio_bytes: usize,
}

impl LoopbackWriter {
    fn reply(&self, item: PeerItem) {
        if let Some(tx) = &self.responses {
            let _ = tx.send(item);
        }
    }

    fn transcript(&self) -> String {
        format!("[loopback] {} bytes", self.audio_bytes)
    }
}

#[async_trait]
impl StreamWriter for LoopbackWriter {
    async fn send(&mut self, request: StreamingRecognizeRequest) -> Result<(), TransportError> {
        if self.aborted {
            return Err(TransportError::Write("loopback peer aborted the stream".to_string()));
        }
        if self.responses.is_none() {
            return Err(TransportError::Closed);
        }
        self.sent += 1;

        if self.sent == 1 && self.script.fail_config {
            return Err(TransportError::Write("loopback peer rejected config".to_string()));
        }
        if let Some(len) = request.audio_content().map(<[u8]>::len) {
            if self
                .script
                .fail_audio_after
                .is_some_and(|limit| self.audio_chunks >= limit)
            {
                return Err(TransportError::Write("loopback peer went away".to_string()));
            }
            self.audio_chunks += 1;
            self.audio_bytes += len;
        }
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if request.is_config() {
            return Ok(());
        }

        if let Some((after, status)) = &self.script.peer_error_after {
            if self.audio_chunks == *after {
                self.reply(Err(TransportError::Read(status.clone())));
                self.responses.take();
                self.aborted = true;
                return Ok(());
            }
        }
        if self.script.interim_per_chunk {
            self.reply(Ok(result_response(&self.transcript(), false, 0.5, 0.0)));
        }
        Ok(())
    }

    async fn half_close(&mut self) -> Result<(), TransportError> {
        if self.script.final_on_half_close {
            self.reply(Ok(result_response(&self.transcript(), true, 0.0, 0.9)));
        }
        // Dropping the sender ends the response stream.
        self.responses.take();
        Ok(())
    }
}

struct LoopbackReader {
    responses: mpsc::UnboundedReceiver<PeerItem>,
    live: Arc<AtomicUsize>,
}

impl Drop for LoopbackReader {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamReader for LoopbackReader {
    async fn receive(&mut self) -> Result<Option<StreamingRecognizeResponse>, TransportError> {
        match self.responses.recv().await {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

fn result_response(
    transcript: &str,
    is_final: bool,
    stability: f32,
    confidence: f32,
) -> StreamingRecognizeResponse {
    StreamingRecognizeResponse {
        error: None,
        results: vec![StreamingRecognitionResult {
            alternatives: vec![SpeechRecognitionAlternative {
                transcript: transcript.to_string(),
                confidence,
            }],
            is_final,
            stability,
        }],
    }
}
