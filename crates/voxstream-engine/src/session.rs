use crate::aggregator::{self, ResultAggregator};
use crate::proto::{
    AudioEncoding, RecognitionConfig, StreamingRecognitionConfig, StreamingRecognizeRequest,
};
use crate::transport::{ActiveStream, OpenStream, StreamTransport};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voxstream_core::{
    AudioChunk, EngineError, GoogleConfig, RecognitionResult, ResultsType, SessionState,
    StatusCode, TerminalStatus, TransportError, DEFAULT_MODEL, DEFAULT_SAMPLE_RATE,
};

/// Per-session overrides supplied by the host at create time.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// `None` or `Some(0)` falls back to 16000 Hz.
    pub sample_rate_hertz: Option<u32>,
    pub language_code: Option<String>,
    pub model: Option<String>,
    pub enable_automatic_punctuation: Option<bool>,
}

/// Recognition parameters for one session. Setting changes take effect at
/// the next `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub language_code: String,
    pub sample_rate_hertz: u32,
    pub model: String,
    pub enable_automatic_punctuation: bool,
    pub open_timeout: Duration,
    pub finish_timeout: Duration,
}

impl SessionConfig {
    /// Merge host overrides onto engine defaults.
    pub fn resolve(defaults: &GoogleConfig, options: SessionOptions, log_id: &str) -> Self {
        let sample_rate_hertz = match options.sample_rate_hertz {
            Some(rate) if rate > 0 && i32::try_from(rate).is_ok() => rate,
            other => {
                tracing::warn!(
                    session = %log_id,
                    requested = ?other,
                    "no usable sample rate given, defaulting to {DEFAULT_SAMPLE_RATE} Hz"
                );
                DEFAULT_SAMPLE_RATE
            }
        };
        Self {
            language_code: options
                .language_code
                .unwrap_or_else(|| defaults.language_code.clone()),
            sample_rate_hertz,
            model: options.model.unwrap_or_else(|| defaults.model.clone()),
            enable_automatic_punctuation: options
                .enable_automatic_punctuation
                .unwrap_or(defaults.enable_automatic_punctuation),
            open_timeout: defaults.open_timeout(),
            finish_timeout: defaults.finish_timeout(),
        }
    }

    /// The one-time configuration message that opens every stream.
    pub fn streaming_config(&self) -> StreamingRecognitionConfig {
        let model = if self.model.is_empty() || self.model == DEFAULT_MODEL {
            String::new()
        } else {
            self.model.clone()
        };
        StreamingRecognitionConfig {
            config: Some(RecognitionConfig {
                encoding: AudioEncoding::Linear16 as i32,
                sample_rate_hertz: wire_sample_rate(self.sample_rate_hertz),
                language_code: self.language_code.clone(),
                enable_automatic_punctuation: self.enable_automatic_punctuation,
                model,
            }),
            single_utterance: false,
            interim_results: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = GoogleConfig::default();
        Self {
            language_code: defaults.language_code.clone(),
            sample_rate_hertz: DEFAULT_SAMPLE_RATE,
            model: defaults.model.clone(),
            enable_automatic_punctuation: defaults.enable_automatic_punctuation,
            open_timeout: defaults.open_timeout(),
            finish_timeout: defaults.finish_timeout(),
        }
    }
}

struct SessionInner {
    state: SessionState,
    config: SessionConfig,
    last_error: Option<String>,
    terminal_status: Option<TerminalStatus>,
}

/// One streaming recognition session.
///
/// `start`, `write`, `stop` and `destroy` serialize on the stream handle.
/// `take_result` and the other accessors only touch in-memory state and
/// never wait on the network, so a host may write audio from one task while
/// polling results from another.
pub struct Session {
    id: String,
    transport: Arc<dyn StreamTransport>,
    inner: Mutex<SessionInner>,
    stream: tokio::sync::Mutex<Option<ActiveStream>>,
    aggregator: Arc<ResultAggregator>,
}

impl Session {
    pub fn new(id: impl Into<String>, config: SessionConfig, transport: Arc<dyn StreamTransport>) -> Self {
        let id = id.into();
        Self {
            aggregator: Arc::new(ResultAggregator::new(&id)),
            id,
            transport,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                config,
                last_error: None,
                terminal_status: None,
            }),
            stream: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        let mut inner = self.inner();
        if inner.state != state {
            tracing::debug!(session = %self.id, "state {} -> {}", inner.state, state);
            inner.state = state;
        }
    }

    /// Open a stream and send the configuration message.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut stream = self.stream.lock().await;

        let config = {
            let mut inner = self.inner();
            match inner.state {
                SessionState::Streaming => {
                    tracing::debug!(session = %self.id, "start ignored, already streaming");
                    return Ok(());
                }
                SessionState::Idle | SessionState::Errored | SessionState::HalfClosed => {}
                state => {
                    return Err(EngineError::InvalidState {
                        operation: "start",
                        state,
                    })
                }
            }
            inner.state = SessionState::Configuring;
            inner.terminal_status = None;
            inner.config.clone()
        };

        if let Some(prior) = stream.take() {
            let status = prior.cancel().await;
            tracing::debug!(session = %self.id, "released prior stream ({status})");
        }
        self.aggregator.reset_stream();

        tracing::info!(
            session = %self.id,
            transport = self.transport.name(),
            language = %config.language_code,
            sample_rate = config.sample_rate_hertz,
            "opening recognize stream"
        );
        let OpenStream { mut writer, reader } = match self.transport.open(config.open_timeout).await {
            Ok(opened) => opened,
            Err(e) => return Err(self.fail_setup("open", e)),
        };

        let request = StreamingRecognizeRequest::config(config.streaming_config());
        if let Err(e) = writer.send(request).await {
            return Err(self.fail_setup("send config", e));
        }

        let cancel = CancellationToken::new();
        let drain = tokio::spawn(aggregator::drain(
            reader,
            Arc::clone(&self.aggregator),
            cancel.clone(),
        ));
        *stream = Some(ActiveStream::new(writer, cancel, drain));
        self.set_state(SessionState::Streaming);
        tracing::info!(session = %self.id, "streaming");
        Ok(())
    }

    fn fail_setup(&self, step: &str, e: TransportError) -> EngineError {
        tracing::error!(session = %self.id, "stream setup failed at {step}: {e}");
        let message = format!("{step}: {e}");
        let mut inner = self.inner();
        inner.state = SessionState::Errored;
        inner.last_error = Some(message.clone());
        inner.terminal_status = e.status().cloned();
        EngineError::StreamSetup(message)
    }

    fn fail_stream(&self, e: TransportError) -> EngineError {
        tracing::error!(session = %self.id, "stream failed: {e}");
        let mut inner = self.inner();
        inner.state = SessionState::Errored;
        inner.last_error = Some(e.to_string());
        if let Some(status) = e.status() {
            inner.terminal_status = Some(status.clone());
        }
        EngineError::Transport(e.to_string())
    }

    /// Forward one chunk of audio. Fails without touching the transport
    /// unless the session is streaming.
    pub async fn write(&self, chunk: &AudioChunk) -> Result<(), EngineError> {
        let mut guard = self.stream.lock().await;

        let state = self.state();
        if state != SessionState::Streaming {
            return Err(EngineError::InvalidState {
                operation: "write",
                state,
            });
        }
        if let Some(failure) = self.aggregator.take_failure() {
            return Err(self.fail_stream(failure));
        }
        let Some(stream) = guard.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "write",
                state,
            });
        };
        if chunk.is_empty() {
            tracing::trace!(session = %self.id, "skipping empty chunk");
            return Ok(());
        }

        match stream.send(StreamingRecognizeRequest::audio(&chunk.data)).await {
            Ok(()) => {
                tracing::trace!(session = %self.id, bytes = chunk.len(), "audio sent");
                Ok(())
            }
            Err(e) => Err(self.fail_stream(e)),
        }
    }

    /// Half-close the stream; results may keep arriving until `destroy`.
    pub async fn stop(&self) {
        let mut guard = self.stream.lock().await;

        let state = self.state();
        if state != SessionState::Streaming {
            tracing::info!(session = %self.id, "stop ignored in state {state}");
            return;
        }
        self.aggregator.mark_stopping();
        if let Some(stream) = guard.as_mut() {
            if let Err(e) = stream.half_close().await {
                tracing::warn!(session = %self.id, "half-close failed: {e}");
            }
        }
        self.set_state(SessionState::HalfClosed);
        tracing::info!(session = %self.id, "stream half-closed");
    }

    /// Release the stream and finish the session. Safe to call repeatedly.
    pub async fn destroy(&self) {
        let mut guard = self.stream.lock().await;

        let (state, finish_timeout) = {
            let inner = self.inner();
            (inner.state, inner.config.finish_timeout)
        };
        if state == SessionState::Finished {
            tracing::debug!(session = %self.id, "already destroyed");
            return;
        }

        if let Some(stream) = guard.take() {
            let status = if state == SessionState::HalfClosed {
                stream.finish(finish_timeout).await
            } else {
                self.aggregator.mark_stopping();
                stream.cancel().await
            };
            match status.code {
                StatusCode::Ok | StatusCode::Cancelled => {
                    tracing::debug!(session = %self.id, "stream ended: {status}")
                }
                _ => tracing::warn!(session = %self.id, "stream ended abnormally: {status}"),
            }
            self.inner().terminal_status = Some(status);
        }

        self.set_state(SessionState::Finished);
        tracing::info!(session = %self.id, "session destroyed");
    }

    /// Take the latest result, if any. A failure recorded by the drain task
    /// moves the session to `Errored` here.
    pub fn take_result(&self) -> Option<RecognitionResult> {
        let result = self.aggregator.take_result();
        if let Some(message) = self.aggregator.failure_message() {
            let mut inner = self.inner();
            if matches!(inner.state, SessionState::Streaming | SessionState::HalfClosed) {
                tracing::debug!(session = %self.id, "observed stream failure: {message}");
                inner.state = SessionState::Errored;
                inner.last_error = Some(message);
            }
        }
        result
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner().last_error.clone()
    }

    /// How the most recent stream ended, once known.
    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        self.inner().terminal_status.clone()
    }

    /// A final result arrived on the current stream.
    pub fn is_done(&self) -> bool {
        self.aggregator.is_done()
    }

    /// Wait up to `timeout` for a final result. Returns whether one arrived.
    pub async fn wait_done(&self, timeout: Duration) -> bool {
        let mut done = self.aggregator.subscribe_done();
        tokio::time::timeout(timeout, done.wait_for(|d| *d))
            .await
            .map(|waited| waited.is_ok())
            .unwrap_or(false)
    }

    pub fn config(&self) -> SessionConfig {
        self.inner().config.clone()
    }

    pub fn load_grammar(&self, name: &str, _content: &str) {
        tracing::info!(session = %self.id, grammar = name, "grammars are not supported, ignoring load");
    }

    pub fn unload_grammar(&self, name: &str) {
        tracing::info!(session = %self.id, grammar = name, "grammars are not supported, ignoring unload");
    }

    pub fn activate_grammar(&self, name: &str) {
        tracing::info!(session = %self.id, grammar = name, "grammars are not supported, ignoring activate");
    }

    pub fn deactivate_grammar(&self, name: &str) {
        tracing::info!(session = %self.id, grammar = name, "grammars are not supported, ignoring deactivate");
    }

    pub fn dtmf(&self, digits: &str) {
        tracing::info!(session = %self.id, digits, "DTMF received, ignoring");
    }

    /// Update a recognition setting for the next `start`.
    pub fn change_setting(&self, name: &str, value: &str) -> Result<(), EngineError> {
        let mut inner = self.inner();
        match name {
            "language_code" => {
                if value.trim().is_empty() {
                    return Err(EngineError::InvalidConfig(
                        "language_code must not be empty".to_string(),
                    ));
                }
                inner.config.language_code = value.to_string();
            }
            "model" => inner.config.model = value.to_string(),
            "enable_automatic_punctuation" => {
                inner.config.enable_automatic_punctuation = parse_flag(value).ok_or_else(|| {
                    EngineError::InvalidConfig(format!(
                        "enable_automatic_punctuation expects a boolean, got {value:?}"
                    ))
                })?;
            }
            _ => return Err(EngineError::UnknownSetting(name.to_string())),
        }
        tracing::info!(
            session = %self.id,
            setting = name,
            value,
            "setting changed, applies at next start"
        );
        Ok(())
    }

    pub fn get_setting(&self, name: &str) -> Option<String> {
        let inner = self.inner();
        match name {
            "language_code" => Some(inner.config.language_code.clone()),
            "model" => Some(inner.config.model.clone()),
            "enable_automatic_punctuation" => {
                Some(inner.config.enable_automatic_punctuation.to_string())
            }
            "sample_rate_hertz" => Some(inner.config.sample_rate_hertz.to_string()),
            "state" => Some(inner.state.to_string()),
            _ => None,
        }
    }

    pub fn change_results_type(&self, results_type: ResultsType) -> Result<(), EngineError> {
        match results_type {
            ResultsType::Normal => Ok(()),
            ResultsType::NBest => Err(EngineError::Unsupported(
                "n-best results are not produced".to_string(),
            )),
        }
    }
}

/// The wire field is signed; rates it cannot carry fall back to the default.
fn wire_sample_rate(rate: u32) -> i32 {
    i32::try_from(rate).unwrap_or_else(|_| {
        tracing::warn!(rate, "sample rate out of range, sending {DEFAULT_SAMPLE_RATE} Hz");
        DEFAULT_SAMPLE_RATE as i32
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
