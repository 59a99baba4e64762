use crate::engine_trait::{session_id, SpeechEngine};
use crate::loopback::{LoopbackScript, LoopbackTransport};
use crate::session::{Session, SessionConfig, SessionOptions};
use async_trait::async_trait;
use std::sync::Arc;
use voxstream_core::{EngineError, GoogleConfig};

/// Offline engine: every session talks to an in-process loopback peer that
/// echoes byte counts back as transcripts.
pub struct NullSpeechEngine {
    config: GoogleConfig,
    script: LoopbackScript,
}

impl NullSpeechEngine {
    pub fn new() -> Self {
        Self::with_script(LoopbackScript::default())
    }

    pub fn with_script(script: LoopbackScript) -> Self {
        Self {
            config: GoogleConfig::default(),
            script,
        }
    }
}

impl Default for NullSpeechEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechEngine for NullSpeechEngine {
    fn name(&self) -> &str {
        "null"
    }

    async fn initialize(&mut self, config: toml::Value) -> Result<(), EngineError> {
        self.config = config
            .try_into()
            .map_err(|e: toml::de::Error| EngineError::InvalidConfig(e.to_string()))?;
        Ok(())
    }

    async fn create(&self, options: SessionOptions) -> Result<Session, EngineError> {
        let id = session_id(self.name());
        let config = SessionConfig::resolve(&self.config, options, &id);
        tracing::debug!(session = %id, "null session created");
        Ok(Session::new(
            id,
            config,
            Arc::new(LoopbackTransport::new(self.script.clone())),
        ))
    }
}
