use crate::session::{Session, SessionOptions};
use async_trait::async_trait;
use voxstream_core::EngineError;

/// A speech engine the host can create recognition sessions from.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Apply the engine's configuration section. Called once, before `create`.
    async fn initialize(&mut self, config: toml::Value) -> Result<(), EngineError>;

    /// Build an idle session. No stream is opened until `Session::start`.
    async fn create(&self, options: SessionOptions) -> Result<Session, EngineError>;
}

/// Log identifier for a new session: engine name plus a short random suffix.
pub fn session_id(engine: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{engine}-{}", &suffix[..8])
}
