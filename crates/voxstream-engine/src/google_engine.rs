use crate::credentials::CredentialResolver;
use crate::engine_trait::{session_id, SpeechEngine};
use crate::grpc_transport::GrpcTransport;
use crate::session::{Session, SessionConfig, SessionOptions};
use async_trait::async_trait;
use std::sync::Arc;
use voxstream_core::{EngineError, GoogleConfig};

/// Google Cloud Speech-to-Text over streaming gRPC.
pub struct GoogleSpeechEngine {
    config: GoogleConfig,
    resolver: CredentialResolver,
}

impl GoogleSpeechEngine {
    pub fn new() -> Self {
        Self::with_resolver(CredentialResolver::from_env())
    }

    pub fn with_resolver(resolver: CredentialResolver) -> Self {
        Self {
            config: GoogleConfig::default(),
            resolver,
        }
    }

    pub fn config(&self) -> &GoogleConfig {
        &self.config
    }
}

impl Default for GoogleSpeechEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechEngine for GoogleSpeechEngine {
    fn name(&self) -> &str {
        "google"
    }

    async fn initialize(&mut self, config: toml::Value) -> Result<(), EngineError> {
        self.config = config
            .try_into()
            .map_err(|e: toml::de::Error| EngineError::InvalidConfig(e.to_string()))?;
        tracing::info!(
            language = %self.config.language_code,
            model = %self.config.model,
            endpoint = %self.config.endpoint,
            "google engine initialized"
        );
        Ok(())
    }

    async fn create(&self, options: SessionOptions) -> Result<Session, EngineError> {
        let id = session_id(self.name());
        let config = SessionConfig::resolve(&self.config, options, &id);

        let credential = self
            .resolver
            .resolve(self.config.key_path().as_deref(), &id)
            .await?;
        let transport = GrpcTransport::dial(&self.config.endpoint, &credential, &id)
            .map_err(|e| EngineError::Setup(e.to_string()))?;

        tracing::info!(
            session = %id,
            language = %config.language_code,
            sample_rate = config.sample_rate_hertz,
            "session created"
        );
        Ok(Session::new(id, config, Arc::new(transport)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AmbientDiscovery;

    #[test]
    fn test_google_engine_name() {
        let engine = GoogleSpeechEngine::with_resolver(CredentialResolver::new(AmbientDiscovery::none()));
        assert_eq!(engine.name(), "google");
    }

    #[tokio::test]
    async fn test_initialize_reads_google_section() {
        let mut engine =
            GoogleSpeechEngine::with_resolver(CredentialResolver::new(AmbientDiscovery::none()));
        let value: toml::Value = toml::from_str(
            r#"
language_code = "ja-JP"
model = "latest_long"
finish_timeout_ms = 250
"#,
        )
        .unwrap();
        engine.initialize(value).await.unwrap();
        assert_eq!(engine.config().language_code, "ja-JP");
        assert_eq!(engine.config().finish_timeout_ms, 250);
        assert_eq!(engine.config().open_timeout_ms, 10000);
    }

    #[tokio::test]
    async fn test_initialize_rejects_wrong_types() {
        let mut engine =
            GoogleSpeechEngine::with_resolver(CredentialResolver::new(AmbientDiscovery::none()));
        let value: toml::Value = toml::from_str("open_timeout_ms = \"soon\"").unwrap();
        assert!(matches!(
            engine.initialize(value).await,
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_create_without_any_credential_fails() {
        let engine = GoogleSpeechEngine::with_resolver(CredentialResolver::new(AmbientDiscovery::none()));
        let result = engine.create(SessionOptions::default()).await;
        assert!(matches!(result, Err(EngineError::Credential(_))));
    }
}
