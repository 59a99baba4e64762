use crate::engine_trait::SpeechEngine;
use std::collections::HashMap;
use voxstream_core::EngineError;

/// Engine factories keyed by the name used in `[engine] name`.
pub struct EngineRegistry {
    factories: HashMap<String, fn() -> Box<dyn SpeechEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("google", || {
            Box::new(crate::google_engine::GoogleSpeechEngine::new())
        });
        registry.register("null", || Box::new(crate::null_engine::NullSpeechEngine::new()));
        registry
    }

    pub fn register(&mut self, name: &str, factory: fn() -> Box<dyn SpeechEngine>) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn SpeechEngine>, EngineError> {
        self.factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| EngineError::EngineNotFound(name.to_string()))
    }

    /// Create the engine registered under `name` and hand it its config
    /// section.
    pub async fn instantiate(
        &self,
        name: &str,
        config: toml::Value,
    ) -> Result<Box<dyn SpeechEngine>, EngineError> {
        let mut engine = self.create(name)?;
        engine.initialize(config).await?;
        tracing::debug!(registered = name, engine = engine.name(), "engine ready");
        Ok(engine)
    }

    /// Registered engine names, sorted.
    pub fn list_engines(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackScript, LoopbackTransport};
    use crate::session::{Session, SessionConfig, SessionOptions};
    use async_trait::async_trait;
    use std::sync::Arc;
    use voxstream_core::AudioChunk;

    /// Serves sessions at a fixed language, taken from its config section.
    struct FixedLanguageEngine {
        language_code: String,
    }

    #[async_trait]
    impl SpeechEngine for FixedLanguageEngine {
        fn name(&self) -> &str {
            "fixed-language"
        }

        async fn initialize(&mut self, config: toml::Value) -> Result<(), EngineError> {
            self.language_code = config
                .get("language_code")
                .and_then(toml::Value::as_str)
                .ok_or_else(|| EngineError::InvalidConfig("language_code is required".to_string()))?
                .to_string();
            Ok(())
        }

        async fn create(&self, _options: SessionOptions) -> Result<Session, EngineError> {
            let config = SessionConfig {
                language_code: self.language_code.clone(),
                ..SessionConfig::default()
            };
            let transport = Arc::new(LoopbackTransport::new(LoopbackScript::silent()));
            Ok(Session::new("fixed-1", config, transport))
        }
    }

    fn fixed_language() -> Box<dyn SpeechEngine> {
        Box::new(FixedLanguageEngine {
            language_code: String::new(),
        })
    }

    #[test]
    fn test_builtin_engines_are_listed_sorted() {
        let registry = EngineRegistry::new();
        assert_eq!(registry.list_engines(), vec!["google", "null"]);
        assert_eq!(registry.create("google").unwrap().name(), "google");
    }

    #[test]
    fn test_unknown_engine_is_not_found() {
        match EngineRegistry::new().create("whisper") {
            Err(EngineError::EngineNotFound(name)) => assert_eq!(name, "whisper"),
            _ => panic!("expected EngineNotFound error"),
        }
    }

    #[tokio::test]
    async fn test_registered_factory_builds_working_engine() {
        let mut registry = EngineRegistry::new();
        registry.register("pinned", fixed_language);
        assert_eq!(registry.list_engines(), vec!["google", "null", "pinned"]);

        let config: toml::Value = toml::from_str("language_code = \"ja-JP\"").unwrap();
        let engine = registry.instantiate("pinned", config).await.unwrap();
        assert_eq!(engine.name(), "fixed-language");

        let session = engine.create(SessionOptions::default()).await.unwrap();
        assert_eq!(session.get_setting("language_code").as_deref(), Some("ja-JP"));
        session.start().await.unwrap();
        session.write(&AudioChunk::silence(320)).await.unwrap();
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_instantiate_surfaces_initialize_error() {
        let mut registry = EngineRegistry::new();
        registry.register("pinned", fixed_language);
        let empty = toml::Value::Table(Default::default());
        assert!(matches!(
            registry.instantiate("pinned", empty).await,
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_register_replaces_existing_factory() {
        let mut registry = EngineRegistry::new();
        registry.register("null", fixed_language);
        assert_eq!(registry.create("null").unwrap().name(), "fixed-language");
        assert_eq!(registry.list_engines().len(), 2);
    }
}
