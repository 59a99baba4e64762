pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, GoogleConfig, DEFAULT_MODEL, DEFAULT_SAMPLE_RATE};
pub use error::{AudioError, ConfigError, CredentialError, EngineError, TransportError};
pub use types::{
    AudioChunk, RecognitionResult, ResultsType, SessionState, StatusCode, TerminalStatus,
    BYTES_PER_SAMPLE,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_chunk_creation() {
        let chunk = AudioChunk::new(vec![0, 0, 1, 0]);
        assert_eq!(chunk.len(), 4);
        assert!(!chunk.is_empty());
        assert!(AudioChunk::silence(0).is_empty());
    }

    #[test]
    fn test_recognition_result_fields() {
        let result = RecognitionResult {
            text: "hello world".to_string(),
            is_final: false,
            stability: 0.9,
            confidence: 0.0,
        };
        assert_eq!(result.text, "hello world");
        assert!(!result.is_final);
        assert_eq!(result.stability, 0.9);
    }
}
