use std::sync::Arc;
use std::time::Duration;
use voxstream_core::{AudioChunk, EngineError, SessionState, StatusCode, TerminalStatus};
use voxstream_engine::{
    AmbientDiscovery, CredentialResolver, EngineRegistry, GoogleSpeechEngine, LoopbackScript,
    LoopbackTransport, NullSpeechEngine, Session, SessionConfig, SessionOptions, SpeechEngine,
};

const AUTHORIZED_USER: &str =
    r#"{"type":"authorized_user","client_id":"id","client_secret":"secret","refresh_token":"r"}"#;

fn google_section(key_path: &str) -> toml::Value {
    toml::from_str(&format!("service_account_key_path = {key_path:?}")).unwrap()
}

#[tokio::test]
async fn test_null_engine_full_session_through_registry() {
    let registry = EngineRegistry::new();
    let mut engine = registry.create("null").unwrap();
    engine
        .initialize(toml::Value::Table(Default::default()))
        .await
        .unwrap();

    let session = engine
        .create(SessionOptions {
            sample_rate_hertz: Some(16000),
            language_code: Some("en-US".to_string()),
            model: Some("default".to_string()),
            enable_automatic_punctuation: Some(false),
        })
        .await
        .unwrap();

    session.start().await.unwrap();
    for _ in 0..5 {
        session.write(&AudioChunk::silence(3200)).await.unwrap();
    }
    session.stop().await;
    tokio::time::timeout(Duration::from_secs(2), session.destroy())
        .await
        .expect("destroy hung");

    assert_eq!(session.state(), SessionState::Finished);
    assert!(session.last_error().is_none());
    let result = session.take_result().unwrap();
    assert!(result.is_final);
    assert_eq!(result.text, "[loopback] 16000 bytes");
}

#[tokio::test]
async fn test_silent_peer_session_completes_without_results() {
    let engine = NullSpeechEngine::with_script(LoopbackScript::silent());
    let session = engine.create(SessionOptions::default()).await.unwrap();

    session.start().await.unwrap();
    for _ in 0..5 {
        session.write(&AudioChunk::silence(3200)).await.unwrap();
        assert!(session.take_result().is_none());
    }
    session.stop().await;
    session.destroy().await;

    assert!(session.take_result().is_none());
    assert!(session.terminal_status().unwrap().is_ok());
}

#[tokio::test]
async fn test_concurrent_write_and_poll_never_loses_final() {
    let transport = Arc::new(LoopbackTransport::default());
    let session = Arc::new(Session::new(
        "concurrent",
        SessionConfig::default(),
        transport.clone(),
    ));
    session.start().await.unwrap();

    let poller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                if let Some(result) = session.take_result() {
                    let is_final = result.is_final;
                    seen.push(result);
                    if is_final {
                        return seen;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    for _ in 0..50 {
        session.write(&AudioChunk::silence(320)).await.unwrap();
        tokio::task::yield_now().await;
    }
    session.stop().await;

    let seen = tokio::time::timeout(Duration::from_secs(5), poller)
        .await
        .expect("final result never observed")
        .unwrap();
    let last = seen.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.text, "[loopback] 16000 bytes");
    assert_eq!(seen.iter().filter(|r| r.is_final).count(), 1);

    tokio::time::timeout(Duration::from_secs(2), session.destroy())
        .await
        .expect("destroy hung");
    assert!(session.take_result().is_none());
}

#[tokio::test]
async fn test_send_failure_mid_stream_then_destroy() {
    let engine = NullSpeechEngine::with_script(LoopbackScript {
        fail_audio_after: Some(3),
        ..LoopbackScript::default()
    });
    let session = engine.create(SessionOptions::default()).await.unwrap();
    session.start().await.unwrap();

    let mut failures = 0;
    for _ in 0..6 {
        if session.write(&AudioChunk::silence(3200)).await.is_err() {
            failures += 1;
        }
    }
    assert_eq!(failures, 3);
    assert_eq!(session.state(), SessionState::Errored);
    assert!(session.last_error().is_some());

    tokio::time::timeout(Duration::from_secs(2), session.destroy())
        .await
        .expect("destroy hung");
    assert_eq!(session.state(), SessionState::Finished);
}

#[tokio::test]
async fn test_peer_error_keeps_partial_transcript() {
    let engine = NullSpeechEngine::with_script(LoopbackScript {
        peer_error_after: Some((2, TerminalStatus::new(StatusCode::Internal, "boom"))),
        ..LoopbackScript::default()
    });
    let session = engine.create(SessionOptions::default()).await.unwrap();
    session.start().await.unwrap();
    session.write(&AudioChunk::silence(100)).await.unwrap();
    session.write(&AudioChunk::silence(100)).await.unwrap();

    let errored = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if session.write(&AudioChunk::silence(100)).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(errored.is_ok());

    let partial = session.take_result().unwrap();
    assert!(!partial.is_final);
    assert_eq!(partial.text, "[loopback] 100 bytes");
    session.destroy().await;
}

#[tokio::test]
async fn test_google_create_falls_back_to_ambient_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let ambient_key = dir.path().join("adc.json");
    std::fs::write(&ambient_key, AUTHORIZED_USER).unwrap();

    let resolver = CredentialResolver::new(AmbientDiscovery {
        env_key_path: Some(ambient_key),
        ..AmbientDiscovery::none()
    });
    let mut engine = GoogleSpeechEngine::with_resolver(resolver);
    let missing = dir.path().join("missing.json");
    engine
        .initialize(google_section(&missing.display().to_string()))
        .await
        .unwrap();

    let session = engine
        .create(SessionOptions {
            sample_rate_hertz: Some(0),
            ..SessionOptions::default()
        })
        .await
        .unwrap();
    assert!(session.id().starts_with("google-"));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.config().sample_rate_hertz, 16000);
    session.destroy().await;
}

#[tokio::test]
async fn test_google_create_without_credentials_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine =
        GoogleSpeechEngine::with_resolver(CredentialResolver::new(AmbientDiscovery::none()));
    engine
        .initialize(google_section(&dir.path().join("nope.json").display().to_string()))
        .await
        .unwrap();

    let result = engine.create(SessionOptions::default()).await;
    assert!(matches!(result, Err(EngineError::Credential(_))));
}

#[tokio::test]
async fn test_google_create_with_unusable_key_is_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("key.json");
    std::fs::write(&key, "this is not a key file").unwrap();

    let mut engine =
        GoogleSpeechEngine::with_resolver(CredentialResolver::new(AmbientDiscovery::none()));
    engine
        .initialize(google_section(&key.display().to_string()))
        .await
        .unwrap();

    let result = engine.create(SessionOptions::default()).await;
    assert!(matches!(result, Err(EngineError::Setup(_))));
}

#[tokio::test]
async fn test_google_start_against_unreachable_endpoint_fails_setup() {
    let key = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/service_account.json");
    let section: toml::Value = toml::from_str(&format!(
        "service_account_key_path = {key:?}\nendpoint = \"http://127.0.0.1:1\"\nopen_timeout_ms = 2000"
    ))
    .unwrap();
    let mut engine =
        GoogleSpeechEngine::with_resolver(CredentialResolver::new(AmbientDiscovery::none()));
    engine.initialize(section).await.unwrap();

    let session = engine.create(SessionOptions::default()).await.unwrap();
    let started = tokio::time::timeout(Duration::from_secs(5), session.start())
        .await
        .expect("start hung past the open deadline");
    match started {
        Err(EngineError::StreamSetup(msg)) => assert!(msg.starts_with("open:"), "{msg}"),
        other => panic!("expected StreamSetup, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Errored);
    assert!(matches!(
        session.write(&AudioChunk::silence(320)).await,
        Err(EngineError::InvalidState { .. })
    ));
    session.destroy().await;
    assert_eq!(session.state(), SessionState::Finished);
}
