use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use voxstream_core::{AppConfig, AudioChunk, RecognitionResult};
use voxstream_engine::{EngineRegistry, Session, SessionOptions};

#[derive(Parser)]
#[command(name = "voxstream", about = "Stream audio to a speech recognizer")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Engine to use, overriding [engine] name
    #[arg(short, long)]
    engine: Option<String>,

    /// Milliseconds of audio per write
    #[arg(long, default_value_t = 100)]
    chunk_ms: u32,

    /// Sample rate of raw PCM input (ignored for WAV)
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Write audio as fast as possible instead of in real time
    #[arg(long)]
    no_pacing: bool,

    /// WAV (16-bit mono) or raw s16le input
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {path:?}"))?,
        None => AppConfig::default(),
    };

    let env_filter = EnvFilter::try_new(&config.general.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::Registry::default().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false),
    );
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let source = voxstream_audio::PcmSource::open(&cli.input, cli.sample_rate)
        .with_context(|| format!("failed to open audio input {:?}", cli.input))?;
    tracing::info!(
        input = %cli.input.display(),
        sample_rate = source.sample_rate_hertz(),
        duration_ms = source.duration().as_millis() as u64,
        "audio loaded"
    );

    let engine_name = cli.engine.as_deref().unwrap_or(&config.engine.name);
    let registry = EngineRegistry::new();
    if !registry.list_engines().contains(&engine_name) {
        anyhow::bail!(
            "unknown engine '{engine_name}' (available: {})",
            registry.list_engines().join(", ")
        );
    }
    let engine_config =
        toml::Value::try_from(&config.google).context("failed to serialize engine config")?;
    let engine = registry
        .instantiate(engine_name, engine_config)
        .await
        .with_context(|| format!("failed to initialize engine '{engine_name}'"))?;

    let session = Arc::new(
        engine
            .create(SessionOptions {
                sample_rate_hertz: Some(source.sample_rate_hertz()),
                ..SessionOptions::default()
            })
            .await
            .context("failed to create session")?,
    );
    tracing::info!(session = %session.id(), engine = engine.name(), "voxstream starting");

    let outcome = run(&session, &source, &cli).await;
    session.destroy().await;
    if let Some(result) = session.take_result() {
        print_result(&result);
    }
    if let Some(status) = session.terminal_status() {
        tracing::info!(session = %session.id(), "stream ended: {status}");
    }
    outcome
}

async fn run(session: &Arc<Session>, source: &voxstream_audio::PcmSource, cli: &Cli) -> Result<()> {
    session.start().await.context("failed to start recognition")?;

    // Print results while audio is still being written
    let poller = {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(50));
            loop {
                interval.tick().await;
                if let Some(result) = session.take_result() {
                    print_result(&result);
                }
            }
        })
    };

    let pacing = (!cli.no_pacing).then(|| Duration::from_millis(cli.chunk_ms.max(1) as u64));
    let pumped = pump_audio(
        session,
        source.chunks(cli.chunk_ms),
        pacing,
        tokio::signal::ctrl_c(),
    )
    .await;
    let interrupted = matches!(pumped, Ok(Pumped { interrupted: true, .. }));
    if let Ok(pumped) = &pumped {
        tracing::info!(session = %session.id(), bytes = pumped.bytes, "audio written");
    }
    let write_result = pumped.map(|_| ());

    session.stop().await;
    if write_result.is_ok() && !interrupted {
        let finish = session.config().finish_timeout;
        if !session.wait_done(finish).await {
            tracing::warn!(session = %session.id(), "no final result within {finish:?}");
        }
    }
    poller.abort();
    write_result
}

#[derive(Debug)]
struct Pumped {
    bytes: usize,
    interrupted: bool,
}

/// Write chunks until they run out, a write fails or `interrupt` resolves.
/// `interrupt` is polled for the whole run, including during writes.
async fn pump_audio<I>(
    session: &Session,
    chunks: impl IntoIterator<Item = AudioChunk>,
    pacing: Option<Duration>,
    interrupt: I,
) -> Result<Pumped>
where
    I: Future,
{
    let mut pacing = pacing.map(tokio::time::interval);
    let mut bytes = 0usize;
    tokio::pin!(interrupt);

    for chunk in chunks {
        let paced_write = async {
            if let Some(pacing) = pacing.as_mut() {
                pacing.tick().await;
            }
            session.write(&chunk).await
        };
        tokio::select! {
            biased;
            _ = &mut interrupt => {
                tracing::info!(session = %session.id(), bytes, "interrupted");
                return Ok(Pumped { bytes, interrupted: true });
            }
            sent = paced_write => {
                sent.with_context(|| format!("failed to write audio after {bytes} bytes"))?;
                bytes += chunk.len();
            }
        }
    }
    Ok(Pumped {
        bytes,
        interrupted: false,
    })
}

fn print_result(result: &RecognitionResult) {
    if result.is_final {
        println!("[final {:>3}] {}", result.score(), result.text);
    } else {
        println!("[interim {:.2}] {}", result.stability, result.text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxstream_engine::{NullSpeechEngine, SpeechEngine};

    async fn streaming_session() -> Session {
        let session = NullSpeechEngine::new()
            .create(SessionOptions::default())
            .await
            .unwrap();
        session.start().await.unwrap();
        session
    }

    fn chunks(n: usize) -> Vec<AudioChunk> {
        (0..n).map(|_| AudioChunk::silence(320)).collect()
    }

    #[tokio::test]
    async fn test_pump_writes_every_chunk() {
        let session = streaming_session().await;
        let pumped = pump_audio(&session, chunks(4), None, std::future::pending::<()>())
            .await
            .unwrap();
        assert_eq!(pumped.bytes, 1280);
        assert!(!pumped.interrupted);
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_pump_interrupt_without_pacing() {
        let session = streaming_session().await;
        let pumped = pump_audio(&session, chunks(4), None, std::future::ready(()))
            .await
            .unwrap();
        assert!(pumped.interrupted);
        assert_eq!(pumped.bytes, 0);
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_pump_interrupt_while_paced() {
        let session = streaming_session().await;
        let interrupt = tokio::time::sleep(Duration::from_millis(50));
        let pumped = tokio::time::timeout(
            Duration::from_secs(5),
            pump_audio(&session, chunks(4), Some(Duration::from_secs(3600)), interrupt),
        )
        .await
        .expect("interrupt was not observed")
        .unwrap();
        assert!(pumped.interrupted);
        // The first tick is immediate, the second waits out the hour.
        assert_eq!(pumped.bytes, 320);
        session.destroy().await;
    }

    #[tokio::test]
    async fn test_pump_stops_on_write_failure() {
        let session = NullSpeechEngine::new()
            .create(SessionOptions::default())
            .await
            .unwrap();
        let result = pump_audio(&session, chunks(2), None, std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}
