use std::path::Path;
use std::time::Duration;
use voxstream_core::{AudioChunk, AudioError, BYTES_PER_SAMPLE};

// ── PcmSource ─────────────────────────────────────────────────

/// Mono 16-bit little-endian PCM loaded from disk.
#[derive(Debug, Clone)]
pub struct PcmSource {
    data: Vec<u8>,
    sample_rate_hertz: u32,
}

impl PcmSource {
    /// Open `path` as WAV when it has a `.wav` extension, otherwise as raw
    /// s16le at `raw_sample_rate`.
    pub fn open(path: &Path, raw_sample_rate: Option<u32>) -> Result<Self, AudioError> {
        let is_wav = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
        if is_wav {
            return Self::open_wav(path);
        }
        match raw_sample_rate {
            Some(rate) => Self::open_raw(path, rate),
            None => Err(AudioError::UnsupportedFormat(format!(
                "{} is not a WAV file and no sample rate was given for raw PCM",
                path.display()
            ))),
        }
    }

    pub fn open_wav(path: &Path) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| AudioError::Open(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(AudioError::UnsupportedFormat(format!(
                "expected 16-bit mono PCM, got {} channel(s) of {}-bit {:?}",
                spec.channels, spec.bits_per_sample, spec.sample_format
            )));
        }

        let mut data = Vec::with_capacity(reader.len() as usize * BYTES_PER_SAMPLE);
        for sample in reader.samples::<i16>() {
            let sample = sample.map_err(|e| AudioError::Read(e.to_string()))?;
            data.extend_from_slice(&sample.to_le_bytes());
        }
        tracing::debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            bytes = data.len(),
            "loaded WAV"
        );
        Self::from_bytes(data, spec.sample_rate)
    }

    pub fn open_raw(path: &Path, sample_rate_hertz: u32) -> Result<Self, AudioError> {
        let mut data = std::fs::read(path)
            .map_err(|e| AudioError::Open(format!("{}: {e}", path.display())))?;
        if data.len() % BYTES_PER_SAMPLE != 0 {
            tracing::warn!(path = %path.display(), "odd byte count, dropping trailing byte");
            data.truncate(data.len() - 1);
        }
        Self::from_bytes(data, sample_rate_hertz)
    }

    pub fn from_bytes(data: Vec<u8>, sample_rate_hertz: u32) -> Result<Self, AudioError> {
        if sample_rate_hertz == 0 {
            return Err(AudioError::UnsupportedFormat(
                "sample rate must be positive".to_string(),
            ));
        }
        Ok(Self {
            data,
            sample_rate_hertz,
        })
    }

    pub fn sample_rate_hertz(&self) -> u32 {
        self.sample_rate_hertz
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn duration(&self) -> Duration {
        let samples = (self.data.len() / BYTES_PER_SAMPLE) as u64;
        Duration::from_micros(samples * 1_000_000 / self.sample_rate_hertz as u64)
    }

    /// Bytes per chunk of `chunk_ms` milliseconds, never less than one sample.
    pub fn chunk_bytes(&self, chunk_ms: u32) -> usize {
        let samples = (self.sample_rate_hertz as u64 * chunk_ms as u64 / 1000).max(1);
        samples as usize * BYTES_PER_SAMPLE
    }

    /// Cut the audio into consecutive chunks of `chunk_ms`. The last chunk
    /// may be shorter.
    pub fn chunks(&self, chunk_ms: u32) -> impl Iterator<Item = AudioChunk> + '_ {
        self.data
            .chunks(self.chunk_bytes(chunk_ms))
            .map(|bytes| AudioChunk::new(bytes.to_vec()))
    }
}
