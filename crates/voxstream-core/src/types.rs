use std::fmt;
use std::time::Duration;

/// Bytes per sample of 16-bit linear PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// A slice of mono s16le PCM audio at the session's sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Encode samples as little-endian bytes.
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut data = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self { data }
    }

    pub fn silence(len_bytes: usize) -> Self {
        Self {
            data: vec![0; len_bytes],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration(&self, sample_rate_hertz: u32) -> Duration {
        if sample_rate_hertz == 0 {
            return Duration::ZERO;
        }
        let samples = (self.data.len() / BYTES_PER_SAMPLE) as u64;
        Duration::from_micros(samples * 1_000_000 / sample_rate_hertz as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub text: String,
    pub is_final: bool,
    /// Meaningful only for interim results.
    pub stability: f32,
    /// Meaningful only for final results.
    pub confidence: f32,
}

impl RecognitionResult {
    /// Confidence scaled to the 0..=100 integer score telephony hosts expect.
    pub fn score(&self) -> i32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Streaming,
    HalfClosed,
    Finished,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Streaming => "streaming",
            SessionState::HalfClosed => "half-closed",
            SessionState::Finished => "finished",
            SessionState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result shape requested by the host. Only `Normal` is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsType {
    Normal,
    NBest,
}

/// gRPC status codes, as carried by a stream's terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::Unknown => 2,
            StatusCode::InvalidArgument => 3,
            StatusCode::DeadlineExceeded => 4,
            StatusCode::NotFound => 5,
            StatusCode::AlreadyExists => 6,
            StatusCode::PermissionDenied => 7,
            StatusCode::ResourceExhausted => 8,
            StatusCode::FailedPrecondition => 9,
            StatusCode::Aborted => 10,
            StatusCode::OutOfRange => 11,
            StatusCode::Unimplemented => 12,
            StatusCode::Internal => 13,
            StatusCode::Unavailable => 14,
            StatusCode::DataLoss => 15,
            StatusCode::Unauthenticated => 16,
        }
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalStatus {
    pub code: StatusCode,
    pub message: String,
}

impl TerminalStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "stream cancelled locally")
    }

    pub fn deadline_exceeded(waited: Duration) -> Self {
        Self::new(
            StatusCode::DeadlineExceeded,
            format!("no terminal status within {waited:?}"),
        )
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "({}) {:?}", self.code.as_i32(), self.code)
        } else {
            write!(f, "({}) {:?}: {}", self.code.as_i32(), self.code, self.message)
        }
    }
}
