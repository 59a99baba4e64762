//! Hand-written prost messages for the subset of `google.cloud.speech.v1`
//! used by `Speech/StreamingRecognize`. Field tags match the published
//! protos; fields this crate never reads or writes are left out and are
//! skipped by the decoder.

/// Full gRPC method path of the bidirectional recognize call.
pub const STREAMING_RECOGNIZE_PATH: &str = "/google.cloud.speech.v1.Speech/StreamingRecognize";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognizeRequest {
    #[prost(oneof = "streaming_recognize_request::StreamingRequest", tags = "1, 2")]
    pub streaming_request: Option<streaming_recognize_request::StreamingRequest>,
}

pub mod streaming_recognize_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum StreamingRequest {
        #[prost(message, tag = "1")]
        StreamingConfig(super::StreamingRecognitionConfig),
        #[prost(bytes, tag = "2")]
        AudioContent(Vec<u8>),
    }
}

impl StreamingRecognizeRequest {
    pub fn config(config: StreamingRecognitionConfig) -> Self {
        Self {
            streaming_request: Some(streaming_recognize_request::StreamingRequest::StreamingConfig(
                config,
            )),
        }
    }

    pub fn audio(content: &[u8]) -> Self {
        Self {
            streaming_request: Some(streaming_recognize_request::StreamingRequest::AudioContent(
                content.to_vec(),
            )),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self.streaming_request,
            Some(streaming_recognize_request::StreamingRequest::StreamingConfig(_))
        )
    }

    pub fn audio_content(&self) -> Option<&[u8]> {
        match &self.streaming_request {
            Some(streaming_recognize_request::StreamingRequest::AudioContent(bytes)) => {
                Some(bytes)
            }
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognitionConfig {
    #[prost(message, optional, tag = "1")]
    pub config: Option<RecognitionConfig>,
    #[prost(bool, tag = "2")]
    pub single_utterance: bool,
    #[prost(bool, tag = "3")]
    pub interim_results: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecognitionConfig {
    #[prost(enumeration = "AudioEncoding", tag = "1")]
    pub encoding: i32,
    #[prost(int32, tag = "2")]
    pub sample_rate_hertz: i32,
    #[prost(string, tag = "3")]
    pub language_code: String,
    #[prost(bool, tag = "11")]
    pub enable_automatic_punctuation: bool,
    /// Empty means the field is absent on the wire.
    #[prost(string, tag = "13")]
    pub model: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AudioEncoding {
    EncodingUnspecified = 0,
    Linear16 = 1,
    Flac = 2,
    Mulaw = 3,
    Amr = 4,
    AmrWb = 5,
    OggOpus = 6,
    SpeexWithHeaderByte = 7,
    WebmOpus = 9,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognizeResponse {
    #[prost(message, optional, tag = "1")]
    pub error: Option<RpcStatus>,
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<StreamingRecognitionResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingRecognitionResult {
    #[prost(message, repeated, tag = "1")]
    pub alternatives: Vec<SpeechRecognitionAlternative>,
    #[prost(bool, tag = "2")]
    pub is_final: bool,
    #[prost(float, tag = "3")]
    pub stability: f32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpeechRecognitionAlternative {
    #[prost(string, tag = "1")]
    pub transcript: String,
    #[prost(float, tag = "2")]
    pub confidence: f32,
}

/// `google.rpc.Status`, without the `details` field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}
