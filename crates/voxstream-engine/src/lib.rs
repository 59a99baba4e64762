pub mod aggregator;
pub mod auth;
pub mod credentials;
pub mod engine_trait;
pub mod google_engine;
pub mod grpc_transport;
pub mod loopback;
pub mod null_engine;
pub mod proto;
pub mod registry;
pub mod session;
pub mod transport;

pub use aggregator::ResultAggregator;
pub use credentials::{AmbientDiscovery, Credential, CredentialOrigin, CredentialResolver};
pub use engine_trait::SpeechEngine;
pub use google_engine::GoogleSpeechEngine;
pub use grpc_transport::GrpcTransport;
pub use loopback::{LoopbackScript, LoopbackTransport};
pub use null_engine::NullSpeechEngine;
pub use registry::EngineRegistry;
pub use session::{Session, SessionConfig, SessionOptions};
pub use transport::{ActiveStream, OpenStream, StreamReader, StreamTransport, StreamWriter};
