use crate::auth::{TokenSource, SPEECH_AUDIENCE};
use crate::credentials::Credential;
use crate::proto::{StreamingRecognizeRequest, StreamingRecognizeResponse, STREAMING_RECOGNIZE_PATH};
use crate::transport::{OpenStream, StreamReader, StreamTransport, StreamWriter};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use voxstream_core::{CredentialError, StatusCode, TerminalStatus, TransportError};

/// Requests queued ahead of the HTTP/2 writer before `send` waits.
const OUTBOUND_CAPACITY: usize = 64;

/// Google Speech `StreamingRecognize` over a TLS gRPC channel.
pub struct GrpcTransport {
    endpoint: Endpoint,
    /// Connected on the first successful `open`, shared by later ones.
    channel: OnceCell<Channel>,
    tokens: TokenSource,
    log_id: String,
}

impl GrpcTransport {
    /// Prepare the endpoint and token source. Nothing touches the network
    /// until the first `open`.
    pub fn dial(endpoint: &str, credential: &Credential, log_id: &str) -> Result<Self, TransportError> {
        let tokens = TokenSource::from_credential(credential, SPEECH_AUDIENCE)
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let mut builder = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| TransportError::Dial(format!("invalid endpoint {endpoint}: {e}")))?
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(30));
        if endpoint.starts_with("https://") {
            builder = builder
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .map_err(|e| TransportError::Dial(format!("TLS setup failed: {e}")))?;
        }

        tracing::debug!(
            session = %log_id,
            endpoint = %endpoint,
            auth = tokens.kind(),
            "gRPC endpoint prepared"
        );
        Ok(Self {
            endpoint: builder,
            channel: OnceCell::new(),
            tokens,
            log_id: log_id.to_string(),
        })
    }

    async fn connected(&self) -> Result<Channel, TransportError> {
        let channel = self
            .channel
            .get_or_try_init(|| async {
                let channel = self.endpoint.connect().await.map_err(|e| {
                    TransportError::Dial(format!(
                        "connect to {} failed: {}",
                        self.endpoint.uri(),
                        connect_error(&e)
                    ))
                })?;
                tracing::debug!(session = %self.log_id, uri = %self.endpoint.uri(), "gRPC channel connected");
                Ok::<_, TransportError>(channel)
            })
            .await?;
        Ok(channel.clone())
    }

    async fn open_call(&self) -> Result<OpenStream, TransportError> {
        let channel = self.connected().await?;
        let token = self.tokens.access_token().await.map_err(token_error)?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| TransportError::Dial(format!("service was not ready: {e}")))?;

        let (tx, rx) = mpsc::channel::<StreamingRecognizeRequest>(OUTBOUND_CAPACITY);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        let bearer = MetadataValue::try_from(format!("Bearer {token}"))
            .map_err(|e| TransportError::Dial(format!("invalid access token: {e}")))?;
        request.metadata_mut().insert("authorization", bearer);

        // Response headers may only arrive once the peer has seen the
        // config message, so the call runs on its own task and `open`
        // returns as soon as the connection is ready.
        let call = tokio::spawn(async move {
            let path = http::uri::PathAndQuery::from_static(STREAMING_RECOGNIZE_PATH);
            let codec = ProstCodec::<StreamingRecognizeRequest, StreamingRecognizeResponse>::default();
            grpc.streaming(request, path, codec)
                .await
                .map(|response| response.into_inner())
        });

        tracing::debug!(session = %self.log_id, "StreamingRecognize call started");
        Ok(OpenStream {
            writer: Box::new(GrpcWriter { tx: Some(tx) }),
            reader: Box::new(GrpcReader {
                state: ReaderState::Pending(call),
            }),
        })
    }
}

#[async_trait]
impl StreamTransport for GrpcTransport {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn open(&self, deadline: Duration) -> Result<OpenStream, TransportError> {
        tokio::time::timeout(deadline, self.open_call())
            .await
            .map_err(|_| TransportError::DialTimeout(deadline))?
    }
}

struct GrpcWriter {
    tx: Option<mpsc::Sender<StreamingRecognizeRequest>>,
}

#[async_trait]
impl StreamWriter for GrpcWriter {
    async fn send(&mut self, request: StreamingRecognizeRequest) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(request)
            .await
            .map_err(|_| TransportError::Write("stream closed by peer".to_string()))
    }

    async fn half_close(&mut self) -> Result<(), TransportError> {
        // Dropping the sender ends the request body stream.
        self.tx.take();
        Ok(())
    }
}

enum ReaderState {
    Pending(JoinHandle<Result<tonic::Streaming<StreamingRecognizeResponse>, tonic::Status>>),
    Active(tonic::Streaming<StreamingRecognizeResponse>),
    Done,
}

struct GrpcReader {
    state: ReaderState,
}

impl Drop for GrpcReader {
    fn drop(&mut self) {
        if let ReaderState::Pending(call) = &self.state {
            call.abort();
        }
    }
}

#[async_trait]
impl StreamReader for GrpcReader {
    async fn receive(&mut self) -> Result<Option<StreamingRecognizeResponse>, TransportError> {
        if let ReaderState::Pending(call) = &mut self.state {
            let joined = call.await;
            self.state = ReaderState::Done;
            match joined {
                Ok(Ok(inbound)) => self.state = ReaderState::Active(inbound),
                Ok(Err(status)) => return Err(TransportError::Read(terminal_status(&status))),
                Err(e) => {
                    return Err(TransportError::Read(TerminalStatus::new(
                        StatusCode::Internal,
                        format!("call task failed: {e}"),
                    )))
                }
            }
        }

        match &mut self.state {
            ReaderState::Active(inbound) => match inbound.message().await {
                Ok(Some(response)) => Ok(Some(response)),
                Ok(None) => {
                    self.state = ReaderState::Done;
                    Ok(None)
                }
                Err(status) => {
                    self.state = ReaderState::Done;
                    Err(TransportError::Read(terminal_status(&status)))
                }
            },
            _ => Ok(None),
        }
    }
}

fn terminal_status(status: &tonic::Status) -> TerminalStatus {
    TerminalStatus::new(
        StatusCode::from_i32(status.code() as i32),
        status.message().to_string(),
    )
}

/// The innermost cause; tonic's own message is only "transport error".
fn connect_error(e: &tonic::transport::Error) -> String {
    let mut source: &dyn std::error::Error = e;
    while let Some(inner) = source.source() {
        source = inner;
    }
    source.to_string()
}

fn token_error(e: CredentialError) -> TransportError {
    TransportError::Dial(format!("authentication failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialOrigin;
    use std::path::PathBuf;

    fn authorized_user() -> Credential {
        Credential::KeyMaterial {
            bytes: br#"{"type":"authorized_user","client_id":"id","client_secret":"s","refresh_token":"r"}"#
                .to_vec(),
            origin: CredentialOrigin::KeyPath(PathBuf::from("/k.json")),
        }
    }

    fn service_account() -> Credential {
        Credential::KeyMaterial {
            bytes: include_bytes!("../tests/fixtures/service_account.json").to_vec(),
            origin: CredentialOrigin::KeyPath(PathBuf::from("service_account.json")),
        }
    }

    #[tokio::test]
    async fn test_dial_does_not_connect() {
        let transport = GrpcTransport::dial("https://speech.googleapis.com", &authorized_user(), "t");
        let transport = transport.unwrap();
        assert_eq!(transport.name(), "grpc");
    }

    #[tokio::test]
    async fn test_dial_rejects_invalid_endpoint() {
        let result = GrpcTransport::dial("not a uri", &authorized_user(), "t");
        assert!(matches!(result, Err(TransportError::Dial(_))));
    }

    #[tokio::test]
    async fn test_dial_rejects_unusable_key_material() {
        let credential = Credential::KeyMaterial {
            bytes: b"garbage".to_vec(),
            origin: CredentialOrigin::KeyPath(PathBuf::from("/k.json")),
        };
        let result = GrpcTransport::dial("https://speech.googleapis.com", &credential, "t");
        match result {
            Err(TransportError::Dial(msg)) => assert!(msg.contains("invalid key material")),
            _ => panic!("expected Dial error"),
        }
    }

    #[tokio::test]
    async fn test_open_refused_endpoint_is_dial_error() {
        let transport = GrpcTransport::dial("http://127.0.0.1:1", &service_account(), "t").unwrap();
        let result = transport.open(Duration::from_secs(2)).await;
        match result {
            Err(TransportError::Dial(msg)) => assert!(msg.contains("127.0.0.1:1"), "{msg}"),
            Err(other) => panic!("expected Dial error, got {other}"),
            Ok(_) => panic!("open succeeded against a closed port"),
        }
        // Nothing was cached, so the next attempt dials again.
        assert!(transport.channel.get().is_none());
        assert!(matches!(
            transport.open(Duration::from_secs(2)).await,
            Err(TransportError::Dial(_))
        ));
    }

    #[tokio::test]
    async fn test_open_unroutable_endpoint_hits_deadline() {
        // TEST-NET-1 is never routed, so the connect hangs until the deadline.
        let transport = GrpcTransport::dial("http://192.0.2.1:443", &service_account(), "t").unwrap();
        let deadline = Duration::from_millis(200);
        let result = tokio::time::timeout(Duration::from_secs(5), transport.open(deadline))
            .await
            .expect("open ignored its deadline");
        // Hosts without a route fail fast instead.
        assert!(matches!(
            result,
            Err(TransportError::DialTimeout(_) | TransportError::Dial(_))
        ));
    }

    #[tokio::test]
    async fn test_half_closed_writer_rejects_send() {
        let (tx, _rx) = mpsc::channel(1);
        let mut writer = GrpcWriter { tx: Some(tx) };
        writer.half_close().await.unwrap();
        writer.half_close().await.unwrap();
        let result = writer.send(StreamingRecognizeRequest::audio(&[0, 0])).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_writer_send_fails_when_call_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut writer = GrpcWriter { tx: Some(tx) };
        let result = writer.send(StreamingRecognizeRequest::audio(&[0, 0])).await;
        assert!(matches!(result, Err(TransportError::Write(_))));
    }

    #[test]
    fn test_terminal_status_maps_tonic_codes() {
        let status = terminal_status(&tonic::Status::unauthenticated("bad token"));
        assert_eq!(status.code, StatusCode::Unauthenticated);
        assert_eq!(status.message, "bad token");
    }
}
