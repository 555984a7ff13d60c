//! `tonic` based transport implementation.
//!
//! The bulk-watch protocol is carried as one bidirectional gRPC method whose
//! messages are raw frames. A pass-through `BytesCodec` leaves framing to
//! gRPC and encoding to the [codec](crate::codec) layer, so the same method
//! serves both JSON and protobuf clients.

use crate::auth::{Authorizer, UserInfo};
use crate::codec::{BulkCodec, Encoding};
use crate::error::{Error, Result};
use crate::message::{BulkRequest, BulkResponse};
use crate::registry::Registry;
use crate::session::{Session, SessionConfig};
use crate::status::Status;
use crate::transport::{FrameSink, FrameSource};
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::{empty_body, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::server::{NamedService, StreamingService};
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, warn};

/// Fully qualified gRPC service name.
pub const SERVICE_NAME: &str = "bulkwatch.v1.BulkWatch";

/// Request metadata key selecting the frame encoding (`json` or `proto`).
pub const ENCODING_METADATA: &str = "bulkwatch-encoding";

const CONNECT_PATH: &str = "/bulkwatch.v1.BulkWatch/Connect";

const CHANNEL_BUFFER_SIZE: usize = 16;

/// A codec that passes bytes through without serialization.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = tonic::Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = tonic::Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

impl FrameSource for Streaming<Bytes> {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.message().await.map_err(Error::transport)
    }
}

impl FrameSink for mpsc::Sender<std::result::Result<Bytes, tonic::Status>> {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        mpsc::Sender::send(self, Ok(frame))
            .await
            .map_err(|_| Error::StreamClosed)
    }
}

impl From<Status> for tonic::Status {
    fn from(status: Status) -> Self {
        tonic::Status::new(
            tonic::Code::from_i32(status.code().into()),
            status.message(),
        )
    }
}

/// A tower service exposing bulk-watch sessions over gRPC.
///
/// Every call of the `Connect` method becomes one [`Session`]. The caller
/// is read from a [`UserInfo`] request extension, which an interceptor can
/// insert after authenticating the peer; without one the caller is
/// anonymous.
///
/// ```no_run
/// # use bulkwatch::{AlwaysAllow, BulkWatchServer, Registry};
/// # use std::sync::Arc;
/// # async fn serve(registry: Registry) -> Result<(), Box<dyn std::error::Error>> {
/// let service = BulkWatchServer::new(Arc::new(registry), Arc::new(AlwaysAllow));
///
/// tonic::transport::Server::builder()
///     .add_service(service)
///     .serve("127.0.0.1:50051".parse()?)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BulkWatchServer {
    registry: Arc<Registry>,
    authorizer: Arc<dyn Authorizer>,
    config: SessionConfig,
    default_encoding: Encoding,
}

impl BulkWatchServer {
    /// Serve watches from `registry`, authorized by `authorizer`.
    pub fn new(registry: Arc<Registry>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            registry,
            authorizer,
            config: SessionConfig::default(),
            default_encoding: Encoding::default(),
        }
    }

    /// Configure every session.
    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// The encoding used when a client does not ask for one.
    #[must_use]
    pub fn default_encoding(mut self, encoding: Encoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    async fn connect(
        &self,
        request: tonic::Request<Streaming<Bytes>>,
    ) -> std::result::Result<
        tonic::Response<ReceiverStream<std::result::Result<Bytes, tonic::Status>>>,
        tonic::Status,
    > {
        let encoding = match request.metadata().get(ENCODING_METADATA) {
            None => self.default_encoding,
            Some(value) => value
                .to_str()
                .map_err(|_| tonic::Status::invalid_argument("encoding is not valid ASCII"))?
                .parse::<Encoding>()?,
        };

        let user = request
            .extensions()
            .get::<UserInfo>()
            .cloned()
            .unwrap_or_else(UserInfo::anonymous);

        debug!(user = %user.name, %encoding, "accepted bulk-watch connection");

        let session = Session::new(
            self.registry.clone(),
            self.authorizer.clone(),
            user,
            encoding.codec(),
            self.config.clone(),
        );

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let trailer = tx.clone();
        let source = request.into_inner();

        tokio::spawn(async move {
            if let Err(err) = session.run(source, tx).await {
                // The client may already be gone.
                let _ = trailer.send(Err(Status::from(err).into())).await;
            }
        });

        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }
}

impl std::fmt::Debug for BulkWatchServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkWatchServer")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("default_encoding", &self.default_encoding)
            .finish()
    }
}

impl<B> Service<http::Request<B>> for BulkWatchServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            CONNECT_PATH => {
                struct ConnectSvc(BulkWatchServer);

                impl StreamingService<Bytes> for ConnectSvc {
                    type Response = Bytes;
                    type ResponseStream = ReceiverStream<std::result::Result<Bytes, tonic::Status>>;
                    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

                    fn call(&mut self, request: tonic::Request<Streaming<Bytes>>) -> Self::Future {
                        let server = self.0.clone();
                        Box::pin(async move { server.connect(request).await })
                    }
                }

                let method = ConnectSvc(self.clone());
                Box::pin(async move {
                    let mut grpc = tonic::server::Grpc::new(BytesCodec);
                    Ok(grpc.streaming(method, req).await)
                })
            }
            path => {
                warn!(path, "unknown bulk-watch method");
                Box::pin(async move {
                    let mut response = http::Response::new(empty_body());
                    let headers = response.headers_mut();
                    headers.insert(
                        http::header::HeaderName::from_static("grpc-status"),
                        http::HeaderValue::from_static("12"),
                    );
                    headers.insert(
                        http::header::CONTENT_TYPE,
                        http::HeaderValue::from_static("application/grpc"),
                    );
                    Ok(response)
                })
            }
        }
    }
}

impl NamedService for BulkWatchServer {
    const NAME: &'static str = SERVICE_NAME;
}

/// A client for the bulk-watch gRPC service.
#[derive(Clone, Debug)]
pub struct BulkWatchClient {
    channel: Channel,
    encoding: Encoding,
    metadata: MetadataMap,
}

impl BulkWatchClient {
    /// Create a client from an existing tonic [`Channel`].
    pub fn from_channel(channel: Channel, encoding: Encoding) -> Self {
        Self {
            channel,
            encoding,
            metadata: MetadataMap::new(),
        }
    }

    /// Metadata sent when opening every connection, e.g. credentials.
    ///
    /// An encoding set here is sent unchanged.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Connect to a server with default channel settings.
    pub async fn connect(uri: impl Into<String>, encoding: Encoding) -> Result<Self> {
        let uri: String = uri.into();
        let channel = Channel::from_shared(uri)
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Self::from_channel(channel, encoding))
    }

    /// Open a new bulk-watch connection.
    pub async fn open(&self) -> Result<BulkWatchStream> {
        let mut grpc = Grpc::new(self.channel.clone());

        grpc.ready()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_BUFFER_SIZE);

        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        *request.metadata_mut() = self.metadata.clone();
        if !request.metadata().contains_key(ENCODING_METADATA) {
            request.metadata_mut().insert(
                ENCODING_METADATA,
                MetadataValue::from_static(self.encoding.as_str()),
            );
        }

        let path = PathAndQuery::from_static(CONNECT_PATH);

        let response = grpc
            .streaming(request, path, BytesCodec)
            .await
            .map_err(Error::transport)?;

        Ok(BulkWatchStream {
            codec: self.encoding.codec(),
            sender: tx,
            receiver: response.into_inner(),
        })
    }
}

/// One open bulk-watch connection.
pub struct BulkWatchStream {
    codec: Arc<dyn BulkCodec>,
    sender: mpsc::Sender<Bytes>,
    receiver: Streaming<Bytes>,
}

impl BulkWatchStream {
    /// Send a request.
    pub async fn send(&mut self, request: &BulkRequest) -> Result<()> {
        let frame = self.codec.encode_request(request)?;
        self.send_frame(frame).await
    }

    /// Send an already encoded frame.
    pub async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| Error::StreamClosed)
    }

    /// Receive the next response. `None` means the server closed the stream.
    pub async fn message(&mut self) -> Result<Option<BulkResponse>> {
        match self.receiver.message().await.map_err(Error::transport)? {
            Some(frame) => self.codec.decode_response(frame).map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for BulkWatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkWatchStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn status_maps_to_tonic() {
        let status: tonic::Status = Status::not_found("unsupported resource").into();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "unsupported resource");

        let status: tonic::Status = Status::from(Error::StreamClosed).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(Code::Unavailable as i32, status.code() as i32);
    }
}
