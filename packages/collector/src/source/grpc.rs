//! gRPC Feeds
//!
//! Provider-native server-streaming RPCs. The message types are declared with
//! `prost` derives instead of generated from `.proto` files since each provider
//! only needs one request and one reply shape.

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

use super::{Feed, SourceError, TxStream, CONNECT_TIMEOUT, KEEPALIVE_INTERVAL};

pub const CHAINBOUND_DEFAULT_ENDPOINT: &str = "https://beta.fiberapi.io:8080";

/// One provider's streaming RPC
pub trait GrpcProtocol: Send + Sync + 'static {
    type Request: prost::Message + Default + Send + Sync + 'static;
    type Reply: prost::Message + Default + Send + Sync + 'static;

    /// Fully qualified method path, e.g. `/gateway.Gateway/NewTxs`
    const PATH: &'static str;

    /// Metadata key carrying the credential
    const AUTH_METADATA: &'static str;

    fn request(auth: &str) -> Self::Request;

    /// Raw envelopes contained in one reply
    fn raw_transactions(reply: Self::Reply) -> Vec<Vec<u8>>;
}

// ==================== bloXroute ====================

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxsRequest {
    #[prost(string, tag = "1")]
    pub filters: String,
    #[prost(string, repeated, tag = "2")]
    pub includes: Vec<String>,
    #[prost(string, tag = "3")]
    pub auth_header: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxsReply {
    #[prost(message, repeated, tag = "1")]
    pub tx: Vec<BloxrouteTx>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BloxrouteTx {
    #[prost(bytes = "vec", tag = "1")]
    pub from: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub local_region: bool,
    #[prost(int64, tag = "3")]
    pub time: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub raw_tx: Vec<u8>,
}

/// bloXroute gateway `NewTxs` stream
pub struct Bloxroute;

impl GrpcProtocol for Bloxroute {
    type Request = TxsRequest;
    type Reply = TxsReply;

    const PATH: &'static str = "/gateway.Gateway/NewTxs";
    const AUTH_METADATA: &'static str = "authorization";

    fn request(auth: &str) -> TxsRequest {
        TxsRequest {
            filters: String::new(),
            includes: vec!["raw_tx".to_string()],
            auth_header: auth.to_string(),
        }
    }

    fn raw_transactions(reply: TxsReply) -> Vec<Vec<u8>> {
        reply.tx.into_iter().map(|tx| tx.raw_tx).collect()
    }
}

// ==================== Chainbound Fiber ====================

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxFilter {
    #[prost(bytes = "vec", tag = "1")]
    pub encoded: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TransactionWithSender {
    #[prost(bytes = "vec", tag = "1")]
    pub rlp_transaction: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub sender: Vec<u8>,
}

/// Fiber `SubscribeNewTxsV2` stream
pub struct Chainbound;

impl GrpcProtocol for Chainbound {
    type Request = TxFilter;
    type Reply = TransactionWithSender;

    const PATH: &'static str = "/api.API/SubscribeNewTxsV2";
    const AUTH_METADATA: &'static str = "x-api-key";

    fn request(_auth: &str) -> TxFilter {
        TxFilter::default()
    }

    fn raw_transactions(reply: TransactionWithSender) -> Vec<Vec<u8>> {
        vec![reply.rlp_transaction]
    }
}

// ==================== feed ====================

/// A server-streaming gRPC subscription for protocol `P`
pub struct GrpcFeed<P> {
    endpoint: String,
    auth: String,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: GrpcProtocol> GrpcFeed<P> {
    pub fn new(endpoint: impl Into<String>, auth: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth: auth.into(),
            _protocol: PhantomData,
        }
    }

    async fn channel(&self) -> Result<Channel, SourceError> {
        let mut endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| SourceError::InvalidEndpoint(format!("{}: {e}", self.endpoint)))?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true);

        if self.endpoint.starts_with("https://") {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .map_err(|e| SourceError::Connect(e.to_string()))?;
        }

        endpoint
            .connect()
            .await
            .map_err(|e| SourceError::Connect(e.to_string()))
    }
}

#[async_trait]
impl<P: GrpcProtocol> Feed for GrpcFeed<P> {
    async fn subscribe(&self) -> Result<TxStream, SourceError> {
        let channel = self.channel().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let mut request = tonic::Request::new(P::request(&self.auth));
        let auth: AsciiMetadataValue = self
            .auth
            .parse()
            .map_err(|_| SourceError::Connect("credential is not valid metadata".to_string()))?;
        request.metadata_mut().insert(P::AUTH_METADATA, auth);

        let codec = ProstCodec::<P::Request, P::Reply>::default();
        let response = grpc
            .server_streaming(request, PathAndQuery::from_static(P::PATH), codec)
            .await
            .map_err(map_status)?;
        debug!(endpoint = %self.endpoint, path = P::PATH, "grpc subscription active");

        let stream = response.into_inner().flat_map(|reply| {
            let items: Vec<Result<Vec<u8>, SourceError>> = match reply {
                Ok(reply) => P::raw_transactions(reply).into_iter().map(Ok).collect(),
                Err(status) => vec![Err(map_status(status))],
            };
            stream::iter(items)
        });

        Ok(Box::pin(stream))
    }
}

fn map_status(status: Status) -> SourceError {
    match status.code() {
        Code::Unauthenticated | Code::PermissionDenied => {
            SourceError::AuthRejected(status.message().to_string())
        }
        Code::Unavailable => SourceError::Transport(status.message().to_string()),
        Code::InvalidArgument | Code::Unimplemented => {
            SourceError::from_server_message(status.message().to_string())
        }
        _ => SourceError::Transport(format!("{:?}: {}", status.code(), status.message())),
    }
}
