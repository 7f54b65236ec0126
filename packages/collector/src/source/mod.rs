//! Source Connectors
//!
//! Each configured upstream runs as one [`Connector`] task. The connector owns
//! the connection state machine (idle, connected, streaming, backoff) and
//! drives any [`Feed`], which only knows how to dial and subscribe to one
//! provider and turn its frames into raw transaction bytes.

pub mod backoff;
pub mod grpc;
pub mod ws;

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alias::SourceAliases;
use crate::codec::decode_raw;
use crate::observation::Observation;

pub use backoff::Backoff;

/// Connect plus subscribe must complete within this window
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive / ping interval for upstream connections
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Error strings that identify a rejected credential
pub const AUTH_REJECTED_MARKERS: &[&str] = &[
    "bad handshake",
    "unauthorized",
    "unauthenticated",
    "invalid authorization",
    "invalid api key",
];

/// Errors that can occur while talking to an upstream
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Subscription rejected: {0}")]
    SubscribeRejected(String),

    #[error("Authorization rejected: {0}")]
    AuthRejected(String),

    #[error("Connection closed by upstream: {0}")]
    Closed(String),

    #[error("Connect timeout after {0:?}")]
    Timeout(Duration),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl SourceError {
    /// Classify a server-provided error message, promoting known bad-auth
    /// responses to [`SourceError::AuthRejected`]
    pub fn from_server_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_auth_rejection(&message) {
            SourceError::AuthRejected(message)
        } else {
            SourceError::SubscribeRejected(message)
        }
    }

    /// Malformed messages are skipped without dropping the connection
    pub fn is_malformed(&self) -> bool {
        matches!(self, SourceError::Malformed(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::AuthRejected(_))
    }
}

/// Check an error string against the known bad-auth markers
pub fn is_auth_rejection(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    AUTH_REJECTED_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Stream of raw envelope bytes produced by a subscribed feed
pub type TxStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, SourceError>> + Send>>;

/// A provider-specific way to dial, subscribe, and frame transactions
#[async_trait]
pub trait Feed: Send + Sync {
    /// Open the upstream connection and perform the subscribe handshake
    async fn subscribe(&self) -> Result<TxStream, SourceError>;
}

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connected,
    Streaming,
    Backoff,
}

/// How a streaming session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Upstream closed the stream without an error
    Ended,
    /// Shutdown requested or the processor went away
    Shutdown,
}

/// Drives one feed forever: connect, stream, back off, repeat
pub struct Connector {
    tag: String,
    endpoint: String,
    feed: Box<dyn Feed>,
    backoff: Backoff,
    ingress: mpsc::Sender<Observation>,
    state: ConnectorState,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(
        tag: impl Into<String>,
        endpoint: impl Into<String>,
        feed: Box<dyn Feed>,
        ingress: mpsc::Sender<Observation>,
    ) -> Self {
        Self {
            tag: tag.into(),
            endpoint: endpoint.into(),
            feed,
            backoff: Backoff::default(),
            ingress,
            state: ConnectorState::Idle,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Replace the default backoff policy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    fn transition(&mut self, next: ConnectorState) {
        if self.state != next {
            debug!(source = %self.tag, from = ?self.state, to = ?next, "connector state");
            self.state = next;
        }
    }

    /// Run until the token is cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(source = %self.tag, endpoint = %self.endpoint, "starting connector");

        loop {
            self.transition(ConnectorState::Idle);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                res = timeout(self.connect_timeout, self.feed.subscribe()) => res,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    self.transition(ConnectorState::Connected);
                    self.backoff.reset();
                    info!(source = %self.tag, "subscribed");

                    self.transition(ConnectorState::Streaming);
                    match self.stream(stream, &cancel).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Ended) => {
                            warn!(source = %self.tag, "upstream stream ended");
                        }
                        Err(e) => self.report(&e),
                    }
                }
                Ok(Err(e)) => self.report(&e),
                Err(_) => self.report(&SourceError::Timeout(self.connect_timeout)),
            }

            self.transition(ConnectorState::Backoff);
            let delay = self.backoff.next_delay();
            warn!(
                source = %self.tag,
                attempt = self.backoff.attempts(),
                delay = ?delay,
                "reconnecting after backoff"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(source = %self.tag, "connector stopped");
    }

    async fn stream(
        &mut self,
        mut stream: TxStream,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SourceError> {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
                item = stream.next() => item,
            };

            let raw = match item {
                None => return Ok(SessionEnd::Ended),
                Some(Ok(raw)) => raw,
                Some(Err(e)) if e.is_malformed() => {
                    error!(source = %self.tag, error = %e, "skipping malformed message");
                    continue;
                }
                Some(Err(e)) => return Err(e),
            };

            let tx = match decode_raw(&raw) {
                Ok(tx) => tx,
                Err(e) => {
                    error!(source = %self.tag, error = %e, "failed to decode transaction");
                    continue;
                }
            };

            let observation = Observation::now(self.tag.clone(), tx);
            if self.ingress.send(observation).await.is_err() {
                debug!(source = %self.tag, "ingress closed");
                return Ok(SessionEnd::Shutdown);
            }
        }
    }

    fn report(&self, err: &SourceError) {
        if err.is_auth() {
            error!(source = %self.tag, error = %err, "upstream rejected credentials");
        } else {
            warn!(source = %self.tag, error = %err, "upstream error");
        }
    }
}

/// Upstream provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Node,
    Bloxroute,
    Eden,
    Chainbound,
    Merkle,
}

impl SourceKind {
    /// Default source tag for the provider
    pub fn tag(&self) -> &'static str {
        match self {
            SourceKind::Node => "local",
            SourceKind::Bloxroute => "blx",
            SourceKind::Eden => "eden",
            SourceKind::Chainbound => "chainbound",
            SourceKind::Merkle => "merkle",
        }
    }

    /// Endpoint used when none is configured
    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            SourceKind::Node => None,
            SourceKind::Bloxroute => Some(ws::BLOXROUTE_DEFAULT_ENDPOINT),
            SourceKind::Eden => Some(ws::EDEN_DEFAULT_ENDPOINT),
            SourceKind::Chainbound => Some(grpc::CHAINBOUND_DEFAULT_ENDPOINT),
            SourceKind::Merkle => Some(ws::MERKLE_DEFAULT_ENDPOINT),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One configured upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub endpoint: String,
    pub auth: Option<String>,
    pub tag: String,
}

impl SourceSpec {
    /// Build a spec, falling back to the provider default endpoint and
    /// resolving the tag through the alias map
    pub fn new(
        kind: SourceKind,
        endpoint: Option<String>,
        auth: Option<String>,
        aliases: &SourceAliases,
    ) -> Result<Self, SourceError> {
        let endpoint = endpoint
            .or_else(|| kind.default_endpoint().map(str::to_string))
            .filter(|e| !e.is_empty())
            .ok_or_else(|| SourceError::InvalidEndpoint(format!("{kind} requires an endpoint")))?;

        // Node sources are told apart by URL unless aliased
        let default_tag = match kind {
            SourceKind::Node => endpoint.as_str(),
            other => other.tag(),
        };
        let tag = aliases.tag_for(&endpoint, default_tag);

        Ok(Self {
            kind,
            endpoint,
            auth,
            tag,
        })
    }

    fn is_websocket(&self) -> bool {
        self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")
    }

    /// Select the feed implementation for this upstream
    pub fn feed(&self) -> Result<Box<dyn Feed>, SourceError> {
        let auth = self.auth.clone().unwrap_or_default();
        let feed: Box<dyn Feed> = match self.kind {
            SourceKind::Node if self.endpoint.contains("alchemy") => {
                Box::new(ws::WsFeed::alchemy(&self.endpoint))
            }
            SourceKind::Node => Box::new(ws::WsFeed::node(&self.endpoint)),
            SourceKind::Bloxroute if self.is_websocket() => {
                Box::new(ws::WsFeed::bloxroute(&self.endpoint, auth))
            }
            SourceKind::Bloxroute => Box::new(grpc::GrpcFeed::<grpc::Bloxroute>::new(&self.endpoint, auth)),
            SourceKind::Eden => Box::new(ws::WsFeed::eden(&self.endpoint, auth)),
            SourceKind::Chainbound => {
                Box::new(grpc::GrpcFeed::<grpc::Chainbound>::new(&self.endpoint, auth))
            }
            SourceKind::Merkle => Box::new(ws::WsFeed::merkle(&self.endpoint, auth)),
        };
        Ok(feed)
    }

    /// Build the connector task for this upstream
    pub fn connector(&self, ingress: mpsc::Sender<Observation>) -> Result<Connector, SourceError> {
        Ok(Connector::new(&self.tag, &self.endpoint, self.feed()?, ingress))
    }
}
