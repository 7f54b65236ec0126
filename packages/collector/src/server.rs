//! HTTP Server
//!
//! Serves the live transaction stream over server-sent events plus health and
//! metrics endpoints.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{stream, Stream, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::metrics::{Metrics, PrometheusError};
use crate::sse::SubscriberHub;

/// Default timeout for non-streaming routes
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on graceful shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors raised by the HTTP server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] PrometheusError),

    #[error("Server task failed: {0}")]
    Join(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        error!(error = %self, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
    }
}

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SubscriberHub>,
    pub metrics: Metrics,
    /// Root token; open SSE streams end when it is cancelled
    pub cancel: CancellationToken,
}

/// Build the application router
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let probes = Router::new()
        .route("/livez", get(ok))
        .route("/readyz", get(ok))
        .route("/metrics", get(metrics))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/sse/transactions", get(sse_transactions))
        .merge(probes)
        .fallback(handler_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ok() -> &'static str {
    "ok"
}

async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ServerError> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, state.metrics.content_type())], body).into_response())
}

async fn sse_transactions(State(state): State<AppState>) -> impl IntoResponse {
    let events = subscriber_stream(state.hub.clone(), state.cancel.clone());

    (
        [
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Sse::new(events),
    )
}

/// Unregisters its subscriber when the response body is dropped
struct SubscriberGuard {
    hub: Arc<SubscriberHub>,
    id: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.hub.unregister(&self.id);
    }
}

/// Register a subscriber and turn its outbox into an event stream
fn subscriber_stream(
    hub: Arc<SubscriberHub>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let (id, outbox) = hub.register();
    let guard = SubscriberGuard { hub, id };

    stream::unfold((outbox, guard), |(mut outbox, guard)| async move {
        let raw_hex = outbox.recv().await?;
        Some((Ok(Event::default().data(raw_hex)), (outbox, guard)))
    })
    .take_until(cancel.cancelled_owned())
}

/// A running server task
pub struct ServerHandle {
    addr: SocketAddr,
    task: JoinHandle<Result<(), ServerError>>,
}

/// Bind the listen address
pub async fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<TcpListener, ServerError> {
    let display = addr.to_string();
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: display,
        source,
    })
}

/// Start serving `router` on `listener` until `cancel` fires
pub fn spawn(listener: TcpListener, router: Router, cancel: CancellationToken) -> Result<ServerHandle, ServerError> {
    let addr = listener.local_addr()?;

    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(ServerError::Serve)
    });
    info!(%addr, "http server listening");

    Ok(ServerHandle { addr, task })
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for graceful shutdown to finish, aborting the server after `grace`
    ///
    /// Call after the token passed to [`spawn`] has been cancelled.
    pub async fn shutdown(self, grace: Duration) -> Result<(), ServerError> {
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ServerError::Join(e.to_string())),
            Err(_) => {
                warn!(?grace, "graceful shutdown timed out, aborting server");
                task.abort();
                Ok(())
            }
        }
    }
}
