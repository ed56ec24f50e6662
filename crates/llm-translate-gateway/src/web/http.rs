use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, Query, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::gateway::{HandlerError, Reply, RequestHandler};

const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

/// Why the HTTP server stopped accepting connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Requested,
    UpstreamExhausted,
}

#[derive(Clone)]
pub struct HttpState {
    pub handler: RequestHandler,
    shutdown: watch::Sender<Option<ShutdownReason>>,
}

impl HttpState {
    pub fn new(handler: RequestHandler) -> Self {
        let (shutdown, _) = watch::channel(None);
        Self { handler, shutdown }
    }

    /// Ask the server to stop; the first reason wins.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        record_reason(&self.shutdown, reason);
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.shutdown.subscribe()
    }
}

#[derive(Debug)]
pub struct HttpServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<Option<ShutdownReason>>,
    task: JoinHandle<()>,
}

impl HttpServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves once a shutdown has been requested, from any source.
    pub async fn stopping(&self) -> ShutdownReason {
        let mut rx = self.shutdown.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::Requested),
            Err(_) => ShutdownReason::Requested,
        }
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    pub async fn shutdown(self) -> ShutdownReason {
        record_reason(&self.shutdown, ShutdownReason::Requested);
        self.join().await
    }

    /// Wait for the server task to exit on its own.
    pub async fn join(self) -> ShutdownReason {
        if let Err(err) = self.task.await {
            error!("HTTP server task failed: {err}");
        }
        let reason = *self.shutdown.borrow();
        reason.unwrap_or(ShutdownReason::Requested)
    }
}

/// Query pairs in request order. A repeated `text` resolves to its first value.
type QueryPairs = Vec<(String, String)>;

fn first_text(pairs: &[(String, String)]) -> Option<&str> {
    pairs.iter().find(|(name, _)| name == "text").map(|(_, value)| value.as_str())
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    NoUsableKey,
    Upstream,
}

impl From<&HandlerError> for ApiError {
    fn from(err: &HandlerError) -> Self {
        match err {
            HandlerError::NoUsableKey => ApiError::NoUsableKey,
            HandlerError::Upstream { .. } | HandlerError::RetriesExhausted { .. } => {
                ApiError::Upstream
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "404 Not Found"),
            ApiError::NoUsableKey => {
                (StatusCode::INTERNAL_SERVER_ERROR, "API Key Error: Check Configuration.")
            }
            ApiError::Upstream => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Translation Error: Upstream Request Failed.")
            }
        };
        (status, [(header::CONTENT_TYPE, PLAIN_TEXT)], message).into_response()
    }
}

/// The in-flight limit is read from `max_threads` once, when the router is built;
/// later config reloads do not resize it.
pub fn build_router(state: HttpState) -> Router {
    let max_in_flight = state.handler.settings().max_threads.max(1);

    Router::new()
        .route("/", get(translate))
        .fallback(not_found)
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn spawn_http_server(state: HttpState, addr: SocketAddr) -> Result<HttpServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!("HTTP server listening on {}", local_addr);

    let shutdown = state.shutdown.clone();
    let mut stop = state.subscribe();
    let router = build_router(state);

    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(Option::is_some).await;
            });
        if let Err(err) = serve.await {
            error!("HTTP server terminated with error: {err}");
        }
        info!("HTTP server stopped");
    });

    Ok(HttpServerHandle { addr: local_addr, shutdown, task })
}

async fn translate(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<QueryPairs>,
) -> Response {
    let span = info_span!("translate", request_id = %Uuid::new_v4(), peer = %peer.ip());
    let outcome = state.handler.handle(peer.ip(), first_text(&query)).instrument(span).await;

    match outcome {
        Ok(Reply::Empty) => plain(String::new()),
        Ok(Reply::Translated(text)) => plain(text),
        Err(err) => {
            if err.is_fatal() {
                warn!(error = %err, "upstream retries exhausted, shutting down HTTP server");
                state.request_shutdown(ShutdownReason::UpstreamExhausted);
            }
            ApiError::from(&err).into_response()
        }
    }
}

async fn not_found(State(state): State<HttpState>, uri: Uri) -> Response {
    state.handler.log().warn(format!("Not found: {uri}"));
    ApiError::NotFound.into_response()
}

fn record_reason(shutdown: &watch::Sender<Option<ShutdownReason>>, reason: ShutdownReason) {
    shutdown.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}

fn plain(body: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, PLAIN_TEXT)], body).into_response()
}
