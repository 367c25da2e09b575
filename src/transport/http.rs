//! REST and WebSocket surface over an [`Exchange`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::conflict::{ConflictId, ConflictRecord, ConflictStatus, ResolutionStrategy};
use crate::engine::{Exchange, HealthReport};
use crate::error::{ExchangeError, ValidationError};
use crate::hub::{ClientMessage, NotificationEvent, NotificationHub, Subscription};
use crate::knowledge::{KnowledgeId, KnowledgeItem, KnowledgeType, NewKnowledge, Urgency};
use crate::query::QueryFilter;
use crate::worker_state::WorkerKnowledgeState;

/// Header naming the worker a query is issued for (keys the query cache).
pub const WORKER_HEADER: &str = "x-worker-id";

/// Default page size for `GET /conflicts`.
const DEFAULT_CONFLICT_LIMIT: usize = 100;

/// How long the socket bridge waits on the subscription before re-checking the socket.
const BRIDGE_POLL: Duration = Duration::from_millis(100);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    exchange: Arc<Exchange>,
}

impl AppState {
    /// Wraps a running exchange.
    #[must_use]
    pub fn new(exchange: Arc<Exchange>) -> Self {
        Self { exchange }
    }
}

/// HTTP-facing error.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid input.
    #[error("{0}")]
    BadRequest(String),

    /// Unknown record.
    #[error("{0}")]
    NotFound(String),

    /// Transient backend condition.
    #[error("{0}")]
    Unavailable(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl From<ExchangeError> for ApiError {
    fn from(e: ExchangeError) -> Self {
        if e.is_validation() {
            Self::BadRequest(e.to_string())
        } else if e.is_not_found() {
            Self::NotFound(e.to_string())
        } else if e.is_retryable() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::from(ExchangeError::from(e))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Builds the router.
pub fn router(exchange: Arc<Exchange>) -> Router {
    Router::new()
        .route("/knowledge", post(publish).get(query_knowledge))
        .route("/knowledge/fresh", get(fresh_knowledge))
        .route("/knowledge/:id", get(get_knowledge))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/:id", get(get_conflict))
        .route("/conflicts/:id/resolve", post(resolve_conflict))
        .route("/stats/:worker_id", get(worker_stats))
        .route("/health", get(health))
        .route("/ws/:worker_id/:connection_id", get(subscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(exchange))
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(exchange: Arc<Exchange>, listen_addr: &str, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "exchange listening");
    axum::serve(listener, router(exchange))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

fn requesting_worker(headers: &HeaderMap) -> Option<String> {
    headers
        .get(WORKER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    producer_id: Option<String>,
    #[serde(rename = "type")]
    knowledge_type: Option<String>,
    payload: Option<Value>,
    urgency: Option<String>,
    priority: Option<i32>,
}

impl PublishRequest {
    fn into_new_knowledge(self) -> Result<NewKnowledge, ValidationError> {
        let missing = |field: &str| ValidationError::MissingField {
            field: field.to_string(),
        };
        let knowledge_type: KnowledgeType = self.knowledge_type.ok_or_else(|| missing("type"))?.parse()?;
        let mut new = NewKnowledge::new(
            self.producer_id.unwrap_or_default(),
            knowledge_type,
            self.payload.ok_or_else(|| missing("payload"))?,
        );
        if let Some(urgency) = self.urgency {
            new = new.urgency(urgency.parse::<Urgency>()?);
        }
        if let Some(priority) = self.priority {
            new = new.priority(priority);
        }
        Ok(new)
    }
}

async fn publish(
    State(state): State<AppState>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(request) = body?;
    let id = state.exchange.publish(request.into_new_knowledge()?)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KnowledgeQuery {
    types: Option<String>,
    min_freshness: Option<f64>,
    urgency: Option<String>,
    source_worker: Option<String>,
    limit: Option<usize>,
    include_inactive: Option<bool>,
}

impl KnowledgeQuery {
    fn into_filter(self) -> Result<QueryFilter, ValidationError> {
        let mut filter = QueryFilter::new();
        if let Some(types) = self.types {
            for t in types.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                filter = filter.with_type(t.parse()?);
            }
        }
        if let Some(urgency) = self.urgency {
            filter = filter.urgency(urgency.parse()?);
        }
        filter.min_freshness = self.min_freshness;
        filter.source_worker = self.source_worker.filter(|s| !s.trim().is_empty());
        filter.limit = self.limit;
        filter.include_inactive = self.include_inactive.unwrap_or(false);
        filter.validate()?;
        Ok(filter)
    }
}

async fn query_knowledge(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<KnowledgeQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<KnowledgeItem>>> {
    let Query(query) = query?;
    let filter = query.into_filter()?;
    let worker = requesting_worker(&headers);
    let items = blocking(&state, move |ex| ex.query(worker.as_deref(), &filter)).await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FreshQuery {
    min_freshness: Option<f64>,
    limit: Option<usize>,
}

async fn fresh_knowledge(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<FreshQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<KnowledgeItem>>> {
    let Query(query) = query?;
    let min = query.min_freshness.ok_or_else(|| ValidationError::MissingField {
        field: "minFreshness".to_string(),
    })?;
    let worker = requesting_worker(&headers);
    let limit = query.limit;
    let items = blocking(&state, move |ex| ex.fresh(worker.as_deref(), min, limit)).await?;
    Ok(Json(items))
}

async fn get_knowledge(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<KnowledgeItem>> {
    let id: KnowledgeId = id.parse()?;
    Ok(Json(blocking(&state, move |ex| ex.get_item(id)).await?))
}

#[derive(Debug, Deserialize)]
struct ConflictQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    query: Result<Query<ConflictQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ConflictRecord>>> {
    let Query(query) = query?;
    let status = query.status.map(|s| s.parse::<ConflictStatus>()).transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_CONFLICT_LIMIT);
    Ok(Json(blocking(&state, move |ex| ex.conflicts(status, limit)).await?))
}

async fn get_conflict(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ConflictRecord>> {
    let id: ConflictId = id.parse()?;
    Ok(Json(blocking(&state, move |ex| ex.conflict(id)).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ResolveRequest {
    strategy: Option<String>,
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<Json<ConflictRecord>> {
    let id: ConflictId = id.parse()?;
    let strategy = body
        .and_then(|Json(b)| b.strategy)
        .map(|s| s.parse::<ResolutionStrategy>())
        .transpose()?;

    // Resolution may wait on an in-flight attempt or retry the store.
    Ok(Json(blocking(&state, move |ex| ex.resolve(id, strategy)).await?))
}

async fn worker_stats(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<WorkerKnowledgeState>> {
    let id = worker_id.clone();
    blocking(&state, move |ex| ex.worker_stats(&id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown worker: {worker_id}")))
}

/// Runs a store-backed exchange call off the async workers.
async fn blocking<T, E, F>(state: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&Exchange) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    let exchange = Arc::clone(&state.exchange);
    tokio::task::spawn_blocking(move || f(&exchange))
        .await
        .map_err(|e| ApiError::Internal(format!("exchange task failed: {e}")))?
        .map_err(Into::into)
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.exchange.health())
}

async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((worker_id, connection_id)): Path<(String, String)>,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, state.exchange, worker_id, connection_id))
}

/// Pumps hub events to the socket and client heartbeats to the hub.
async fn run_socket(socket: WebSocket, exchange: Arc<Exchange>, worker_id: String, connection_id: String) {
    let subscription = match exchange.connect(&worker_id, &connection_id) {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(worker_id = %worker_id, error = %e, "connection refused");
            return;
        }
    };
    tracing::info!(worker_id = %worker_id, connection_id = %connection_id, "worker connected");

    // The subscription is blocking; a dedicated thread moves its events onto an
    // async channel. Capacity 1 keeps undelivered events in the hub.
    let (event_tx, mut event_rx) = mpsc::channel::<NotificationEvent>(1);
    let hub = Arc::clone(exchange.hub());
    let bridge = {
        let hub = Arc::clone(&hub);
        tokio::task::spawn_blocking(move || pump_events(subscription, &event_tx, &hub))
    };

    let (mut sink, mut stream) = socket.split();

    let reader = async {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Heartbeat) => {
                        if let Err(e) = hub.heartbeat(&worker_id, &connection_id) {
                            tracing::debug!(worker_id = %worker_id, error = %e, "heartbeat rejected");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(worker_id = %worker_id, error = %e, "ignoring client message");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    let unsent = tokio::select! {
        unsent = write_events(&mut sink, &mut event_rx) => unsent,
        () = reader => None,
    };
    let _ = sink.close().await;

    reclaim_events(&hub, &worker_id, event_rx, bridge, unsent).await;
    tracing::info!(worker_id = %worker_id, connection_id = %connection_id, "worker disconnected");
}

/// Moves events from the blocking subscription onto `tx` until the async side
/// goes away or the hub drops the connection.
fn pump_events(subscription: Subscription, tx: &mpsc::Sender<NotificationEvent>, hub: &NotificationHub) {
    loop {
        if tx.is_closed() {
            break;
        }
        match subscription.recv_timeout(BRIDGE_POLL) {
            Ok(Some(event)) => {
                if let Err(mpsc::error::SendError(event)) = tx.blocking_send(event) {
                    let worker_id = subscription.worker_id().to_string();
                    // Disconnect first so the backlog queues behind this event.
                    drop(subscription);
                    hub.requeue(&worker_id, vec![event]);
                    return;
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }
}

/// Writes events to the socket. Returns the event that failed to go out.
async fn write_events<S>(sink: &mut S, rx: &mut mpsc::Receiver<NotificationEvent>) -> Option<NotificationEvent>
where
    S: Sink<Message> + Unpin,
{
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode event");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            return Some(event);
        }
    }
    None
}

/// Stops the bridge and gives the hub back every event that was pulled for
/// this socket but never written to it.
async fn reclaim_events(
    hub: &NotificationHub,
    worker_id: &str,
    mut rx: mpsc::Receiver<NotificationEvent>,
    bridge: JoinHandle<()>,
    unsent: Option<NotificationEvent>,
) {
    rx.close();
    let mut undelivered: Vec<NotificationEvent> = unsent.into_iter().collect();
    while let Some(event) = rx.recv().await {
        undelivered.push(event);
    }
    if let Err(e) = bridge.await {
        tracing::warn!(worker_id = %worker_id, error = %e, "event bridge failed");
    }
    hub.requeue(worker_id, undelivered);
}
