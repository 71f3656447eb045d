//! HTTP API
//!
//! - GET  /health - Liveness plus in-memory bookkeeping sizes
//! - GET  /metrics - Prometheus metrics
//! - GET  /constants - Protocol constants clients need to build requests
//! - GET  /quote - Flat fee and current source-chain gas price
//! - GET  /limits/{user} - Remaining user and global headroom
//! - POST /transfers - Initiate a transfer
//! - GET  /transfers?user=&limit= - A user's transfers, newest first
//! - GET  /transfers/stream?user= - Server-sent record updates
//! - GET  /transfers/{id}
//! - POST /transfers/{id}/challenge - Watchers only, `Authorization: Bearer <token>`
//! - POST /transfers/{id}/finalize
//!
//! A successful challenge fails a completed transfer, so the route only
//! answers callers holding the configured challenge token. Without a token
//! configured it refuses every call. Finalize needs no credential: it can
//! only succeed once the challenge window has closed.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::coordinator::{FeeQuote, InitiateRequest, TransferConstants, TransferCoordinator};
use crate::error::TransferError;
use crate::limits::LimitHeadroom;
use crate::metrics;
use crate::types::{format_token_amount, normalize_address, parse_address, TransferRecord};

const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TransferCoordinator>,
    /// Bearer token accepted on the challenge route
    pub challenge_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(coordinator: Arc<TransferCoordinator>, challenge_token: Option<String>) -> Self {
        Self {
            coordinator,
            challenge_token: challenge_token.map(Arc::from),
        }
    }
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<String>,
}

pub enum ApiError {
    Transfer(TransferError),
    /// Missing or wrong challenge token
    Unauthorized,
    /// No challenge token configured
    ChallengesDisabled,
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        ApiError::Transfer(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Transfer(err) => err,
            ApiError::Unauthorized => {
                let body = ErrorBody {
                    error: "unauthorized".to_string(),
                    message: "a valid challenge token is required".to_string(),
                    scope: None,
                    remaining: None,
                };
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    Json(body),
                )
                    .into_response();
            }
            ApiError::ChallengesDisabled => {
                let body = ErrorBody {
                    error: "forbidden".to_string(),
                    message: "challenges are disabled on this coordinator".to_string(),
                    scope: None,
                    remaining: None,
                };
                return (StatusCode::FORBIDDEN, Json(body)).into_response();
            }
        };

        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let (scope, remaining) = match &err {
            TransferError::LimitExceeded { scope, remaining } => {
                (Some(scope.to_string()), Some(remaining.to_string()))
            }
            _ => (None, None),
        };
        if status.is_server_error() {
            warn!(kind = err.kind(), error = %err, "Request failed");
        }
        let body = ErrorBody {
            error: err.kind().to_string(),
            message: err.to_string(),
            scope,
            remaining,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tracked_senders: usize,
    limit_windows: usize,
    provisional_reservations: usize,
    reservations_taken: u64,
    record_locks: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let coordinator = &state.coordinator;
    let limits = coordinator.limits();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        tracked_senders: coordinator.tracked_senders(),
        limit_windows: limits.tracked_users(),
        provisional_reservations: limits.provisional_count(),
        reservations_taken: limits.reservation_count(),
        record_locks: coordinator.machine().tracked_locks(),
    })
}

async fn prometheus_metrics() -> Response {
    match Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(axum::body::Body::from(metrics::gather_text()))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn constants(State(state): State<AppState>) -> Json<TransferConstants> {
    Json(state.coordinator.constants())
}

async fn quote(State(state): State<AppState>) -> Result<Json<FeeQuote>, ApiError> {
    Ok(Json(state.coordinator.quote().await?))
}

/// Headroom in base units and human units
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadroomResponse {
    pub user: String,
    pub global: String,
    pub user_display: String,
    pub global_display: String,
}

impl HeadroomResponse {
    fn new(headroom: LimitHeadroom, decimals: u8) -> Self {
        Self {
            user: headroom.user.to_string(),
            global: headroom.global.to_string(),
            user_display: format_token_amount(headroom.user, decimals),
            global_display: format_token_amount(headroom.global, decimals),
        }
    }
}

async fn limits(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<HeadroomResponse>, ApiError> {
    let headroom = state.coordinator.headroom(&user)?;
    Ok(Json(HeadroomResponse::new(
        headroom,
        state.coordinator.settings().decimals,
    )))
}

async fn initiate(
    State(state): State<AppState>,
    Json(request): Json<InitiateRequest>,
) -> Result<(StatusCode, Json<TransferRecord>), ApiError> {
    let record = state.coordinator.initiate(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user: Option<String>,
    limit: Option<i64>,
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TransferRecord>>, ApiError> {
    let user = query
        .user
        .ok_or_else(|| TransferError::Validation("user query parameter is required".into()))?;
    let records = state
        .coordinator
        .list_for_user(&user, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(records))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TransferRecord>, ApiError> {
    Ok(Json(state.coordinator.get(id).await?))
}

#[derive(Debug, Deserialize)]
struct ChallengeRequest {
    reason: String,
}

fn token_matches(presented: &str, expected: &str) -> bool {
    // Length is not secret; contents are compared in constant time
    presented.len() == expected.len() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

fn authorize_challenge(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::ChallengesDisabled);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token_matches(token, expected) => Ok(()),
        _ => {
            warn!("Rejected challenge without a valid token");
            Err(ApiError::Unauthorized)
        }
    }
}

async fn challenge_transfer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<TransferRecord>, ApiError> {
    authorize_challenge(state.challenge_token.as_deref(), &headers)?;
    if request.reason.trim().is_empty() {
        return Err(TransferError::Validation("challenge reason cannot be empty".into()).into());
    }
    Ok(Json(state.coordinator.challenge(id, &request.reason).await?))
}

async fn finalize_transfer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TransferRecord>, ApiError> {
    Ok(Json(state.coordinator.finalize(id).await?))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    user: Option<String>,
}

async fn stream_transfers(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user = match query.user {
        Some(raw) => Some(normalize_address(&parse_address(&raw)?)),
        None => None,
    };
    let receiver = state.coordinator.machine().store().subscribe();

    let events = stream::unfold((receiver, user), |(mut receiver, user)| async move {
        loop {
            match receiver.recv().await {
                Ok(record) => {
                    if user.as_ref().is_some_and(|u| *u != record.user) {
                        continue;
                    }
                    let event = match Event::default().event("transfer").json_data(&record) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(id = record.id, error = %e, "Failed to encode transfer event");
                            continue;
                        }
                    };
                    return Some((Ok(event), (receiver, user)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transfer stream subscriber lagged");
                    let event = Event::default().event("lagged").data(skipped.to_string());
                    return Some((Ok(event), (receiver, user)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/constants", get(constants))
        .route("/quote", get(quote))
        .route("/limits/{user}", get(limits))
        .route("/transfers", post(initiate).get(list_transfers))
        .route("/transfers/stream", get(stream_transfers))
        .route("/transfers/{id}", get(get_transfer))
        .route("/transfers/{id}/challenge", post(challenge_transfer))
        .route("/transfers/{id}/finalize", post(finalize_transfer))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Bind and serve the API
pub async fn start_api_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    info!("  /transfers - Initiate and query transfers");
    info!("  /metrics   - Prometheus metrics");
    serve(listener, state, shutdown).await
}
