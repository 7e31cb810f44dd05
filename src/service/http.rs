//! HTTP front of the auction runtime
//!
//! Callers identify themselves with the `x-user-id` header; who that user
//! really is was checked by whatever sits in front of this server.
use super::{AuctionError, AuctionRuntime, ServiceControl};
use crate::auction::validator::Rejection;
use crate::auction::{Amount, RoomId, UserId};
use crate::event_log::{InMemoryEventLog, Offset};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub const USER_ID_HEADER: &str = "x-user-id";

const MAX_EVENTS_LIMIT: usize = 1000;
const MAX_EVENTS_WAIT_MS: u64 = 30_000;

#[derive(Clone)]
pub struct AppState {
    pub runtime: AuctionRuntime,
    pub events: Arc<InMemoryEventLog>,
}

/// The calling user, from [`USER_ID_HEADER`]
pub struct Caller(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_owned()))
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    /// Request body that doesn't deserialize into a valid bid
    InvalidBid(JsonRejection),
    Auction(AuctionError),
    Internal(anyhow::Error),
}

impl From<AuctionError> for ApiError {
    fn from(e: AuctionError) -> Self {
        ApiError::Auction(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::InvalidBid(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

pub fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::RoomNotFound => StatusCode::NOT_FOUND,
        Rejection::NotHost | Rejection::NotInRoom => StatusCode::FORBIDDEN,
        Rejection::ItemChanged | Rejection::AlreadyHighestBidder => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn failure(status: StatusCode, reason: &str, message: String) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "reason": reason,
            "message": message,
        })),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthenticated => failure(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                format!("missing {USER_ID_HEADER} header"),
            ),
            ApiError::InvalidBid(e) => {
                debug!(error = %e.body_text(), "malformed bid");
                failure(
                    StatusCode::BAD_REQUEST,
                    Rejection::InvalidAmount.code(),
                    "amount must be a positive whole number".to_owned(),
                )
            }
            ApiError::Auction(AuctionError::Rejected(rejection)) => failure(
                rejection_status(&rejection),
                rejection.code(),
                rejection.to_string(),
            ),
            ApiError::Auction(e @ AuctionError::BudgetConflict { .. }) => {
                failure(StatusCode::CONFLICT, "budget_conflict", e.to_string())
            }
            ApiError::Auction(e) => {
                error!(error = %e, "request failed");
                internal()
            }
            ApiError::Internal(e) => {
                error!(error = %e, "request failed");
                internal()
            }
        }
    }
}

fn internal() -> Response {
    failure(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal error, try again later".to_owned(),
    )
}

#[derive(Deserialize)]
pub struct BidRequest {
    pub amount: Amount,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub offset: Offset,
    pub limit: Option<usize>,
    pub wait_ms: Option<u64>,
}

async fn start_auction(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(room_id): Path<RoomId>,
) -> Result<Response, ApiError> {
    let started = state.runtime.start_auction(&user_id, &room_id).await?;
    Ok(Json(json!({ "success": true, "started": started })).into_response())
}

async fn place_bid(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(room_id): Path<RoomId>,
    body: Result<Json<BidRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    let accepted = state
        .runtime
        .place_bid(&user_id, &room_id, req.amount)
        .await?;
    Ok(Json(json!({ "success": true, "bid": accepted })).into_response())
}

async fn close_item(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(room_id): Path<RoomId>,
) -> Result<Response, ApiError> {
    let outcome = state
        .runtime
        .close_current_item(&user_id, &room_id)
        .await?;
    Ok(Json(json!({ "success": true, "closed": outcome })).into_response())
}

async fn get_auction(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<Response, ApiError> {
    Ok(match state.runtime.snapshot(&room_id).await {
        Some(snapshot) => Json(json!({ "success": true, "auction": snapshot })).into_response(),
        None => failure(
            StatusCode::NOT_FOUND,
            "no_live_auction",
            format!("no live auction in room {room_id}"),
        ),
    })
}

async fn get_events(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_EVENTS_LIMIT);
    let wait = Duration::from_millis(query.wait_ms.unwrap_or(0).min(MAX_EVENTS_WAIT_MS));
    let events = state
        .events
        .read_room(&room_id, query.offset, limit, Some(wait))
        .await?;
    Ok(Json(json!({ "success": true, "events": events })).into_response())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "draft auction" }))
        .route("/rooms/:room_id/start", post(start_auction))
        .route("/rooms/:room_id/bids", post(place_bid))
        .route("/rooms/:room_id/close", post(close_item))
        .route("/rooms/:room_id/auction", get(get_auction))
        .route("/rooms/:room_id/events", get(get_events))
        .with_state(state)
}

/// Serve until `control` stops everything
pub async fn run_http_server(
    addr: SocketAddr,
    state: AppState,
    control: ServiceControl,
) -> Result<()> {
    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(router(state).into_make_service());
    info!(%addr, "http server listening");

    server
        .with_graceful_shutdown(async move { control.stopped().await })
        .await
        .context("http server failed")?;

    info!("http server stopped");
    Ok(())
}
