use std::sync::Arc;

use axum::{
    async_trait,
    extract::{Extension, FromRequest, RequestParts},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::error;

use crate::provider::{self, truelayer};
use crate::store::{self, SqliteStore};
use crate::sync::{Engine, RefreshWindow, SyncError};

/// Shared request context. The store is behind a mutex: one logical
/// operation per invocation, with cross-request correctness carried by the
/// database uniqueness invariants rather than in-memory state.
pub struct Context {
    pub store: Mutex<SqliteStore>,
    pub engine: Engine<truelayer::Client>,
}

pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/exchange-token", post(exchange_token))
        .route("/sync", post(run_sync))
        .route("/accounts/pending-categorization", get(pending_categorization))
        .layer(Extension(ctx))
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing x-user-id header")]
    Unauthenticated,
    #[error("authorization code is invalid or already used")]
    InvalidCode,
    #[error("bank connection is no longer valid, reconnect your bank")]
    Reconnect,
    #[error("no bank connection found for this user")]
    UnknownConnection,
    #[error("the bank provider is temporarily unavailable, try again shortly")]
    Unavailable,
    #[error("rate limited, retry in {0}s")]
    RateLimited(u64),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::InvalidCode => StatusCode::CONFLICT,
            ApiError::Reconnect => StatusCode::CONFLICT,
            ApiError::UnknownConnection => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::BAD_GATEWAY,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(source) => {
                error!(error = ?source, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Provider(provider::Error::InvalidOrExpiredCode) => ApiError::InvalidCode,
            SyncError::Provider(provider::Error::TokenInvalid) => ApiError::Reconnect,
            SyncError::Provider(provider::Error::Unavailable(_)) => ApiError::Unavailable,
            SyncError::Provider(provider::Error::RateLimited { reset_in }) => {
                ApiError::RateLimited(reset_in.as_secs())
            }
            SyncError::Store(e) => ApiError::Internal(e.into()),
        }
    }
}

impl From<store::Error> for ApiError {
    fn from(err: store::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

/// Caller identity. Authentication itself lives at the edge; handlers only
/// require the resolved user id header.
pub struct UserId(pub String);

#[async_trait]
impl<B> FromRequest<B> for UserId
where
    B: Send,
{
    type Rejection = ApiError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        req.headers()
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    code: String,
}

#[derive(Debug, Serialize)]
struct ExchangeResponse {
    access_token: String,
    connection_id: String,
}

async fn exchange_token(
    user: UserId,
    Extension(ctx): Extension<Arc<Context>>,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    let mut store = ctx.store.lock().await;
    let connection = ctx
        .engine
        .exchange_token(&mut store, &user.0, &request.code)
        .await?;

    Ok(Json(ExchangeResponse {
        access_token: connection.access_token,
        connection_id: connection.provider_connection_id,
    }))
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    #[allow(dead_code)]
    access_token: String,
    connection_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    accounts_synced: usize,
    transactions_ingested: usize,
    errors: Vec<String>,
}

async fn run_sync(
    user: UserId,
    Extension(ctx): Extension<Arc<Context>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let mut store = ctx.store.lock().await;

    // The stored row is the source of truth for tokens; a stale token in
    // the request body is ignored.
    let connection = store
        .connections()
        .by_provider_id(&user.0, &request.connection_id)
        .await?
        .ok_or(ApiError::UnknownConnection)?;

    let window = if request.force {
        RefreshWindow::Full
    } else {
        RefreshWindow::Incremental
    };
    let report = ctx.engine.sync(&mut store, &connection, window).await?;

    Ok(Json(SyncResponse {
        accounts_synced: report.accounts_synced,
        transactions_ingested: report.transactions_ingested,
        errors: report.errors,
    }))
}

#[derive(Debug, Serialize)]
struct PendingEntry {
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(rename = "pendingCount")]
    pending_count: i64,
}

#[derive(Debug, Serialize)]
struct PendingResponse {
    pending: Vec<PendingEntry>,
}

async fn pending_categorization(
    user: UserId,
    Extension(ctx): Extension<Arc<Context>>,
) -> Result<Json<PendingResponse>, ApiError> {
    let mut store = ctx.store.lock().await;
    let counts = store.txns().pending_counts(&user.0).await?;

    Ok(Json(PendingResponse {
        pending: counts
            .into_iter()
            .map(|count| PendingEntry {
                account_id: count.account_id,
                pending_count: count.pending,
            })
            .collect(),
    }))
}
