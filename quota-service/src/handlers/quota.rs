//! Usage quota handlers.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use service_core::middleware::client_ip;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    BonusGrant, ConsumeRequest, CreateBonusGrant, Metric, QuotaAuditEntry, RefundResult,
    UsageView,
};
use crate::startup::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const MAX_AUDIT_LIMIT: usize = 500;

// ============================================================================
// Request Types
// ============================================================================

/// The caller IP is never read from the body: the rate limiter keys on the
/// connection (or `X-Forwarded-For`) address only.
#[derive(Debug, Deserialize, Validate)]
pub struct ConsumeBody {
    pub user_id: Uuid,
    pub metric: Metric,
    #[validate(range(min = 1, message = "amount must be a positive integer"))]
    pub amount: i64,
    #[serde(default)]
    #[validate(length(max = 255, message = "idempotency_key is limited to 255 characters"))]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundBody {
    pub user_id: Uuid,
    #[serde(default = "default_refund_metric")]
    pub metric: Metric,
    #[serde(default)]
    #[validate(length(max = 255, message = "project_id is limited to 255 characters"))]
    pub project_id: Option<String>,
}

fn default_refund_metric() -> Metric {
    Metric::Projects
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    50
}

fn parse_metric(raw: &str) -> Result<Metric, AppError> {
    raw.parse::<Metric>()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))
}

// ============================================================================
// Handlers
// ============================================================================

/// Check a metered request against the user's quota and debit it.
///
/// POST /v1/quota/consume
///
/// Rate-limited requests get 429 with `Retry-After`; every other decision,
/// including denials, is a 200 carrying `allowed` and `reason`.
#[tracing::instrument(skip(state, headers, body), fields(user_id = %body.user_id, metric = %body.metric))]
pub async fn consume(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(mut body): Json<ConsumeBody>,
) -> Result<Response, AppError> {
    if body.idempotency_key.is_none() {
        body.idempotency_key = headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    body.validate()?;

    let caller_ip = client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr))
        .map(|ip| ip.to_string());

    let request = ConsumeRequest {
        user_id: body.user_id,
        metric: body.metric,
        amount: body.amount,
        idempotency_key: body.idempotency_key,
        caller_ip,
    };

    let decision = state.quota.check_and_consume(&request).await?;

    if decision.rate_limited {
        let retry_after = decision.retry_after_secs.unwrap_or(60);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(decision)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return Ok(response);
    }

    Ok((StatusCode::OK, Json(decision)).into_response())
}

/// Give back one unit of usage, e.g. after a project is deleted.
///
/// POST /v1/quota/refund
#[tracing::instrument(skip(state, body), fields(user_id = %body.user_id, metric = %body.metric))]
pub async fn refund(
    State(state): State<AppState>,
    Json(body): Json<RefundBody>,
) -> Result<Json<RefundResult>, AppError> {
    body.validate()?;
    let result = state
        .quota
        .refund(body.user_id, body.metric, body.project_id.as_deref())
        .await?;
    Ok(Json(result))
}

/// GET /v1/users/:user_id/usage/:metric
#[tracing::instrument(skip(state))]
pub async fn get_usage(
    State(state): State<AppState>,
    Path((user_id, metric)): Path<(Uuid, String)>,
) -> Result<Json<UsageView>, AppError> {
    let metric = parse_metric(&metric)?;
    Ok(Json(state.quota.get_usage(user_id, metric).await?))
}

/// POST /v1/users/:user_id/bonus-grants
#[tracing::instrument(skip(state, body), fields(metric = %body.metric, amount = body.amount))]
pub async fn add_bonus_grant(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<CreateBonusGrant>,
) -> Result<(StatusCode, Json<BonusGrant>), AppError> {
    body.validate()?;
    let grant = state.quota.add_bonus_grant(user_id, &body).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// Newest audit entries for a user.
///
/// GET /v1/users/:user_id/audit?limit=50
#[tracing::instrument(skip(state))]
pub async fn list_audit(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<QuotaAuditEntry>>, AppError> {
    let limit = query.limit.clamp(1, MAX_AUDIT_LIMIT);
    Ok(Json(state.quota.recent_audit(user_id, limit).await?))
}
