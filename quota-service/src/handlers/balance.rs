//! Time balance handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{BalanceView, Bucket, BucketSource};
use crate::services::ledger::TimeConsumption;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct GrantBucketBody {
    pub source: BucketSource,
    #[validate(range(min = 1, message = "seconds must be positive"))]
    pub seconds: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConsumeTimeBody {
    #[validate(range(min = 1, message = "seconds must be positive"))]
    pub seconds: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AutoTopUpBody {
    pub enabled: bool,
    #[serde(default)]
    #[validate(range(min = 0, message = "threshold_seconds must not be negative"))]
    pub threshold_seconds: i64,
    #[serde(default)]
    #[validate(length(max = 255, message = "package is limited to 255 characters"))]
    pub package: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DailyGiftResponse {
    pub granted: bool,
    pub bucket: Option<Bucket>,
}

/// GET /v1/users/:user_id/balance
#[tracing::instrument(skip(state))]
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceView>, AppError> {
    Ok(Json(state.quota.get_balance(user_id).await?))
}

/// Open a balance at signup, with the welcome bucket.
///
/// POST /v1/users/:user_id/balance
#[tracing::instrument(skip(state))]
pub async fn open_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceView>, AppError> {
    Ok(Json(state.quota.open_balance(user_id).await?))
}

/// POST /v1/users/:user_id/buckets
#[tracing::instrument(skip(state, body), fields(source = %body.source, seconds = body.seconds))]
pub async fn grant_bucket(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<GrantBucketBody>,
) -> Result<(StatusCode, Json<Bucket>), AppError> {
    body.validate()?;
    let bucket = state
        .quota
        .grant_bucket(user_id, body.source, body.seconds, body.expires_at)
        .await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// POST /v1/users/:user_id/daily-gift
#[tracing::instrument(skip(state))]
pub async fn grant_daily_gift(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<DailyGiftResponse>, AppError> {
    let bucket = state.quota.grant_daily_gift(user_id).await?;
    Ok(Json(DailyGiftResponse {
        granted: bucket.is_some(),
        bucket,
    }))
}

/// POST /v1/users/:user_id/time/consume
#[tracing::instrument(skip(state, body), fields(seconds = body.seconds))]
pub async fn consume_time(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<ConsumeTimeBody>,
) -> Result<Json<TimeConsumption>, AppError> {
    body.validate()?;
    Ok(Json(state.quota.consume_time(user_id, body.seconds).await?))
}

/// PUT /v1/users/:user_id/auto-top-up
#[tracing::instrument(skip(state, body), fields(enabled = body.enabled))]
pub async fn configure_auto_top_up(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<AutoTopUpBody>,
) -> Result<Json<BalanceView>, AppError> {
    body.validate()?;
    let view = state
        .quota
        .configure_auto_top_up(user_id, body.enabled, body.threshold_seconds, body.package)
        .await?;
    Ok(Json(view))
}
