//! Inbound events from the billing side.

use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use validator::Validate;

use crate::models::{PlanChangeRecord, SubscriptionChange};
use crate::startup::AppState;

/// POST /v1/events/subscription-changed
#[tracing::instrument(skip(state, body), fields(user_id = %body.user_id))]
pub async fn subscription_changed(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionChange>,
) -> Result<(StatusCode, Json<PlanChangeRecord>), AppError> {
    body.validate()?;
    let record = state.quota.on_subscription_change(&body).await?;
    Ok((StatusCode::CREATED, Json(record)))
}
