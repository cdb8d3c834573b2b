//! Rule evaluation triggers, called by the external scheduler.

use axum::{
    extract::{Path, Query, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::rules::{BatchSummary, EvaluationSummary};
use crate::{AppState, CoreResult};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/parcels/{parcel_id}/rules/evaluate", post(evaluate_parcel))
        .route("/rules/evaluate", post(evaluate_all))
}

#[derive(Debug, Deserialize)]
pub struct EvaluateQuery {
    lookback_minutes: Option<u32>,
}

async fn evaluate_parcel(
    Path(parcel_id): Path<i64>,
    Query(params): Query<EvaluateQuery>,
    State(state): State<AppState>,
) -> CoreResult<Json<EvaluationSummary>> {
    // ---
    info!("POST /parcels/{}/rules/evaluate", parcel_id);
    let summary = state
        .rules
        .evaluate_rules(parcel_id, params.lookback_minutes, Utc::now())
        .await?;
    Ok(Json(summary))
}

async fn evaluate_all(
    Query(params): Query<EvaluateQuery>,
    State(state): State<AppState>,
) -> CoreResult<Json<BatchSummary>> {
    // ---
    info!("POST /rules/evaluate - sweeping parcels");
    let batch = state
        .rules
        .evaluate_active_parcels(params.lookback_minutes, Utc::now())
        .await?;
    info!(
        "Sweep complete: {} parcels, {} tasks created, {} failures",
        batch.parcels_evaluated,
        batch.created_tasks,
        batch.failures.len()
    );
    Ok(Json(batch))
}
