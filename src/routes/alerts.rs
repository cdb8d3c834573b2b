//! Alert upsert endpoint used by lifecycle events elsewhere in the platform.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;

use crate::alerts::{AlertInput, UpsertOutcome, UpsertedAlert};
use crate::{AppState, CoreResult};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/alerts", post(upsert))
}

async fn upsert(
    State(state): State<AppState>,
    Json(input): Json<AlertInput>,
) -> CoreResult<(StatusCode, Json<UpsertedAlert>)> {
    // ---
    let upserted = state.alerts.upsert_alert(input, Utc::now()).await?;
    let status = match upserted.outcome {
        UpsertOutcome::Created => StatusCode::CREATED,
        UpsertOutcome::Updated | UpsertOutcome::Unchanged => StatusCode::OK,
    };
    Ok((status, Json(upserted)))
}
