//! Read-only dashboard endpoints: aggregates, raw history and latest state.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::aggregation::AggregateResponse;
use crate::history::HistoryResponse;
use crate::latest::NodeSnapshot;
use crate::window::WindowRequest;
use crate::{AppState, CoreError, CoreResult};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/parcels/{parcel_id}/aggregate", get(aggregate))
        .route("/parcels/{parcel_id}/history", get(history))
        .route("/parcels/{parcel_id}/latest", get(latest))
}

/// Query parameters shared by the windowed endpoints.
#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    parameter: Option<String>,
    period: Option<String>,
    /// Bucket override: minute, hour, day, month or year.
    interval: Option<String>,
    /// RFC 3339, or naive wall time in the field time zone.
    start: Option<String>,
    end: Option<String>,
}

impl WindowQuery {
    fn window(&self) -> WindowRequest<'_> {
        WindowRequest {
            period: self.period.as_deref(),
            interval: self.interval.as_deref(),
            start: self.start.as_deref(),
            end: self.end.as_deref(),
        }
    }
}

async fn aggregate(
    Path(parcel_id): Path<i64>,
    Query(params): Query<WindowQuery>,
    State(state): State<AppState>,
) -> CoreResult<Json<AggregateResponse>> {
    // ---
    debug!("GET /parcels/{}/aggregate - {:?}", parcel_id, params);
    let parameter = params
        .parameter
        .as_deref()
        .ok_or_else(|| CoreError::validation("parameter is required"))?;

    let response = state
        .aggregation
        .aggregate_request(parcel_id, parameter, &params.window(), Utc::now())
        .await?;
    Ok(Json(response))
}

async fn history(
    Path(parcel_id): Path<i64>,
    Query(params): Query<WindowQuery>,
    State(state): State<AppState>,
) -> CoreResult<Json<HistoryResponse>> {
    // ---
    debug!("GET /parcels/{}/history - {:?}", parcel_id, params);
    let response = state
        .history
        .history_request(
            parcel_id,
            params.parameter.as_deref(),
            &params.window(),
            Utc::now(),
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    /// Comma-separated node codes expected on the parcel.
    nodes: Option<String>,
}

async fn latest(
    Path(parcel_id): Path<i64>,
    Query(params): Query<LatestQuery>,
    State(state): State<AppState>,
) -> CoreResult<Json<Vec<NodeSnapshot>>> {
    // ---
    let nodes: Option<Vec<String>> = params.nodes.as_deref().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect()
    });

    let snapshots = state
        .latest
        .latest_state(parcel_id, nodes.as_deref(), Utc::now())
        .await?;
    Ok(Json(snapshots))
}
