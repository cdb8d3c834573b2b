//! End-to-end checks against a running server.
//!
//! Set `BASE_URL` (e.g. `http://localhost:8080`) to run them; without it the
//! tests return early so `cargo test` works without a database.

use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct AggregateMeta {
    parcel_id: i64,
    parameter: String,
    count: i64,
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct AggregatePoint {
    value: Option<f64>,
    samples: i64,
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    meta: AggregateMeta,
    points: Vec<AggregatePoint>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct UpsertedAlert {
    outcome: String,
    alert: AlertBody,
}

#[derive(Debug, Deserialize)]
struct AlertBody {
    detail: String,
    fingerprint: String,
}

fn base_url() -> Option<String> {
    std::env::var("BASE_URL").ok()
}

#[tokio::test]
async fn health_endpoint_ok() -> Result<()> {
    // ---
    let Some(base) = base_url() else {
        return Ok(());
    };
    let response = Client::new().get(format!("{base}/health")).send().await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn inverted_window_returns_empty_points() -> Result<()> {
    // ---
    let Some(base) = base_url() else {
        return Ok(());
    };
    let url = format!(
        "{base}/parcels/2/aggregate?parameter=temperatura&period=day\
         &start=2025-06-03T00:00:00Z&end=2025-06-01T00:00:00Z"
    );
    let body: AggregateResponse = Client::new().get(&url).send().await?.json().await?;

    assert_eq!(body.meta.parcel_id, 2);
    assert_eq!(body.meta.parameter, "temperatura");
    assert_eq!(body.meta.bucket, "hour");
    assert_eq!(body.meta.count, 0);
    assert!(body.points.is_empty());
    Ok(())
}

#[tokio::test]
async fn aggregate_points_are_consistent() -> Result<()> {
    // ---
    let Some(base) = base_url() else {
        return Ok(());
    };
    let url = format!("{base}/parcels/2/aggregate?parameter=temperatura&period=week");
    let body: AggregateResponse = Client::new().get(&url).send().await?.json().await?;

    let total: i64 = body.points.iter().map(|p| p.samples).sum();
    assert_eq!(total, body.meta.count, "sample counts must add up");
    for point in &body.points {
        assert!(point.samples > 0, "empty buckets must be omitted");
        assert!(point.value.is_some());
    }
    Ok(())
}

#[tokio::test]
async fn missing_parameter_is_a_validation_error() -> Result<()> {
    // ---
    let Some(base) = base_url() else {
        return Ok(());
    };
    let response = Client::new()
        .get(format!("{base}/parcels/2/aggregate?period=day"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = response.json().await?;
    assert_eq!(body.error, "validation_error");
    Ok(())
}

#[tokio::test]
async fn alert_upsert_is_idempotent() -> Result<()> {
    // ---
    let Some(base) = base_url() else {
        return Ok(());
    };
    let client = Client::new();
    let payload = json!({
        "parcel_id": 2,
        "title": "Integration check",
        "detail": "first",
        "code": "integration_check",
        "entity_type": "test",
        "entity_ref": "check-1",
    });

    client
        .post(format!("{base}/alerts"))
        .json(&payload)
        .send()
        .await?
        .error_for_status()?;

    let mut changed = payload.clone();
    changed["detail"] = json!("second");
    let second: UpsertedAlert = client
        .post(format!("{base}/alerts"))
        .json(&changed)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(second.alert.detail, "second");
    assert_eq!(second.alert.fingerprint, "integration_check:2:test:check-1");

    let third: UpsertedAlert = client
        .post(format!("{base}/alerts"))
        .json(&changed)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(third.outcome, "unchanged");
    Ok(())
}
