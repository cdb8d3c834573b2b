//! Windowed mean aggregation of readings.
//!
//! The store's grouped query is tried first. When the store does not offer
//! grouping, matching rows are scanned and grouped in-process with the same
//! truncation rules ([`window::truncate`]), so both paths yield the same
//! buckets and means.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};
use crate::models::Reading;
use crate::store::{BucketMean, ReadingQuery, ReadingStore, StoreError};
use crate::window::{self, Granularity, TimeWindow, WindowRequest};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationSource {
    Native,
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatePoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    pub samples: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateMeta {
    pub parcel_id: i64,
    pub parameter: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Granularity,
    pub timezone: String,
    /// Readings that contributed to the points.
    pub count: i64,
    pub source: AggregationSource,
    /// The in-process scan hit its row cap; later buckets may be missing.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResponse {
    pub meta: AggregateMeta,
    pub points: Vec<AggregatePoint>,
}

pub struct AggregationPipeline {
    readings: Arc<dyn ReadingStore>,
    tz: Tz,
    scan_limit: usize,
}

impl AggregationPipeline {
    pub fn new(readings: Arc<dyn ReadingStore>, tz: Tz, scan_limit: usize) -> Self {
        Self {
            readings,
            tz,
            scan_limit: scan_limit.max(1),
        }
    }

    /// Resolve the window from a raw request, then aggregate.
    pub async fn aggregate_request(
        &self,
        parcel_id: i64,
        parameter: &str,
        request: &WindowRequest<'_>,
        now: DateTime<Utc>,
    ) -> CoreResult<AggregateResponse> {
        // ---
        let window = window::resolve(request, now, self.tz)?;
        self.aggregate(parcel_id, parameter, window).await
    }

    pub async fn aggregate(
        &self,
        parcel_id: i64,
        parameter: &str,
        window: TimeWindow,
    ) -> CoreResult<AggregateResponse> {
        // ---
        let parameter = parameter.trim();
        if parameter.is_empty() {
            return Err(CoreError::validation("parameter is required"));
        }

        let mut meta = AggregateMeta {
            parcel_id,
            parameter: parameter.to_string(),
            start: window.start,
            end: window.end,
            bucket: window.bucket,
            timezone: self.tz.name().to_string(),
            count: 0,
            source: AggregationSource::Native,
            truncated: false,
        };

        if window.is_empty() {
            tracing::debug!(parcel_id, parameter, "inverted window, nothing to aggregate");
            return Ok(AggregateResponse {
                meta,
                points: Vec::new(),
            });
        }

        let query = ReadingQuery {
            parcel_id,
            sensor_type: Some(parameter.to_string()),
            start: window.start,
            end: window.end,
        };

        let means = match self
            .readings
            .grouped_means(&query, window.bucket, self.tz)
            .await
        {
            Ok(means) => means,
            Err(StoreError::GroupingUnavailable) => {
                meta.source = AggregationSource::InProcess;
                let mut rows = self
                    .readings
                    .scan(&query, self.scan_limit.saturating_add(1))
                    .await?;
                if rows.len() > self.scan_limit {
                    rows.truncate(self.scan_limit);
                    meta.truncated = true;
                    tracing::warn!(
                        parcel_id,
                        parameter,
                        limit = self.scan_limit,
                        "in-process aggregation hit the scan cap"
                    );
                }
                group_means(&rows, window.bucket, self.tz)
            }
            Err(err) => return Err(err.into()),
        };

        meta.count = means.iter().map(|m| m.samples).sum();
        let points = means
            .into_iter()
            .map(|m| AggregatePoint {
                timestamp: m.bucket_start,
                value: m.mean.is_finite().then_some(m.mean),
                samples: m.samples,
            })
            .collect();

        Ok(AggregateResponse { meta, points })
    }
}

/// In-process grouping: collect values per truncated bucket, then average.
///
/// Buckets without samples never appear. Output is ascending by bucket start.
pub fn group_means<'a>(
    readings: impl IntoIterator<Item = &'a Reading>,
    bucket: Granularity,
    tz: Tz,
) -> Vec<BucketMean> {
    // ---
    let mut values: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
    for reading in readings {
        values
            .entry(window::truncate(reading.timestamp, bucket, tz))
            .or_default()
            .push(reading.value);
    }

    values
        .into_iter()
        .map(|(bucket_start, values)| BucketMean {
            bucket_start,
            mean: values.iter().sum::<f64>() / values.len() as f64,
            samples: values.len() as i64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, mi, 0).unwrap()
    }

    fn reading(id: i64, value: f64, ts: DateTime<Utc>) -> Reading {
        Reading {
            id,
            parcel_id: 2,
            node_code: "n1".into(),
            sensor_type: "temperatura".into(),
            value,
            unit: None,
            timestamp: ts,
            metadata: None,
        }
    }

    #[test]
    fn test_group_means_is_sparse_and_ordered() {
        // ---
        let rows = vec![
            reading(1, 10.0, at(12, 5)),
            reading(2, 20.0, at(10, 59)),
            reading(3, 30.0, at(10, 1)),
        ];
        let means = group_means(&rows, Granularity::Hour, chrono_tz::UTC);
        assert_eq!(means.len(), 2);
        assert_eq!(means[0].bucket_start, at(10, 0));
        assert_eq!(means[0].mean, 25.0);
        assert_eq!(means[0].samples, 2);
        // 11:00 has no samples and is omitted.
        assert_eq!(means[1].bucket_start, at(12, 0));
    }

    #[tokio::test]
    async fn test_empty_parameter_is_rejected() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = AggregationPipeline::new(store, chrono_tz::UTC, 100);
        let window = TimeWindow {
            start: at(0, 0),
            end: at(23, 0),
            bucket: Granularity::Hour,
        };
        let err = pipeline.aggregate(2, "  ", window).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_no_data_is_success_not_error() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let pipeline = AggregationPipeline::new(store, chrono_tz::UTC, 100);
        let window = TimeWindow {
            start: at(0, 0),
            end: at(23, 0),
            bucket: Granularity::Hour,
        };
        let response = pipeline.aggregate(2, "humedad", window).await.unwrap();
        assert!(response.points.is_empty());
        assert_eq!(response.meta.count, 0);
    }

    #[tokio::test]
    async fn test_missing_table_surfaces_configuration_error() {
        // ---
        let store = Arc::new(MemoryStore::without_grouping());
        store.drop_readings_table();
        let pipeline = AggregationPipeline::new(store, chrono_tz::UTC, 100);
        let window = TimeWindow {
            start: at(0, 0),
            end: at(23, 0),
            bucket: Granularity::Hour,
        };
        let err = pipeline.aggregate(2, "temperatura", window).await.unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_scan_cap_marks_truncated() {
        // ---
        let store = Arc::new(MemoryStore::without_grouping());
        for minute in 0..5 {
            store.push_reading(2, "n1", "temperatura", 20.0, at(10, minute));
        }
        let pipeline = AggregationPipeline::new(store, chrono_tz::UTC, 3);
        let window = TimeWindow {
            start: at(0, 0),
            end: at(23, 0),
            bucket: Granularity::Minute,
        };
        let response = pipeline.aggregate(2, "temperatura", window).await.unwrap();
        assert!(response.meta.truncated);
        assert_eq!(response.meta.source, AggregationSource::InProcess);
        assert_eq!(response.points.len(), 3);
    }

    #[tokio::test]
    async fn test_exactly_the_cap_is_not_truncated() {
        // ---
        let store = Arc::new(MemoryStore::without_grouping());
        for minute in 0..3 {
            store.push_reading(2, "n1", "temperatura", 20.0, at(10, minute));
        }
        let pipeline = AggregationPipeline::new(store, chrono_tz::UTC, 3);
        let window = TimeWindow {
            start: at(0, 0),
            end: at(23, 0),
            bucket: Granularity::Minute,
        };
        let response = pipeline.aggregate(2, "temperatura", window).await.unwrap();
        assert!(!response.meta.truncated);
        assert_eq!(response.meta.count, 3);
    }
}
