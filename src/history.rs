//! Bucketed raw history: same windowing as aggregation, but each bucket keeps
//! a bounded list of example readings instead of a mean.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::aggregation::AggregationSource;
use crate::error::CoreResult;
use crate::models::Reading;
use crate::store::{CappedBucket, ReadingQuery, ReadingStore, StoreError};
use crate::window::{self, Granularity, TimeWindow, WindowRequest};

// ---

/// One raw reading with full provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySample {
    pub node_code: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&Reading> for HistorySample {
    fn from(reading: &Reading) -> Self {
        HistorySample {
            node_code: reading.node_code.clone(),
            sensor_type: reading.sensor_type.clone(),
            value: reading.value,
            unit: reading.unit.clone(),
            timestamp: reading.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryBucket {
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    /// Every reading that fell in the bucket, retained or not.
    pub sample_count: usize,
    /// The earliest readings of the bucket, capped per bucket.
    pub samples: Vec<HistorySample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryMeta {
    pub parcel_id: i64,
    pub parameter: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Granularity,
    pub timezone: String,
    pub count: usize,
    pub samples_per_bucket: usize,
    pub source: AggregationSource,
    /// Only the in-process path can hit the scan cap.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryResponse {
    pub meta: HistoryMeta,
    pub buckets: Vec<HistoryBucket>,
}

pub struct HistoryGrouper {
    readings: Arc<dyn ReadingStore>,
    tz: Tz,
    samples_per_bucket: usize,
    scan_limit: usize,
}

impl HistoryGrouper {
    pub fn new(
        readings: Arc<dyn ReadingStore>,
        tz: Tz,
        samples_per_bucket: usize,
        scan_limit: usize,
    ) -> Self {
        Self {
            readings,
            tz,
            samples_per_bucket: samples_per_bucket.max(1),
            scan_limit: scan_limit.max(1),
        }
    }

    pub async fn history_request(
        &self,
        parcel_id: i64,
        parameter: Option<&str>,
        request: &WindowRequest<'_>,
        now: DateTime<Utc>,
    ) -> CoreResult<HistoryResponse> {
        // ---
        let window = window::resolve(request, now, self.tz)?;
        self.history(parcel_id, parameter, window).await
    }

    /// `parameter = None` groups every sensor type of the parcel together.
    pub async fn history(
        &self,
        parcel_id: i64,
        parameter: Option<&str>,
        window: TimeWindow,
    ) -> CoreResult<HistoryResponse> {
        // ---
        let parameter = parameter.map(str::trim).filter(|p| !p.is_empty());
        let mut meta = HistoryMeta {
            parcel_id,
            parameter: parameter.map(str::to_string),
            start: window.start,
            end: window.end,
            bucket: window.bucket,
            timezone: self.tz.name().to_string(),
            count: 0,
            samples_per_bucket: self.samples_per_bucket,
            source: AggregationSource::Native,
            truncated: false,
        };

        if window.is_empty() {
            return Ok(HistoryResponse {
                meta,
                buckets: Vec::new(),
            });
        }

        let query = ReadingQuery {
            parcel_id,
            sensor_type: meta.parameter.clone(),
            start: window.start,
            end: window.end,
        };
        match self
            .readings
            .capped_buckets(&query, window.bucket, self.tz, self.samples_per_bucket)
            .await
        {
            Ok(capped) => {
                let buckets: Vec<HistoryBucket> = capped
                    .into_iter()
                    .map(|b| from_capped(b, window.bucket))
                    .collect();
                meta.count = buckets.iter().map(|b| b.sample_count).sum();
                return Ok(HistoryResponse { meta, buckets });
            }
            Err(StoreError::GroupingUnavailable) => {
                tracing::debug!(parcel_id, "capped grouping unavailable, grouping in-process");
            }
            Err(err) => return Err(err.into()),
        }

        meta.source = AggregationSource::InProcess;
        let mut rows = self
            .readings
            .scan(&query, self.scan_limit.saturating_add(1))
            .await?;
        if rows.len() > self.scan_limit {
            rows.truncate(self.scan_limit);
            meta.truncated = true;
            tracing::warn!(parcel_id, limit = self.scan_limit, "history scan hit the cap");
        }

        meta.count = rows.len();
        let buckets = group_samples(&rows, window.bucket, self.tz, self.samples_per_bucket);
        Ok(HistoryResponse { meta, buckets })
    }
}

fn from_capped(bucket: CappedBucket, granularity: Granularity) -> HistoryBucket {
    // ---
    HistoryBucket {
        bucket_start: bucket.bucket_start,
        granularity,
        sample_count: usize::try_from(bucket.total).unwrap_or_default(),
        samples: bucket.readings.iter().map(HistorySample::from).collect(),
    }
}

/// Group readings into buckets keeping at most `cap` samples each.
pub fn group_samples<'a>(
    readings: impl IntoIterator<Item = &'a Reading>,
    bucket: Granularity,
    tz: Tz,
    cap: usize,
) -> Vec<HistoryBucket> {
    // ---
    let mut buckets: BTreeMap<DateTime<Utc>, HistoryBucket> = BTreeMap::new();
    for reading in readings {
        let bucket_start = window::truncate(reading.timestamp, bucket, tz);
        let entry = buckets.entry(bucket_start).or_insert_with(|| HistoryBucket {
            bucket_start,
            granularity: bucket,
            sample_count: 0,
            samples: Vec::new(),
        });
        entry.sample_count += 1;
        if entry.samples.len() < cap {
            entry.samples.push(HistorySample::from(reading));
        }
    }
    buckets.into_values().collect()
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

    fn day_window() -> TimeWindow {
        TimeWindow {
            start: at(0, 0),
            end: at(23, 59),
            bucket: Granularity::Hour,
        }
    }

    #[tokio::test]
    async fn test_bucket_retention_is_capped() {
        // ---
        let store = Arc::new(MemoryStore::new());
        for minute in 0..30 {
            store.push_reading(4, "n1", "humedad", f64::from(minute), at(9, minute));
        }
        store.push_reading(4, "n2", "humedad", 55.0, at(11, 0));

        let grouper = HistoryGrouper::new(store, chrono_tz::UTC, 20, 10_000);
        let response = grouper
            .history(4, Some("humedad"), day_window())
            .await
            .unwrap();

        assert_eq!(response.meta.count, 31);
        assert_eq!(response.buckets.len(), 2);
        let first = &response.buckets[0];
        assert_eq!(first.bucket_start, at(9, 0));
        assert_eq!(first.sample_count, 30);
        assert_eq!(first.samples.len(), 20);
        assert_eq!(first.samples[0].value, 0.0);
        assert_eq!(response.buckets[1].samples[0].node_code, "n2");
    }

    #[tokio::test]
    async fn test_store_and_in_process_history_agree() {
        // ---
        let native = Arc::new(MemoryStore::new());
        let in_process = Arc::new(MemoryStore::without_grouping());
        for minute in 0..59 {
            for store in [&native, &in_process] {
                store.push_reading(4, "n1", "humedad", f64::from(minute), at(minute % 7 + 3, minute));
            }
        }

        let a = HistoryGrouper::new(native, chrono_tz::UTC, 5, 10_000)
            .history(4, Some("humedad"), day_window())
            .await
            .unwrap();
        let b = HistoryGrouper::new(in_process, chrono_tz::UTC, 5, 10_000)
            .history(4, Some("humedad"), day_window())
            .await
            .unwrap();

        assert_eq!(a.meta.source, AggregationSource::Native);
        assert_eq!(b.meta.source, AggregationSource::InProcess);
        assert_eq!(a.meta.count, 59);
        assert_eq!(a.meta.count, b.meta.count);
        assert_eq!(a.buckets, b.buckets);
    }

    #[tokio::test]
    async fn test_scan_cap_marks_truncation_only_past_the_cap() {
        // ---
        let store = Arc::new(MemoryStore::without_grouping());
        for minute in 0..10 {
            store.push_reading(4, "n1", "humedad", 40.0, at(9, minute));
        }

        let exact = HistoryGrouper::new(store.clone(), chrono_tz::UTC, 20, 10)
            .history(4, Some("humedad"), day_window())
            .await
            .unwrap();
        assert!(!exact.meta.truncated);
        assert_eq!(exact.meta.count, 10);

        let capped = HistoryGrouper::new(store, chrono_tz::UTC, 20, 9)
            .history(4, Some("humedad"), day_window())
            .await
            .unwrap();
        assert!(capped.meta.truncated);
        assert_eq!(capped.meta.count, 9);
    }

    #[tokio::test]
    async fn test_without_parameter_mixes_sensor_types() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.push_reading(4, "n1", "humedad", 40.0, at(9, 0));
        store.push_reading(4, "n1", "temperatura", 18.0, at(9, 1));
        store.push_reading(5, "n1", "temperatura", 18.0, at(9, 1));

        let grouper = HistoryGrouper::new(store, chrono_tz::UTC, 20, 10_000);
        let response = grouper.history(4, None, day_window()).await.unwrap();
        assert_eq!(response.buckets.len(), 1);
        assert_eq!(response.buckets[0].sample_count, 2);
        assert!(response.meta.parameter.is_none());
    }

    #[tokio::test]
    async fn test_inverted_window_returns_no_buckets() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store.push_reading(4, "n1", "humedad", 40.0, at(9, 0));
        let grouper = HistoryGrouper::new(store, chrono_tz::UTC, 20, 10_000);
        let window = TimeWindow {
            start: at(12, 0),
            end: at(8, 0),
            bucket: Granularity::Hour,
        };
        let response = grouper.history(4, None, window).await.unwrap();
        assert!(response.buckets.is_empty());
        assert_eq!(response.meta.count, 0);
    }
}
