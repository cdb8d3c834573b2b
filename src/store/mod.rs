//! Storage capabilities consumed by the services.
//!
//! Each concern is a trait so services can be built against Postgres in
//! production and against [`MemoryStore`] in tests. Handles are constructed
//! once and injected; nothing here is global.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::models::{Alert, NewTask, NodeState, ParcelContext, Reading, Task, ThresholdRule};
use crate::window::Granularity;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing table does not exist.
    #[error("relation {0} does not exist")]
    MissingRelation(String),

    /// The store was built without grouped aggregation.
    #[error("grouped aggregation is not available on this store")]
    GroupingUnavailable,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // undefined_table
            if db.code().as_deref() == Some("42P01") {
                return StoreError::MissingRelation(db.message().to_string());
            }
        }
        StoreError::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reading filter shared by every range query. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingQuery {
    pub parcel_id: i64,
    pub sensor_type: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReadingQuery {
    pub fn matches(&self, reading: &Reading) -> bool {
        reading.parcel_id == self.parcel_id
            && self
                .sensor_type
                .as_ref()
                .map_or(true, |s| &reading.sensor_type == s)
            && reading.timestamp >= self.start
            && reading.timestamp <= self.end
    }
}

/// Mean of one bucket as computed by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketMean {
    pub bucket_start: DateTime<Utc>,
    pub mean: f64,
    pub samples: i64,
}

/// One bucket of raw readings: the earliest `per_bucket` rows plus the
/// bucket's full row count.
#[derive(Debug, Clone, PartialEq)]
pub struct CappedBucket {
    pub bucket_start: DateTime<Utc>,
    pub total: i64,
    pub readings: Vec<Reading>,
}

/// Outcome of a fingerprinted insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission<T> {
    Created(T),
    /// The fingerprint already existed; carries the existing record.
    ConflictIgnored(T),
}

impl<T> Emission<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, Emission::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Emission::Created(v) | Emission::ConflictIgnored(v) => v,
        }
    }
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Grouped mean per truncated bucket, ascending by bucket start.
    ///
    /// Stores without native grouping keep this default.
    async fn grouped_means(
        &self,
        _query: &ReadingQuery,
        _bucket: Granularity,
        _tz: Tz,
    ) -> StoreResult<Vec<BucketMean>> {
        Err(StoreError::GroupingUnavailable)
    }

    /// Raw readings per truncated bucket, ascending by bucket start, keeping
    /// the earliest `per_bucket` readings of each (by timestamp, then id).
    ///
    /// Stores without native grouping keep this default.
    async fn capped_buckets(
        &self,
        _query: &ReadingQuery,
        _bucket: Granularity,
        _tz: Tz,
        _per_bucket: usize,
    ) -> StoreResult<Vec<CappedBucket>> {
        Err(StoreError::GroupingUnavailable)
    }

    /// Matching readings ascending by timestamp, at most `limit` rows.
    async fn scan(&self, query: &ReadingQuery, limit: usize) -> StoreResult<Vec<Reading>>;

    /// Most recent reading of `sensor_type` on the parcel within
    /// `[since, until]`. Readings stamped after `until` are ignored.
    async fn latest_reading(
        &self,
        parcel_id: i64,
        sensor_type: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Option<Reading>>;

    /// Most recent reading per `(node, sensor)` pair; highest id wins ties.
    async fn latest_per_sensor(
        &self,
        parcel_id: i64,
        nodes: Option<&[String]>,
    ) -> StoreResult<Vec<Reading>>;

    async fn node_states(&self, parcel_id: i64) -> StoreResult<Vec<NodeState>>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn parcel_context(&self, parcel_id: i64) -> StoreResult<Option<ParcelContext>>;

    /// Rules bound to a growth stage.
    async fn rules_for_stage(&self, stage_id: i64) -> StoreResult<Vec<ThresholdRule>>;

    /// Rules bound to a variety without a specific stage.
    async fn rules_for_variety(&self, variety_id: i64) -> StoreResult<Vec<ThresholdRule>>;

    /// Every parcel id known to the catalog, ascending.
    async fn parcel_ids(&self) -> StoreResult<Vec<i64>>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Task with this fingerprint that has not been soft-deleted.
    async fn find_live_task(&self, fingerprint: &str) -> StoreResult<Option<Task>>;

    /// Insert unless the fingerprint exists; on conflict return the existing row.
    async fn insert_task(&self, task: NewTask) -> StoreResult<Emission<Task>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn find_alert(&self, fingerprint: &str) -> StoreResult<Option<Alert>>;

    /// Insert unless the fingerprint exists; on conflict return the existing row.
    async fn insert_alert(&self, alert: Alert) -> StoreResult<Emission<Alert>>;

    /// Overwrite every column except `status`, keyed by fingerprint.
    async fn update_alert(&self, alert: &Alert) -> StoreResult<Alert>;
}
