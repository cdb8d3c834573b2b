//! Postgres-backed implementation of every store capability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    AlertStore, BucketMean, CappedBucket, CatalogStore, Emission, ReadingQuery, ReadingStore, StoreError,
    StoreResult, TaskStore,
};
use crate::models::{Alert, NewTask, NodeState, ParcelContext, Reading, Task, ThresholdRule};
use crate::window::Granularity;

// ---

/// Store handle built once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    native_grouping: bool,
}

impl PgStore {
    pub fn new(pool: PgPool, native_grouping: bool) -> Self {
        Self {
            pool,
            native_grouping,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const READING_COLUMNS: &str =
    "id, parcel_id, node_code, sensor_type, value, unit, recorded_at, metadata";

#[derive(Debug, FromRow)]
struct ReadingRow {
    id: i64,
    parcel_id: i64,
    node_code: String,
    sensor_type: String,
    value: f64,
    unit: Option<String>,
    recorded_at: DateTime<Utc>,
    metadata: Option<SqlJson<JsonValue>>,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Reading {
            id: row.id,
            parcel_id: row.parcel_id,
            node_code: row.node_code,
            sensor_type: row.sensor_type,
            value: row.value,
            unit: row.unit,
            timestamp: row.recorded_at,
            metadata: row.metadata.map(|m| m.0),
        }
    }
}

#[derive(Debug, FromRow)]
struct BucketRow {
    bucket_start: DateTime<Utc>,
    mean: f64,
    samples: i64,
}

#[derive(Debug, FromRow)]
struct CappedRow {
    #[sqlx(flatten)]
    reading: ReadingRow,
    bucket_start: DateTime<Utc>,
    bucket_total: i64,
}

#[derive(Debug, FromRow)]
struct NodeStateRow {
    parcel_id: i64,
    node_code: String,
    battery: Option<f64>,
    signal: Option<f64>,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct ParcelContextRow {
    parcel_id: i64,
    cycle_id: Option<i64>,
    variety_id: Option<i64>,
    stage_id: Option<i64>,
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: i64,
    stage_id: Option<i64>,
    variety_id: Option<i64>,
    parameter_name: String,
    min_value: Option<f64>,
    max_value: Option<f64>,
    action_below: Option<String>,
    action_above: Option<String>,
    active: bool,
    priority: i32,
    effective_from: Option<DateTime<Utc>>,
    effective_to: Option<DateTime<Utc>>,
}

impl From<RuleRow> for ThresholdRule {
    fn from(row: RuleRow) -> Self {
        ThresholdRule {
            id: row.id,
            stage_id: row.stage_id,
            variety_id: row.variety_id,
            parameter_name: row.parameter_name,
            min: row.min_value,
            max: row.max_value,
            action_below: row.action_below,
            action_above: row.action_above,
            active: row.active,
            priority: row.priority,
            effective_from: row.effective_from,
            effective_to: row.effective_to,
        }
    }
}

const RULE_COLUMNS: &str = "id, stage_id, variety_id, parameter_name, min_value, max_value, \
     action_below, action_above, active, priority, effective_from, effective_to";

const TASK_COLUMNS: &str = "id, parcel_id, kind, description, origin, decision_state, snapshot, \
     fingerprint, schedule_time, status, soft_deleted, created_at";

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    parcel_id: i64,
    kind: String,
    description: String,
    origin: String,
    decision_state: String,
    snapshot: SqlJson<JsonValue>,
    fingerprint: String,
    schedule_time: DateTime<Utc>,
    status: String,
    soft_deleted: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            parcel_id: row.parcel_id,
            kind: row.kind,
            description: row.description,
            origin: row.origin.parse().map_err(corrupt_row)?,
            decision_state: row.decision_state.parse().map_err(corrupt_row)?,
            snapshot: row.snapshot.0,
            fingerprint: row.fingerprint,
            schedule_time: row.schedule_time,
            status: row.status.parse().map_err(corrupt_row)?,
            soft_deleted: row.soft_deleted,
            created_at: row.created_at,
        })
    }
}

const ALERT_COLUMNS: &str = "id, parcel_id, title, detail, code, severity, entity_type, \
     entity_ref, metadata, expires_at, source, fingerprint, status, created_at, updated_at";

#[derive(Debug, FromRow)]
struct AlertRow {
    id: Uuid,
    parcel_id: i64,
    title: String,
    detail: String,
    code: String,
    severity: String,
    entity_type: String,
    entity_ref: String,
    metadata: SqlJson<JsonValue>,
    expires_at: Option<DateTime<Utc>>,
    source: String,
    fingerprint: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = StoreError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Alert {
            id: row.id,
            parcel_id: row.parcel_id,
            title: row.title,
            detail: row.detail,
            code: row.code,
            severity: row.severity.parse().map_err(corrupt_row)?,
            entity_type: row.entity_type,
            entity_ref: row.entity_ref,
            metadata: row.metadata.0,
            expires_at: row.expires_at,
            source: row.source,
            fingerprint: row.fingerprint,
            status: row.status.parse().map_err(corrupt_row)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn corrupt_row(message: String) -> StoreError {
    StoreError::Unavailable(format!("corrupt row: {message}"))
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn grouped_means(
        &self,
        query: &ReadingQuery,
        bucket: Granularity,
        tz: Tz,
    ) -> StoreResult<Vec<BucketMean>> {
        // ---
        if !self.native_grouping {
            return Err(StoreError::GroupingUnavailable);
        }

        let rows: Vec<BucketRow> = sqlx::query_as(
            r#"
            SELECT
                date_trunc($5, recorded_at, $6) AS bucket_start,
                AVG(value) AS mean,
                COUNT(*) AS samples
            FROM sensor_readings
            WHERE parcel_id = $1
              AND ($2::text IS NULL OR sensor_type = $2)
              AND recorded_at >= $3
              AND recorded_at <= $4
            GROUP BY bucket_start
            ORDER BY bucket_start ASC
            "#,
        )
        .bind(query.parcel_id)
        .bind(query.sensor_type.as_deref())
        .bind(query.start)
        .bind(query.end)
        .bind(bucket.as_str())
        .bind(tz.name())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| BucketMean {
                bucket_start: row.bucket_start,
                mean: row.mean,
                samples: row.samples,
            })
            .collect())
    }

    async fn capped_buckets(
        &self,
        query: &ReadingQuery,
        bucket: Granularity,
        tz: Tz,
        per_bucket: usize,
    ) -> StoreResult<Vec<CappedBucket>> {
        // ---
        if !self.native_grouping {
            return Err(StoreError::GroupingUnavailable);
        }

        let sql = format!(
            r#"
            WITH bucketed AS (
                SELECT {READING_COLUMNS},
                       date_trunc($5, recorded_at, $6) AS bucket_start
                FROM sensor_readings
                WHERE parcel_id = $1
                  AND ($2::text IS NULL OR sensor_type = $2)
                  AND recorded_at >= $3
                  AND recorded_at <= $4
            ),
            ranked AS (
                SELECT *,
                       ROW_NUMBER() OVER (
                           PARTITION BY bucket_start ORDER BY recorded_at, id
                       ) AS position,
                       COUNT(*) OVER (PARTITION BY bucket_start) AS bucket_total
                FROM bucketed
            )
            SELECT {READING_COLUMNS}, bucket_start, bucket_total
            FROM ranked
            WHERE position <= $7
            ORDER BY bucket_start ASC, recorded_at ASC, id ASC
            "#
        );
        let rows: Vec<CappedRow> = sqlx::query_as(&sql)
            .bind(query.parcel_id)
            .bind(query.sensor_type.as_deref())
            .bind(query.start)
            .bind(query.end)
            .bind(bucket.as_str())
            .bind(tz.name())
            .bind(i64::try_from(per_bucket).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut buckets: Vec<CappedBucket> = Vec::new();
        for row in rows {
            let reading = Reading::from(row.reading);
            match buckets.last_mut() {
                Some(last) if last.bucket_start == row.bucket_start => last.readings.push(reading),
                _ => buckets.push(CappedBucket {
                    bucket_start: row.bucket_start,
                    total: row.bucket_total,
                    readings: vec![reading],
                }),
            }
        }
        Ok(buckets)
    }

    async fn scan(&self, query: &ReadingQuery, limit: usize) -> StoreResult<Vec<Reading>> {
        // ---
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM sensor_readings
            WHERE parcel_id = $1
              AND ($2::text IS NULL OR sensor_type = $2)
              AND recorded_at >= $3
              AND recorded_at <= $4
            ORDER BY recorded_at ASC, id ASC
            LIMIT $5
            "#
        );
        let rows: Vec<ReadingRow> = sqlx::query_as(&sql)
            .bind(query.parcel_id)
            .bind(query.sensor_type.as_deref())
            .bind(query.start)
            .bind(query.end)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    async fn latest_reading(
        &self,
        parcel_id: i64,
        sensor_type: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Option<Reading>> {
        // ---
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM sensor_readings
            WHERE parcel_id = $1
              AND sensor_type = $2
              AND recorded_at >= $3
              AND recorded_at <= $4
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#
        );
        let row: Option<ReadingRow> = sqlx::query_as(&sql)
            .bind(parcel_id)
            .bind(sensor_type)
            .bind(since)
            .bind(until)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Reading::from))
    }

    async fn latest_per_sensor(
        &self,
        parcel_id: i64,
        nodes: Option<&[String]>,
    ) -> StoreResult<Vec<Reading>> {
        // ---
        let sql = format!(
            r#"
            SELECT DISTINCT ON (node_code, sensor_type) {READING_COLUMNS}
            FROM sensor_readings
            WHERE parcel_id = $1
              AND ($2::text[] IS NULL OR node_code = ANY($2))
            ORDER BY node_code, sensor_type, recorded_at DESC, id DESC
            "#
        );
        let rows: Vec<ReadingRow> = sqlx::query_as(&sql)
            .bind(parcel_id)
            .bind(nodes.map(<[String]>::to_vec))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    async fn node_states(&self, parcel_id: i64) -> StoreResult<Vec<NodeState>> {
        // ---
        let rows: Vec<NodeStateRow> = sqlx::query_as(
            r#"
            SELECT parcel_id, node_code, battery, signal, last_seen
            FROM node_states
            WHERE parcel_id = $1
            ORDER BY node_code ASC
            "#,
        )
        .bind(parcel_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| NodeState {
                parcel_id: row.parcel_id,
                node_code: row.node_code,
                battery: row.battery,
                signal: row.signal,
                last_seen: row.last_seen,
            })
            .collect())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn parcel_context(&self, parcel_id: i64) -> StoreResult<Option<ParcelContext>> {
        // ---
        // The open cycle, when present, overrides the parcel's own variety.
        let row: Option<ParcelContextRow> = sqlx::query_as(
            r#"
            SELECT
                p.id AS parcel_id,
                c.id AS cycle_id,
                COALESCE(c.variety_id, p.variety_id) AS variety_id,
                c.current_stage_id AS stage_id
            FROM parcels p
            LEFT JOIN LATERAL (
                SELECT id, variety_id, current_stage_id
                FROM cycles
                WHERE parcel_id = p.id AND closed_at IS NULL
                ORDER BY started_at DESC, id DESC
                LIMIT 1
            ) c ON TRUE
            WHERE p.id = $1
            "#,
        )
        .bind(parcel_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ParcelContext {
            parcel_id: row.parcel_id,
            cycle_id: row.cycle_id,
            variety_id: row.variety_id,
            stage_id: row.stage_id,
        }))
    }

    async fn rules_for_stage(&self, stage_id: i64) -> StoreResult<Vec<ThresholdRule>> {
        // ---
        let sql = format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM threshold_rules
            WHERE stage_id = $1
            ORDER BY priority DESC, id ASC
            "#
        );
        let rows: Vec<RuleRow> = sqlx::query_as(&sql)
            .bind(stage_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ThresholdRule::from).collect())
    }

    async fn rules_for_variety(&self, variety_id: i64) -> StoreResult<Vec<ThresholdRule>> {
        // ---
        let sql = format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM threshold_rules
            WHERE variety_id = $1 AND stage_id IS NULL
            ORDER BY priority DESC, id ASC
            "#
        );
        let rows: Vec<RuleRow> = sqlx::query_as(&sql)
            .bind(variety_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ThresholdRule::from).collect())
    }

    async fn parcel_ids(&self) -> StoreResult<Vec<i64>> {
        // ---
        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM parcels ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn find_live_task(&self, fingerprint: &str) -> StoreResult<Option<Task>> {
        // ---
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE fingerprint = $1 AND soft_deleted = FALSE"
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn insert_task(&self, task: NewTask) -> StoreResult<Emission<Task>> {
        // ---
        let fingerprint = task.fingerprint.clone();
        let candidate = task.into_task(Uuid::new_v4(), Utc::now());

        let sql = format!(
            r#"
            INSERT INTO tasks ({TASK_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (fingerprint) DO NOTHING
            RETURNING {TASK_COLUMNS}
            "#
        );
        let inserted: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(candidate.id)
            .bind(candidate.parcel_id)
            .bind(&candidate.kind)
            .bind(&candidate.description)
            .bind(candidate.origin.as_str())
            .bind(candidate.decision_state.as_str())
            .bind(SqlJson(&candidate.snapshot))
            .bind(&candidate.fingerprint)
            .bind(candidate.schedule_time)
            .bind(candidate.status.as_str())
            .bind(candidate.soft_deleted)
            .bind(candidate.created_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok(Emission::Created(Task::try_from(row)?));
        }

        // Lost the race or re-derived an old event: hand back the stored row.
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE fingerprint = $1");
        let existing: TaskRow = sqlx::query_as(&sql)
            .bind(&fingerprint)
            .fetch_one(&self.pool)
            .await?;
        Ok(Emission::ConflictIgnored(Task::try_from(existing)?))
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn find_alert(&self, fingerprint: &str) -> StoreResult<Option<Alert>> {
        // ---
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE fingerprint = $1");
        let row: Option<AlertRow> = sqlx::query_as(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Alert::try_from).transpose()
    }

    async fn insert_alert(&self, alert: Alert) -> StoreResult<Emission<Alert>> {
        // ---
        let sql = format!(
            r#"
            INSERT INTO alerts ({ALERT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (fingerprint) DO NOTHING
            RETURNING {ALERT_COLUMNS}
            "#
        );
        let inserted: Option<AlertRow> = sqlx::query_as(&sql)
            .bind(alert.id)
            .bind(alert.parcel_id)
            .bind(&alert.title)
            .bind(&alert.detail)
            .bind(&alert.code)
            .bind(alert.severity.as_str())
            .bind(&alert.entity_type)
            .bind(&alert.entity_ref)
            .bind(SqlJson(&alert.metadata))
            .bind(alert.expires_at)
            .bind(&alert.source)
            .bind(&alert.fingerprint)
            .bind(alert.status.as_str())
            .bind(alert.created_at)
            .bind(alert.updated_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(Emission::Created(Alert::try_from(row)?)),
            None => {
                let existing = self.find_alert(&alert.fingerprint).await?.ok_or_else(|| {
                    StoreError::Unavailable(format!(
                        "alert {} conflicted but could not be read back",
                        alert.fingerprint
                    ))
                })?;
                Ok(Emission::ConflictIgnored(existing))
            }
        }
    }

    async fn update_alert(&self, alert: &Alert) -> StoreResult<Alert> {
        // ---
        let sql = format!(
            r#"
            UPDATE alerts
            SET
                parcel_id = $2,
                title = $3,
                detail = $4,
                code = $5,
                severity = $6,
                entity_type = $7,
                entity_ref = $8,
                metadata = $9,
                expires_at = $10,
                source = $11,
                updated_at = $12
            WHERE fingerprint = $1
            RETURNING {ALERT_COLUMNS}
            "#
        );
        let row: AlertRow = sqlx::query_as(&sql)
            .bind(&alert.fingerprint)
            .bind(alert.parcel_id)
            .bind(&alert.title)
            .bind(&alert.detail)
            .bind(&alert.code)
            .bind(alert.severity.as_str())
            .bind(&alert.entity_type)
            .bind(&alert.entity_ref)
            .bind(SqlJson(&alert.metadata))
            .bind(alert.expires_at)
            .bind(&alert.source)
            .bind(alert.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Alert::try_from(row)
    }
}
