//! In-memory implementation of every store capability.
//!
//! One mutex guards all state, so the fingerprint check-and-insert is atomic
//! just like the UNIQUE constraint in Postgres.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use super::{
    AlertStore, BucketMean, CappedBucket, CatalogStore, Emission, ReadingQuery, ReadingStore, StoreError,
    StoreResult, TaskStore,
};
use crate::models::{Alert, NewTask, NodeState, ParcelContext, Reading, Task, ThresholdRule};
use crate::window::{self, Granularity};

// ---

#[derive(Debug, Default)]
struct State {
    readings: Vec<Reading>,
    node_states: Vec<NodeState>,
    parcels: BTreeMap<i64, ParcelContext>,
    rules: Vec<ThresholdRule>,
    tasks: Vec<Task>,
    alerts: Vec<Alert>,
    failing_fingerprints: Vec<String>,
    missing_readings_table: bool,
}

#[derive(Debug)]
pub struct MemoryStore {
    grouping: bool,
    next_reading_id: AtomicI64,
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with grouped aggregation available.
    pub fn new() -> Self {
        Self {
            grouping: true,
            next_reading_id: AtomicI64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    /// Store that only offers range scans, forcing in-process grouping.
    pub fn without_grouping() -> Self {
        Self {
            grouping: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a reading, assigning the next id. Returns the stored reading.
    pub fn push_reading(
        &self,
        parcel_id: i64,
        node_code: &str,
        sensor_type: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Reading {
        // ---
        let reading = Reading {
            id: self.next_reading_id.fetch_add(1, Ordering::SeqCst),
            parcel_id,
            node_code: node_code.to_string(),
            sensor_type: sensor_type.to_string(),
            value,
            unit: None,
            timestamp,
            metadata: None,
        };
        self.insert_reading(reading.clone());
        reading
    }

    /// Append a fully specified reading as-is.
    pub fn insert_reading(&self, reading: Reading) {
        self.lock().readings.push(reading);
    }

    pub fn upsert_node_state(&self, node: NodeState) {
        // ---
        let mut state = self.lock();
        state
            .node_states
            .retain(|n| !(n.parcel_id == node.parcel_id && n.node_code == node.node_code));
        state.node_states.push(node);
    }

    pub fn upsert_parcel(&self, parcel: ParcelContext) {
        self.lock().parcels.insert(parcel.parcel_id, parcel);
    }

    pub fn add_rule(&self, rule: ThresholdRule) {
        self.lock().rules.push(rule);
    }

    /// Snapshot of every stored task, soft-deleted ones included.
    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.clone()
    }

    /// Apply a review-side change to a stored task (status, decision, deletion).
    pub fn review_task(&self, fingerprint: &str, review: impl FnOnce(&mut Task)) {
        // ---
        if let Some(task) = self
            .lock()
            .tasks
            .iter_mut()
            .find(|t| t.fingerprint == fingerprint)
        {
            review(task);
        }
    }

    /// Apply a review-side change to a stored alert.
    pub fn review_alert(&self, fingerprint: &str, review: impl FnOnce(&mut Alert)) {
        // ---
        if let Some(alert) = self
            .lock()
            .alerts
            .iter_mut()
            .find(|a| a.fingerprint == fingerprint)
        {
            review(alert);
        }
    }

    /// Make inserts of this task fingerprint fail, to exercise partial failure.
    pub fn fail_task_inserts(&self, fingerprint: &str) {
        self.lock().failing_fingerprints.push(fingerprint.to_string());
    }

    /// Behave as if the readings table had never been created.
    pub fn drop_readings_table(&self) {
        self.lock().missing_readings_table = true;
    }

    fn readings_guard(&self) -> StoreResult<MutexGuard<'_, State>> {
        // ---
        let state = self.lock();
        if state.missing_readings_table {
            return Err(StoreError::MissingRelation("sensor_readings".to_string()));
        }
        Ok(state)
    }
}

/// Newer timestamp wins; identical timestamps go to the higher id.
fn is_newer(candidate: &Reading, current: &Reading) -> bool {
    (candidate.timestamp, candidate.id) > (current.timestamp, current.id)
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn grouped_means(
        &self,
        query: &ReadingQuery,
        bucket: Granularity,
        tz: Tz,
    ) -> StoreResult<Vec<BucketMean>> {
        // ---
        if !self.grouping {
            return Err(StoreError::GroupingUnavailable);
        }
        let state = self.readings_guard()?;

        // Running sums, the way a database GROUP BY accumulates.
        let mut sums: BTreeMap<DateTime<Utc>, (f64, i64)> = BTreeMap::new();
        for reading in state.readings.iter().filter(|r| query.matches(r)) {
            let entry = sums
                .entry(window::truncate(reading.timestamp, bucket, tz))
                .or_insert((0.0, 0));
            entry.0 += reading.value;
            entry.1 += 1;
        }

        Ok(sums
            .into_iter()
            .map(|(bucket_start, (sum, samples))| BucketMean {
                bucket_start,
                mean: sum / samples as f64,
                samples,
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
        if !self.grouping {
            return Err(StoreError::GroupingUnavailable);
        }
        let state = self.readings_guard()?;
        let mut rows: Vec<&Reading> = state.readings.iter().filter(|r| query.matches(r)).collect();
        rows.sort_by_key(|r| (r.timestamp, r.id));

        let mut buckets: BTreeMap<DateTime<Utc>, CappedBucket> = BTreeMap::new();
        for reading in rows {
            let bucket_start = window::truncate(reading.timestamp, bucket, tz);
            let entry = buckets.entry(bucket_start).or_insert_with(|| CappedBucket {
                bucket_start,
                total: 0,
                readings: Vec::new(),
            });
            entry.total += 1;
            if entry.readings.len() < per_bucket {
                entry.readings.push(reading.clone());
            }
        }
        Ok(buckets.into_values().collect())
    }

    async fn scan(&self, query: &ReadingQuery, limit: usize) -> StoreResult<Vec<Reading>> {
        // ---
        let state = self.readings_guard()?;
        let mut rows: Vec<Reading> = state
            .readings
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn latest_reading(
        &self,
        parcel_id: i64,
        sensor_type: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Option<Reading>> {
        // ---
        let state = self.readings_guard()?;
        let mut latest: Option<&Reading> = None;
        for reading in state.readings.iter().filter(|r| {
            r.parcel_id == parcel_id
                && r.sensor_type == sensor_type
                && r.timestamp >= since
                && r.timestamp <= until
        }) {
            if latest.map_or(true, |current| is_newer(reading, current)) {
                latest = Some(reading);
            }
        }
        Ok(latest.cloned())
    }

    async fn latest_per_sensor(
        &self,
        parcel_id: i64,
        nodes: Option<&[String]>,
    ) -> StoreResult<Vec<Reading>> {
        // ---
        let state = self.readings_guard()?;
        let mut latest: BTreeMap<(String, String), &Reading> = BTreeMap::new();
        for reading in state.readings.iter().filter(|r| {
            r.parcel_id == parcel_id && nodes.map_or(true, |n| n.contains(&r.node_code))
        }) {
            let key = (reading.node_code.clone(), reading.sensor_type.clone());
            let replace = latest
                .get(&key)
                .map_or(true, |current| is_newer(reading, current));
            if replace {
                latest.insert(key, reading);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn node_states(&self, parcel_id: i64) -> StoreResult<Vec<NodeState>> {
        // ---
        let mut nodes: Vec<NodeState> = self
            .lock()
            .node_states
            .iter()
            .filter(|n| n.parcel_id == parcel_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_code.cmp(&b.node_code));
        Ok(nodes)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn parcel_context(&self, parcel_id: i64) -> StoreResult<Option<ParcelContext>> {
        Ok(self.lock().parcels.get(&parcel_id).cloned())
    }

    async fn rules_for_stage(&self, stage_id: i64) -> StoreResult<Vec<ThresholdRule>> {
        // ---
        let mut rules: Vec<ThresholdRule> = self
            .lock()
            .rules
            .iter()
            .filter(|r| r.stage_id == Some(stage_id))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn rules_for_variety(&self, variety_id: i64) -> StoreResult<Vec<ThresholdRule>> {
        // ---
        let mut rules: Vec<ThresholdRule> = self
            .lock()
            .rules
            .iter()
            .filter(|r| r.stage_id.is_none() && r.variety_id == Some(variety_id))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn parcel_ids(&self) -> StoreResult<Vec<i64>> {
        Ok(self.lock().parcels.keys().copied().collect())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn find_live_task(&self, fingerprint: &str) -> StoreResult<Option<Task>> {
        Ok(self
            .lock()
            .tasks
            .iter()
            .find(|t| t.fingerprint == fingerprint && !t.soft_deleted)
            .cloned())
    }

    async fn insert_task(&self, task: NewTask) -> StoreResult<Emission<Task>> {
        // ---
        let mut state = self.lock();
        if state.failing_fingerprints.contains(&task.fingerprint) {
            return Err(StoreError::Unavailable(format!(
                "insert of task {} rejected",
                task.fingerprint
            )));
        }
        if let Some(existing) = state.tasks.iter().find(|t| t.fingerprint == task.fingerprint) {
            return Ok(Emission::ConflictIgnored(existing.clone()));
        }
        let created = task.into_task(Uuid::new_v4(), Utc::now());
        state.tasks.push(created.clone());
        Ok(Emission::Created(created))
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn find_alert(&self, fingerprint: &str) -> StoreResult<Option<Alert>> {
        Ok(self
            .lock()
            .alerts
            .iter()
            .find(|a| a.fingerprint == fingerprint)
            .cloned())
    }

    async fn insert_alert(&self, alert: Alert) -> StoreResult<Emission<Alert>> {
        // ---
        let mut state = self.lock();
        if let Some(existing) = state.alerts.iter().find(|a| a.fingerprint == alert.fingerprint) {
            return Ok(Emission::ConflictIgnored(existing.clone()));
        }
        state.alerts.push(alert.clone());
        Ok(Emission::Created(alert))
    }

    async fn update_alert(&self, alert: &Alert) -> StoreResult<Alert> {
        // ---
        let mut state = self.lock();
        let stored = state
            .alerts
            .iter_mut()
            .find(|a| a.fingerprint == alert.fingerprint)
            .ok_or_else(|| {
                StoreError::Unavailable(format!("alert {} vanished", alert.fingerprint))
            })?;
        let status = stored.status;
        let id = stored.id;
        let created_at = stored.created_at;
        *stored = Alert {
            id,
            status,
            created_at,
            ..alert.clone()
        };
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tokio_test::block_on;

    fn at(h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, mi, 0).unwrap()
    }

    fn new_task(fingerprint: &str) -> NewTask {
        NewTask {
            parcel_id: 2,
            kind: "threshold_action".into(),
            description: "Aumentar riego".into(),
            origin: crate::models::TaskOrigin::RuleEngine,
            snapshot: json!({}),
            fingerprint: fingerprint.into(),
            schedule_time: at(11, 0),
        }
    }

    #[test]
    fn test_insert_task_conflict_returns_existing() {
        // ---
        let store = MemoryStore::new();
        let first = block_on(store.insert_task(new_task("rule:1:last:x"))).unwrap();
        assert!(first.is_created());

        let second = block_on(store.insert_task(new_task("rule:1:last:x"))).unwrap();
        assert!(!second.is_created());
        assert_eq!(second.into_inner().id, first.into_inner().id);
        assert_eq!(store.tasks().len(), 1);
    }

    #[test]
    fn test_scan_orders_and_limits() {
        // ---
        let store = MemoryStore::new();
        store.push_reading(2, "n1", "temperatura", 3.0, at(10, 30));
        store.push_reading(2, "n1", "temperatura", 1.0, at(10, 10));
        store.push_reading(2, "n1", "temperatura", 2.0, at(10, 20));
        store.push_reading(3, "n1", "temperatura", 9.0, at(10, 15));

        let query = ReadingQuery {
            parcel_id: 2,
            sensor_type: Some("temperatura".into()),
            start: at(10, 0),
            end: at(10, 30),
        };
        let rows = block_on(store.scan(&query, 2)).unwrap();
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_grouping_capability_can_be_absent() {
        // ---
        let store = MemoryStore::without_grouping();
        let query = ReadingQuery {
            parcel_id: 2,
            sensor_type: None,
            start: at(0, 0),
            end: at(23, 0),
        };
        let err = block_on(store.grouped_means(&query, Granularity::Hour, chrono_tz::UTC))
            .unwrap_err();
        assert!(matches!(err, StoreError::GroupingUnavailable));
    }

    #[test]
    fn test_latest_reading_respects_since() {
        // ---
        let store = MemoryStore::new();
        store.push_reading(2, "n1", "humedad", 50.0, at(8, 0));
        assert!(block_on(store.latest_reading(2, "humedad", at(9, 0), at(12, 0)))
            .unwrap()
            .is_none());
        let latest = block_on(store.latest_reading(2, "humedad", at(7, 0), at(12, 0))).unwrap();
        assert_eq!(latest.map(|r| r.value), Some(50.0));
    }

    #[test]
    fn test_latest_reading_ignores_future_stamps() {
        // ---
        let store = MemoryStore::new();
        store.push_reading(2, "n1", "humedad", 50.0, at(8, 0));
        store.push_reading(2, "n2", "humedad", 70.0, at(20, 0));
        let latest = block_on(store.latest_reading(2, "humedad", at(7, 0), at(9, 0))).unwrap();
        assert_eq!(latest.map(|r| r.value), Some(50.0));
    }
}
