//! Current per-node view of a parcel: latest value per sensor plus freshness.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::CoreResult;
use crate::models::{NodeState, Reading};
use crate::store::ReadingStore;

// ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorValue {
    pub sensor_type: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub node_code: String,
    pub active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub battery: Option<f64>,
    pub signal: Option<f64>,
    /// Empty for expected nodes that have not reported.
    pub sensors: Vec<SensorValue>,
}

impl NodeSnapshot {
    fn silent(node_code: &str) -> Self {
        NodeSnapshot {
            node_code: node_code.to_string(),
            active: false,
            last_seen: None,
            battery: None,
            signal: None,
            sensors: Vec::new(),
        }
    }
}

/// Active iff the node reported within `window` of `now`, boundary included.
pub fn is_active(last_seen: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    now - last_seen <= window
}

pub struct LatestStateResolver {
    readings: Arc<dyn ReadingStore>,
    active_window: Duration,
}

impl LatestStateResolver {
    pub fn new(readings: Arc<dyn ReadingStore>, active_window: std::time::Duration) -> Self {
        Self {
            readings,
            active_window: Duration::from_std(active_window).unwrap_or(Duration::seconds(600)),
        }
    }

    /// One entry per node of the parcel, ordered by node code.
    ///
    /// When `nodes` is given, the view is restricted to those codes and each of
    /// them appears even if it never reported. Otherwise the node registry
    /// decides which silent nodes are expected.
    pub async fn latest_state(
        &self,
        parcel_id: i64,
        nodes: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<NodeSnapshot>> {
        // ---
        let latest = self.readings.latest_per_sensor(parcel_id, nodes).await?;
        let registry = self.readings.node_states(parcel_id).await?;

        let mut snapshots: BTreeMap<String, NodeSnapshot> = BTreeMap::new();
        match nodes {
            Some(codes) => {
                for code in codes {
                    snapshots.insert(code.clone(), NodeSnapshot::silent(code));
                }
            }
            None => {
                for state in &registry {
                    snapshots.insert(state.node_code.clone(), NodeSnapshot::silent(&state.node_code));
                }
            }
        }

        for reading in latest {
            self.apply_reading(&mut snapshots, reading);
        }

        for state in registry {
            if let Some(snapshot) = snapshots.get_mut(&state.node_code) {
                apply_node_state(snapshot, state);
            }
        }

        let mut out: Vec<NodeSnapshot> = snapshots.into_values().collect();
        for snapshot in &mut out {
            snapshot.active = snapshot
                .last_seen
                .is_some_and(|seen| is_active(seen, now, self.active_window));
        }
        tracing::debug!(parcel_id, nodes = out.len(), "resolved latest state");
        Ok(out)
    }

    fn apply_reading(&self, snapshots: &mut BTreeMap<String, NodeSnapshot>, reading: Reading) {
        // ---
        let seen = reading.last_seen();
        let snapshot = snapshots
            .entry(reading.node_code.clone())
            .or_insert_with(|| NodeSnapshot::silent(&reading.node_code));
        snapshot.last_seen = Some(snapshot.last_seen.map_or(seen, |prev| prev.max(seen)));
        snapshot.sensors.push(SensorValue {
            sensor_type: reading.sensor_type,
            value: reading.value,
            unit: reading.unit,
            timestamp: reading.timestamp,
        });
    }
}

/// Telemetry fills in battery/signal; its `last_seen` only counts when the
/// node has no readings to go by.
fn apply_node_state(snapshot: &mut NodeSnapshot, state: NodeState) {
    // ---
    snapshot.battery = state.battery;
    snapshot.signal = state.signal;
    if snapshot.sensors.is_empty() {
        snapshot.last_seen = state.last_seen;
    }
}
