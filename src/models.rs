//! Data models shared by the stores and services.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// ---

/// A single timestamped sensor measurement. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub id: i64,
    pub parcel_id: i64,
    pub node_code: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Free-form ingestion metadata; may carry the node's own `last_seen`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl Reading {
    /// When the emitting node was last heard from, as far as this reading knows.
    pub fn last_seen(&self) -> DateTime<Utc> {
        // ---
        self.metadata
            .as_ref()
            .and_then(|m| m.get("last_seen"))
            .and_then(JsonValue::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(self.timestamp)
    }
}

/// Per-node telemetry maintained by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub parcel_id: i64,
    pub node_code: String,
    pub battery: Option<f64>,
    pub signal: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// What rule resolution needs to know about a parcel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelContext {
    pub parcel_id: i64,
    /// Open cultivation cycle, if any.
    pub cycle_id: Option<i64>,
    pub variety_id: Option<i64>,
    pub stage_id: Option<i64>,
}

/// Threshold rule bound either to a growth stage or generically to a variety.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    // ---
    pub id: i64,
    pub stage_id: Option<i64>,
    pub variety_id: Option<i64>,
    pub parameter_name: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub action_below: Option<String>,
    pub action_above: Option<String>,
    pub active: bool,
    pub priority: i32,
    /// Stored for catalog consumers; not consulted during evaluation.
    pub effective_from: Option<DateTime<Utc>>,
    pub effective_to: Option<DateTime<Utc>>,
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} value: {other}", stringify!($name))),
                }
            }
        }
    };
}

text_enum!(TaskOrigin {
    Manual => "manual",
    RuleEngine => "rule_engine",
});

text_enum!(DecisionState {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
});

text_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Done => "done",
    Cancelled => "cancelled",
});

text_enum!(AlertStatus {
    Open => "open",
    Acknowledged => "acknowledged",
    Resolved => "resolved",
});

text_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

/// Persisted follow-up task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    // ---
    pub id: Uuid,
    pub parcel_id: i64,
    pub kind: String,
    pub description: String,
    pub origin: TaskOrigin,
    pub decision_state: DecisionState,
    pub snapshot: JsonValue,
    pub fingerprint: String,
    pub schedule_time: DateTime<Utc>,
    pub status: TaskStatus,
    pub soft_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Task about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub parcel_id: i64,
    pub kind: String,
    pub description: String,
    pub origin: TaskOrigin,
    pub snapshot: JsonValue,
    pub fingerprint: String,
    pub schedule_time: DateTime<Utc>,
}

impl NewTask {
    /// Materialize the row as it is first written: pending everywhere.
    pub fn into_task(self, id: Uuid, created_at: DateTime<Utc>) -> Task {
        // ---
        Task {
            id,
            parcel_id: self.parcel_id,
            kind: self.kind,
            description: self.description,
            origin: self.origin,
            decision_state: DecisionState::Pending,
            snapshot: self.snapshot,
            fingerprint: self.fingerprint,
            schedule_time: self.schedule_time,
            status: TaskStatus::Pending,
            soft_deleted: false,
            created_at,
        }
    }
}

/// Persisted alert. `status` belongs to human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    // ---
    pub id: Uuid,
    pub parcel_id: i64,
    pub title: String,
    pub detail: String,
    pub code: String,
    pub severity: Severity,
    pub entity_type: String,
    pub entity_ref: String,
    pub metadata: JsonValue,
    pub expires_at: Option<DateTime<Utc>>,
    pub source: String,
    pub fingerprint: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
