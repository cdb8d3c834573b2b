//! Upsert-by-fingerprint for alerts.
//!
//! One alert exists per `(code, parcel, entity_type, entity_ref)`. Re-emitting
//! it refreshes every field except `status`, which belongs to human review,
//! and skips the write entirely when nothing changed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{Alert, AlertStatus, Severity};
use crate::store::{AlertStore, Emission};

// ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInput {
    pub parcel_id: i64,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    pub code: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    pub entity_type: String,
    pub entity_ref: String,
    #[serde(default)]
    pub metadata: JsonValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_severity() -> Severity {
    Severity::Info
}

fn default_source() -> String {
    "manual".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertedAlert {
    pub outcome: UpsertOutcome,
    pub alert: Alert,
}

/// `"{code}:{parcel_id}:{entity_type}:{entity_ref}"`
pub fn alert_fingerprint(code: &str, parcel_id: i64, entity_type: &str, entity_ref: &str) -> String {
    format!("{code}:{parcel_id}:{entity_type}:{entity_ref}")
}

pub struct AlertTaskEmitter {
    alerts: Arc<dyn AlertStore>,
}

impl AlertTaskEmitter {
    pub fn new(alerts: Arc<dyn AlertStore>) -> Self {
        Self { alerts }
    }

    pub async fn upsert_alert(
        &self,
        input: AlertInput,
        now: DateTime<Utc>,
    ) -> CoreResult<UpsertedAlert> {
        // ---
        for (name, value) in [
            ("code", &input.code),
            ("entity_type", &input.entity_type),
            ("entity_ref", &input.entity_ref),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::validation(format!("{name} is required")));
            }
        }

        let fingerprint =
            alert_fingerprint(&input.code, input.parcel_id, &input.entity_type, &input.entity_ref);

        if let Some(existing) = self.alerts.find_alert(&fingerprint).await? {
            return self.refresh(existing, input, now).await;
        }

        let candidate = Alert {
            id: Uuid::new_v4(),
            parcel_id: input.parcel_id,
            title: input.title.clone(),
            detail: input.detail.clone(),
            code: input.code.clone(),
            severity: input.severity,
            entity_type: input.entity_type.clone(),
            entity_ref: input.entity_ref.clone(),
            metadata: input.metadata.clone(),
            expires_at: input.expires_at,
            source: input.source.clone(),
            fingerprint,
            status: AlertStatus::Open,
            created_at: now,
            updated_at: now,
        };

        match self.alerts.insert_alert(candidate).await? {
            Emission::Created(alert) => {
                tracing::info!(fingerprint = %alert.fingerprint, "alert created");
                Ok(UpsertedAlert {
                    outcome: UpsertOutcome::Created,
                    alert,
                })
            }
            // A concurrent writer got there first; merge into its row.
            Emission::ConflictIgnored(existing) => self.refresh(existing, input, now).await,
        }
    }

    async fn refresh(
        &self,
        existing: Alert,
        input: AlertInput,
        now: DateTime<Utc>,
    ) -> CoreResult<UpsertedAlert> {
        // ---
        let merged = Alert {
            parcel_id: input.parcel_id,
            title: input.title,
            detail: input.detail,
            code: input.code,
            severity: input.severity,
            entity_type: input.entity_type,
            entity_ref: input.entity_ref,
            metadata: input.metadata,
            expires_at: input.expires_at,
            source: input.source,
            ..existing.clone()
        };

        if merged == existing {
            return Ok(UpsertedAlert {
                outcome: UpsertOutcome::Unchanged,
                alert: existing,
            });
        }

        let alert = self
            .alerts
            .update_alert(&Alert {
                updated_at: now,
                ..merged
            })
            .await?;
        tracing::debug!(fingerprint = %alert.fingerprint, "alert refreshed");
        Ok(UpsertedAlert {
            outcome: UpsertOutcome::Updated,
            alert,
        })
    }
}

/// Alerts raised by parcel and cycle lifecycle events.
pub mod lifecycle {
    use chrono::{DateTime, Utc};
    use serde_json::json;

    use super::AlertInput;
    use crate::models::Severity;

    const SOURCE: &str = "lifecycle";

    pub fn parcel_created(parcel_id: i64, parcel_name: &str) -> AlertInput {
        AlertInput {
            parcel_id,
            title: format!("Parcel {parcel_name} registered"),
            detail: "Assign a variety and open a cycle to start rule evaluation.".to_string(),
            code: "parcel_created".to_string(),
            severity: Severity::Info,
            entity_type: "parcel".to_string(),
            entity_ref: parcel_id.to_string(),
            metadata: json!({ "parcel_name": parcel_name }),
            expires_at: None,
            source: SOURCE.to_string(),
        }
    }

    pub fn cycle_closed(parcel_id: i64, cycle_id: i64, closed_at: DateTime<Utc>) -> AlertInput {
        AlertInput {
            parcel_id,
            title: "Cultivation cycle closed".to_string(),
            detail: format!("Cycle {cycle_id} closed at {}", closed_at.to_rfc3339()),
            code: "cycle_closed".to_string(),
            severity: Severity::Info,
            entity_type: "cycle".to_string(),
            entity_ref: cycle_id.to_string(),
            metadata: json!({ "cycle_id": cycle_id, "closed_at": closed_at }),
            expires_at: None,
            source: SOURCE.to_string(),
        }
    }

    pub fn stage_advanced(
        parcel_id: i64,
        cycle_id: i64,
        from_stage: Option<&str>,
        to_stage: &str,
    ) -> AlertInput {
        let detail = match from_stage {
            Some(from) => format!("Stage changed from {from} to {to_stage}"),
            None => format!("Stage set to {to_stage}"),
        };
        AlertInput {
            parcel_id,
            title: "Growth stage advanced".to_string(),
            detail,
            code: "stage_advanced".to_string(),
            severity: Severity::Info,
            entity_type: "cycle".to_string(),
            entity_ref: cycle_id.to_string(),
            metadata: json!({ "cycle_id": cycle_id, "from": from_stage, "to": to_stage }),
            expires_at: None,
            source: SOURCE.to_string(),
        }
    }

    pub fn parcel_without_active_cycle(parcel_id: i64) -> AlertInput {
        AlertInput {
            parcel_id,
            title: "Parcel has no active cycle".to_string(),
            detail: "Threshold rules cannot be matched to a growth stage.".to_string(),
            code: "parcel_without_active_cycle".to_string(),
            severity: Severity::Warning,
            entity_type: "parcel".to_string(),
            entity_ref: parcel_id.to_string(),
            metadata: json!({}),
            expires_at: None,
            source: SOURCE.to_string(),
        }
    }
}
