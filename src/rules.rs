//! Threshold rule evaluation.
//!
//! For one parcel: resolve the rules of its current stage (or, without a
//! stage, the generic rules of its variety), compare each rule against the
//! latest reading of its parameter and persist one follow-up task per
//! `(rule, triggering reading timestamp)`. A failing rule never stops the
//! others; failures are collected in the summary.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::alerts::{lifecycle, AlertInput, AlertTaskEmitter};
use crate::error::{CoreError, CoreResult};
use crate::models::{NewTask, ParcelContext, Reading, Severity, Task, TaskOrigin, ThresholdRule};
use crate::store::{CatalogStore, Emission, ReadingStore, TaskStore};

// ---

pub const TASK_KIND: &str = "threshold_action";
pub const BREACH_ALERT_CODE: &str = "rule_breach";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachDirection {
    Below,
    Above,
}

impl fmt::Display for BreachDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreachDirection::Below => f.write_str("below"),
            BreachDirection::Above => f.write_str("above"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Breach<'a> {
    pub direction: BreachDirection,
    pub action: &'a str,
}

/// Compare `value` with the rule bounds. `None` when inside the bounds or
/// when the breached side has no configured action.
pub fn detect_breach(rule: &ThresholdRule, value: f64) -> Option<Breach<'_>> {
    // ---
    let (direction, action) = match (rule.min, rule.max) {
        (Some(min), _) if value < min => (BreachDirection::Below, rule.action_below.as_deref()),
        (_, Some(max)) if value > max => (BreachDirection::Above, rule.action_above.as_deref()),
        _ => return None,
    };
    let action = action.map(str::trim).filter(|a| !a.is_empty())?;
    Some(Breach { direction, action })
}

/// `rule:{rule_id}:last:{timestamp}` with the timestamp in RFC 3339 UTC.
pub fn rule_fingerprint(rule_id: i64, triggered_at: DateTime<Utc>) -> String {
    format!(
        "rule:{rule_id}:last:{}",
        triggered_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub rule_id: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub parcel_id: i64,
    pub rules_evaluated: usize,
    pub created_tasks: Vec<Task>,
    /// Rules without a reading inside the lookback window.
    pub without_data: usize,
    /// Breaches already covered by an existing task.
    pub already_emitted: usize,
    pub failures: Vec<RuleFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationSummary {
    fn new(parcel_id: i64) -> Self {
        Self {
            parcel_id,
            rules_evaluated: 0,
            created_tasks: Vec::new(),
            without_data: 0,
            already_emitted: 0,
            failures: Vec::new(),
            error: None,
        }
    }

    fn record_failure(&mut self, rule_id: i64, err: impl fmt::Display) {
        tracing::warn!(parcel_id = self.parcel_id, rule_id, error = %err, "rule evaluation failed");
        self.failures.push(RuleFailure {
            rule_id,
            message: err.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParcelFailure {
    pub parcel_id: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub parcels_evaluated: usize,
    pub parcels_without_cycle: Vec<i64>,
    pub created_tasks: usize,
    pub summaries: Vec<EvaluationSummary>,
    pub failures: Vec<ParcelFailure>,
}

enum RuleOutcome {
    NoData,
    WithinBounds,
    AlreadyEmitted,
    Created(Task),
}

pub struct RuleEngine {
    catalog: Arc<dyn CatalogStore>,
    readings: Arc<dyn ReadingStore>,
    tasks: Arc<dyn TaskStore>,
    emitter: Arc<AlertTaskEmitter>,
    default_lookback: Duration,
    schedule_offset: Duration,
}

impl RuleEngine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        readings: Arc<dyn ReadingStore>,
        tasks: Arc<dyn TaskStore>,
        emitter: Arc<AlertTaskEmitter>,
    ) -> Self {
        Self {
            catalog,
            readings,
            tasks,
            emitter,
            default_lookback: Duration::minutes(60),
            schedule_offset: Duration::hours(1),
        }
    }

    pub fn with_default_lookback(mut self, minutes: u32) -> Self {
        self.default_lookback = Duration::minutes(i64::from(minutes));
        self
    }

    pub fn with_schedule_offset(mut self, minutes: u32) -> Self {
        self.schedule_offset = Duration::minutes(i64::from(minutes));
        self
    }

    /// Evaluate every active rule that applies to the parcel.
    ///
    /// Fails only when the parcel is unknown or its rules cannot be loaded;
    /// per-rule problems end up in [`EvaluationSummary::failures`].
    pub async fn evaluate_rules(
        &self,
        parcel_id: i64,
        lookback_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> CoreResult<EvaluationSummary> {
        // ---
        let context = self
            .catalog
            .parcel_context(parcel_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("parcel {parcel_id}")))?;
        self.evaluate_context(&context, lookback_minutes, now).await
    }

    async fn evaluate_context(
        &self,
        context: &ParcelContext,
        lookback_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> CoreResult<EvaluationSummary> {
        // ---
        let lookback = lookback_minutes
            .map(|m| Duration::minutes(i64::from(m)))
            .unwrap_or(self.default_lookback);
        let since = now - lookback;

        let rules = self.applicable_rules(context).await?;
        let mut summary = EvaluationSummary::new(context.parcel_id);

        for rule in rules.iter().filter(|r| r.active) {
            summary.rules_evaluated += 1;
            match self.evaluate_rule(context.parcel_id, rule, since, now).await {
                Ok(RuleOutcome::NoData) => summary.without_data += 1,
                Ok(RuleOutcome::WithinBounds) => {}
                Ok(RuleOutcome::AlreadyEmitted) => summary.already_emitted += 1,
                Ok(RuleOutcome::Created(task)) => {
                    if let Err(err) = self.emit_breach_alert(&task, rule, now).await {
                        summary.record_failure(rule.id, err);
                    }
                    summary.created_tasks.push(task);
                }
                Err(err) => summary.record_failure(rule.id, err),
            }
        }

        if !summary.failures.is_empty() {
            summary.error = Some(format!(
                "{} of {} rules failed",
                summary.failures.len(),
                summary.rules_evaluated
            ));
        }

        tracing::info!(
            parcel_id = context.parcel_id,
            rules_evaluated = summary.rules_evaluated,
            created = summary.created_tasks.len(),
            failed = summary.failures.len(),
            "rules evaluated"
        );
        Ok(summary)
    }

    /// Stage rules when a stage is set, otherwise generic variety rules.
    async fn applicable_rules(&self, context: &ParcelContext) -> CoreResult<Vec<ThresholdRule>> {
        // ---
        let rules = match (context.stage_id, context.variety_id) {
            (Some(stage_id), _) => self.catalog.rules_for_stage(stage_id).await?,
            (None, Some(variety_id)) => self.catalog.rules_for_variety(variety_id).await?,
            (None, None) => Vec::new(),
        };
        Ok(rules)
    }

    async fn evaluate_rule(
        &self,
        parcel_id: i64,
        rule: &ThresholdRule,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<RuleOutcome> {
        // ---
        let Some(reading) = self
            .readings
            .latest_reading(parcel_id, &rule.parameter_name, since, now)
            .await?
        else {
            return Ok(RuleOutcome::NoData);
        };

        let Some(breach) = detect_breach(rule, reading.value) else {
            return Ok(RuleOutcome::WithinBounds);
        };

        let fingerprint = rule_fingerprint(rule.id, reading.timestamp);
        if self.tasks.find_live_task(&fingerprint).await?.is_some() {
            return Ok(RuleOutcome::AlreadyEmitted);
        }

        let task = NewTask {
            parcel_id,
            kind: TASK_KIND.to_string(),
            description: breach.action.to_string(),
            origin: TaskOrigin::RuleEngine,
            snapshot: breach_snapshot(rule, &reading, &breach),
            fingerprint,
            schedule_time: now + self.schedule_offset,
        };

        // The unique fingerprint settles races between overlapping runs.
        match self.tasks.insert_task(task).await? {
            Emission::Created(task) => {
                tracing::info!(
                    parcel_id,
                    rule_id = rule.id,
                    fingerprint = %task.fingerprint,
                    direction = %breach.direction,
                    "task created from rule breach"
                );
                Ok(RuleOutcome::Created(task))
            }
            Emission::ConflictIgnored(_) => Ok(RuleOutcome::AlreadyEmitted),
        }
    }

    async fn emit_breach_alert(
        &self,
        task: &Task,
        rule: &ThresholdRule,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        // ---
        let direction = task
            .snapshot
            .get("direction")
            .and_then(JsonValue::as_str)
            .unwrap_or("out of range");
        let input = AlertInput {
            parcel_id: task.parcel_id,
            title: format!("{} {direction} threshold", rule.parameter_name),
            detail: task.description.clone(),
            code: BREACH_ALERT_CODE.to_string(),
            severity: Severity::Warning,
            entity_type: "rule".to_string(),
            entity_ref: rule.id.to_string(),
            metadata: task.snapshot.clone(),
            expires_at: None,
            source: TaskOrigin::RuleEngine.as_str().to_string(),
        };
        self.emitter.upsert_alert(input, now).await?;
        Ok(())
    }

    /// Evaluate every parcel with an open cycle. Parcels without one get a
    /// `parcel_without_active_cycle` alert instead.
    pub async fn evaluate_active_parcels(
        &self,
        lookback_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> CoreResult<BatchSummary> {
        // ---
        let parcel_ids = self.catalog.parcel_ids().await?;
        let mut batch = BatchSummary {
            parcels_evaluated: 0,
            parcels_without_cycle: Vec::new(),
            created_tasks: 0,
            summaries: Vec::new(),
            failures: Vec::new(),
        };

        for parcel_id in parcel_ids {
            let result = match self.catalog.parcel_context(parcel_id).await {
                Ok(Some(context)) if context.cycle_id.is_none() => {
                    batch.parcels_without_cycle.push(parcel_id);
                    self.emitter
                        .upsert_alert(lifecycle::parcel_without_active_cycle(parcel_id), now)
                        .await
                        .map(|_| None)
                }
                Ok(Some(context)) => self
                    .evaluate_context(&context, lookback_minutes, now)
                    .await
                    .map(Some),
                // Deleted between listing and lookup.
                Ok(None) => Ok(None),
                Err(err) => Err(err.into()),
            };

            match result {
                Ok(Some(summary)) => {
                    batch.parcels_evaluated += 1;
                    batch.created_tasks += summary.created_tasks.len();
                    batch.summaries.push(summary);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(parcel_id, error = %err, "parcel evaluation failed");
                    batch.failures.push(ParcelFailure {
                        parcel_id,
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(batch)
    }
}

fn breach_snapshot(rule: &ThresholdRule, reading: &Reading, breach: &Breach<'_>) -> JsonValue {
    json!({
        "rule_id": rule.id,
        "parameter": rule.parameter_name,
        "value": reading.value,
        "unit": reading.unit,
        "min": rule.min,
        "max": rule.max,
        "action": breach.action,
        "direction": breach.direction,
        "priority": rule.priority,
        "stage_id": rule.stage_id,
        "variety_id": rule.variety_id,
        "node_code": reading.node_code,
        "reading_id": reading.id,
        "reading_timestamp": reading.timestamp,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn rule(min: Option<f64>, max: Option<f64>) -> ThresholdRule {
        ThresholdRule {
            id: 9,
            stage_id: Some(1),
            variety_id: None,
            parameter_name: "temperatura".into(),
            min,
            max,
            action_below: Some("Cubrir plantas".into()),
            action_above: Some("Activar riego".into()),
            active: true,
            priority: 0,
            effective_from: None,
            effective_to: None,
        }
    }

    #[test]
    fn test_breach_directions() {
        // ---
        let r = rule(Some(18.0), Some(30.0));
        assert_eq!(detect_breach(&r, 15.0).unwrap().direction, BreachDirection::Below);
        assert_eq!(detect_breach(&r, 15.0).unwrap().action, "Cubrir plantas");
        assert_eq!(detect_breach(&r, 31.0).unwrap().direction, BreachDirection::Above);
        assert!(detect_breach(&r, 18.0).is_none());
        assert!(detect_breach(&r, 30.0).is_none());
    }

    #[test]
    fn test_open_bounds() {
        // ---
        let only_max = rule(None, Some(30.0));
        assert!(detect_breach(&only_max, -40.0).is_none());
        assert!(detect_breach(&only_max, 30.5).is_some());

        let unbounded = rule(None, None);
        assert!(detect_breach(&unbounded, 1e9).is_none());
    }

    #[test]
    fn test_blank_action_means_no_breach() {
        // ---
        let mut r = rule(Some(18.0), Some(30.0));
        r.action_below = Some("   ".into());
        r.action_above = None;
        assert!(detect_breach(&r, 10.0).is_none());
        assert!(detect_breach(&r, 40.0).is_none());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        // ---
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 10, 45, 0).unwrap();
        let a = rule_fingerprint(9, ts);
        let b = rule_fingerprint(9, ts);
        assert_eq!(a, b);
        assert_eq!(a, "rule:9:last:2025-06-02T10:45:00.000000Z");
        assert_ne!(a, rule_fingerprint(10, ts));
    }
}
