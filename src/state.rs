//! Explicitly constructed service graph shared by the HTTP handlers.

use std::sync::Arc;

use crate::aggregation::AggregationPipeline;
use crate::alerts::AlertTaskEmitter;
use crate::history::HistoryGrouper;
use crate::latest::LatestStateResolver;
use crate::rules::RuleEngine;
use crate::store::{AlertStore, CatalogStore, ReadingStore, TaskStore};
use crate::Config;

// ---

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub aggregation: Arc<AggregationPipeline>,
    pub history: Arc<HistoryGrouper>,
    pub latest: Arc<LatestStateResolver>,
    pub rules: Arc<RuleEngine>,
    pub alerts: Arc<AlertTaskEmitter>,
}

impl AppState {
    /// Wire every service to one store handle built at startup.
    pub fn build<S>(store: Arc<S>, config: Config) -> Self
    where
        S: ReadingStore + CatalogStore + TaskStore + AlertStore + 'static,
    {
        // ---
        let readings: Arc<dyn ReadingStore> = store.clone();
        let catalog: Arc<dyn CatalogStore> = store.clone();
        let tasks: Arc<dyn TaskStore> = store.clone();
        let alert_store: Arc<dyn AlertStore> = store;

        let alerts = Arc::new(AlertTaskEmitter::new(alert_store));
        let rules = RuleEngine::new(catalog, readings.clone(), tasks, alerts.clone())
            .with_default_lookback(config.rule_lookback_minutes)
            .with_schedule_offset(config.task_schedule_offset_minutes);

        Self {
            aggregation: Arc::new(AggregationPipeline::new(
                readings.clone(),
                config.field_tz,
                config.fallback_scan_limit,
            )),
            history: Arc::new(HistoryGrouper::new(
                readings.clone(),
                config.field_tz,
                config.history_samples_per_bucket,
                config.fallback_scan_limit,
            )),
            latest: Arc::new(LatestStateResolver::new(readings, config.node_active_window)),
            rules: Arc::new(rules),
            alerts,
            config,
        }
    }
}
