//! Configuration loader for the `agrosense-core` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Services never read the environment themselves;
//! they receive the values they need from the [`Config`] snapshot at
//! construction time.
use std::{env, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Result};
use chrono_tz::Tz;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional value of any `FromStr` type with a default value.
macro_rules! parse_env_or {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,

    /// Civil time zone for naive timestamps and bucket boundaries.
    pub field_tz: Tz,

    /// Use the store's grouped aggregate; `false` forces in-process grouping.
    pub native_grouping: bool,

    /// Upper bound on rows scanned by in-process grouping and history.
    pub fallback_scan_limit: usize,

    /// Raw examples retained per history bucket.
    pub history_samples_per_bucket: usize,

    /// A node is active while its last report is at most this old.
    pub node_active_window: Duration,

    /// Default lookback for rule evaluation.
    pub rule_lookback_minutes: u32,

    /// Offset applied to `schedule_time` of generated tasks.
    pub task_schedule_offset_minutes: u32,
}

impl Default for Config {
    fn default() -> Self {
        // ---
        Self {
            db_url: String::new(),
            db_pool_max: 5,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            field_tz: chrono_tz::America::Lima,
            native_grouping: true,
            fallback_scan_limit: 200_000,
            history_samples_per_bucket: 20,
            node_active_window: Duration::from_secs(600),
            rule_lookback_minutes: 60,
            task_schedule_offset_minutes: 60,
        }
    }
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BIND_ADDR` – listen address (default: `0.0.0.0:8080`)
/// - `FIELD_TIMEZONE` – IANA zone name (default: `America/Lima`)
/// - `NATIVE_GROUPING` – `true|false` (default: `true`)
/// - `FALLBACK_SCAN_LIMIT` – rows (default: 200000)
/// - `HISTORY_SAMPLES_PER_BUCKET` – (default: 20)
/// - `NODE_ACTIVE_WINDOW_SECS` – (default: 600)
/// - `RULE_LOOKBACK_MINUTES` – (default: 60)
/// - `TASK_SCHEDULE_OFFSET_MINUTES` – (default: 60)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let defaults = Config::default();

    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", defaults.db_pool_max);
    let bind_addr = parse_env_or!("BIND_ADDR", SocketAddr, defaults.bind_addr);
    let field_tz = env::var("FIELD_TIMEZONE")
        .ok()
        .map(|v| v.trim().parse::<Tz>())
        .transpose()
        .map_err(|e| anyhow!("Invalid FIELD_TIMEZONE: {}", e))?
        .unwrap_or(defaults.field_tz);
    let native_grouping = parse_env_or!("NATIVE_GROUPING", bool, defaults.native_grouping);
    let fallback_scan_limit =
        parse_env_or!("FALLBACK_SCAN_LIMIT", usize, defaults.fallback_scan_limit);
    let history_samples_per_bucket = parse_env_or!(
        "HISTORY_SAMPLES_PER_BUCKET",
        usize,
        defaults.history_samples_per_bucket
    );
    let node_active_secs = parse_env_or!(
        "NODE_ACTIVE_WINDOW_SECS",
        u64,
        defaults.node_active_window.as_secs()
    );
    let rule_lookback_minutes =
        parse_env_u32!("RULE_LOOKBACK_MINUTES", defaults.rule_lookback_minutes);
    let task_schedule_offset_minutes = parse_env_u32!(
        "TASK_SCHEDULE_OFFSET_MINUTES",
        defaults.task_schedule_offset_minutes
    );

    if fallback_scan_limit == 0 {
        return Err(anyhow!("FALLBACK_SCAN_LIMIT must be greater than zero"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        bind_addr,
        field_tz,
        native_grouping,
        fallback_scan_limit,
        history_samples_per_bucket,
        node_active_window: Duration::from_secs(node_active_secs),
        rule_lookback_minutes,
        task_schedule_offset_minutes,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL                 : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX                  : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR                    : {}", self.bind_addr);
        tracing::info!("  FIELD_TIMEZONE               : {}", self.field_tz);
        tracing::info!("  NATIVE_GROUPING              : {}", self.native_grouping);
        tracing::info!("  FALLBACK_SCAN_LIMIT          : {}", self.fallback_scan_limit);
        tracing::info!("  HISTORY_SAMPLES_PER_BUCKET   : {}", self.history_samples_per_bucket);
        tracing::info!("  NODE_ACTIVE_WINDOW_SECS      : {}", self.node_active_window.as_secs());
        tracing::info!("  RULE_LOOKBACK_MINUTES        : {}", self.rule_lookback_minutes);
        tracing::info!("  TASK_SCHEDULE_OFFSET_MINUTES : {}", self.task_schedule_offset_minutes);
    }
}

/// Replace the password segment of a connection URL with `****`.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
        }
    }
    db_url.to_string()
}
