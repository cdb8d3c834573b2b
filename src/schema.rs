//! Database schema management for `agrosense-core`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).
//! Catalog tables (varieties, stages, parcels, cycles, rules) are edited by
//! other services; this service only reads them.

use anyhow::Result;
use sqlx::PgPool;

// ---

const STATEMENTS: &[&str] = &[
    // Append-only reading store
    r#"
    CREATE TABLE IF NOT EXISTS sensor_readings (
        id           BIGSERIAL        PRIMARY KEY,
        parcel_id    BIGINT           NOT NULL,
        node_code    TEXT             NOT NULL,
        sensor_type  TEXT             NOT NULL,
        value        DOUBLE PRECISION NOT NULL,
        unit         TEXT,
        recorded_at  TIMESTAMPTZ      NOT NULL,
        metadata     JSONB
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_readings_parcel_type_time
        ON sensor_readings (parcel_id, sensor_type, recorded_at);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_readings_parcel_node_time
        ON sensor_readings (parcel_id, node_code, sensor_type, recorded_at DESC, id DESC);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_states (
        parcel_id  BIGINT NOT NULL,
        node_code  TEXT   NOT NULL,
        battery    DOUBLE PRECISION,
        signal     DOUBLE PRECISION,
        last_seen  TIMESTAMPTZ,
        PRIMARY KEY (parcel_id, node_code)
    );
    "#,
    // Catalog
    r#"
    CREATE TABLE IF NOT EXISTS varieties (
        id         BIGSERIAL PRIMARY KEY,
        crop_name  TEXT NOT NULL,
        name       TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stages (
        id          BIGSERIAL PRIMARY KEY,
        variety_id  BIGINT  NOT NULL REFERENCES varieties (id),
        name        TEXT    NOT NULL,
        position    INTEGER NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parcels (
        id          BIGSERIAL   PRIMARY KEY,
        name        TEXT        NOT NULL,
        variety_id  BIGINT      REFERENCES varieties (id),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cycles (
        id                BIGSERIAL   PRIMARY KEY,
        parcel_id         BIGINT      NOT NULL REFERENCES parcels (id),
        variety_id        BIGINT      REFERENCES varieties (id),
        current_stage_id  BIGINT      REFERENCES stages (id),
        started_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        closed_at         TIMESTAMPTZ
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS threshold_rules (
        id              BIGSERIAL        PRIMARY KEY,
        stage_id        BIGINT           REFERENCES stages (id),
        variety_id      BIGINT           REFERENCES varieties (id),
        parameter_name  TEXT             NOT NULL,
        min_value       DOUBLE PRECISION,
        max_value       DOUBLE PRECISION,
        action_below    TEXT,
        action_above    TEXT,
        active          BOOLEAN          NOT NULL DEFAULT TRUE,
        priority        INTEGER          NOT NULL DEFAULT 0,
        effective_from  TIMESTAMPTZ,
        effective_to    TIMESTAMPTZ
    );
    "#,
    // Emitted artifacts. The UNIQUE fingerprint is the idempotency guarantee.
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id              UUID        PRIMARY KEY,
        parcel_id       BIGINT      NOT NULL,
        kind            TEXT        NOT NULL,
        description     TEXT        NOT NULL,
        origin          TEXT        NOT NULL,
        decision_state  TEXT        NOT NULL,
        snapshot        JSONB       NOT NULL,
        fingerprint     TEXT        NOT NULL UNIQUE,
        schedule_time   TIMESTAMPTZ NOT NULL,
        status          TEXT        NOT NULL,
        soft_deleted    BOOLEAN     NOT NULL DEFAULT FALSE,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id           UUID        PRIMARY KEY,
        parcel_id    BIGINT      NOT NULL,
        title        TEXT        NOT NULL,
        detail       TEXT        NOT NULL,
        code         TEXT        NOT NULL,
        severity     TEXT        NOT NULL,
        entity_type  TEXT        NOT NULL,
        entity_ref   TEXT        NOT NULL,
        metadata     JSONB       NOT NULL,
        expires_at   TIMESTAMPTZ,
        source       TEXT        NOT NULL,
        fingerprint  TEXT        NOT NULL UNIQUE,
        status       TEXT        NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasks_parcel_id
        ON tasks (parcel_id);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_alerts_parcel_id
        ON alerts (parcel_id);
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::debug!("Schema ensured ({} statements)", STATEMENTS.len());
    Ok(())
}
