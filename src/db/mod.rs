pub mod models;
pub mod writer;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{DaemonError, Result};

pub async fn create_pool(cfg: &Config) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .acquire_timeout(cfg.store_timeout)
        .connect(&cfg.database_url)
        .await
        .map_err(DaemonError::Persistence)
}

/// Verify the expected schema exists, creating anything missing.
///
/// Provisioning proper lives outside the daemon; this is a safety net so a
/// fresh database does not make every write fail. Safe to call on every
/// startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(DaemonError::Persistence)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS moisture_readings (
            id             UUID PRIMARY KEY,
            sensor_id      TEXT NOT NULL,
            recorded_at    TIMESTAMPTZ NOT NULL,
            moisture_level DOUBLE PRECISION NOT NULL,
            temperature    DOUBLE PRECISION,
            humidity       DOUBLE PRECISION,
            battery_level  DOUBLE PRECISION,
            raw_payload    TEXT NOT NULL,
            created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(DaemonError::Persistence)?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_sensor_time
            ON moisture_readings (sensor_id, recorded_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(DaemonError::Persistence)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_status (
            sensor_id        TEXT PRIMARY KEY,
            last_seen        TIMESTAMPTZ NOT NULL,
            status           TEXT NOT NULL,
            battery_level    DOUBLE PRECISION,
            location         TEXT,
            firmware_version TEXT,
            updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(DaemonError::Persistence)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id           UUID PRIMARY KEY,
            sensor_id    TEXT NOT NULL,
            alert_type   TEXT NOT NULL,
            severity     TEXT NOT NULL,
            message      TEXT NOT NULL,
            acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(DaemonError::Persistence)?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_open
            ON alerts (sensor_id, alert_type) WHERE NOT acknowledged;
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(DaemonError::Persistence)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS health_metrics (
            id          UUID PRIMARY KEY,
            recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            metric      TEXT NOT NULL,
            value       DOUBLE PRECISION NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(DaemonError::Persistence)?;

    tx.commit().await.map_err(DaemonError::Persistence)?;
    Ok(())
}
