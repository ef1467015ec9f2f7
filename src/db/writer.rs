//! Persistence Writer: sole owner of the readings / status / alert tables.
//!
//! Every operation retries connectivity failures a bounded number of times and
//! then surfaces a [`DaemonError::Persistence`]; callers log it and keep going
//! so one bad write never stalls ingestion for the rest of the fleet.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::db::models::{AlertType, NewReading, SensorReading, SensorState, SensorStatus, Severity};
use crate::error::{DaemonError, Result};

const RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct Writer {
    pool: PgPool,
    retry_attempts: u32,
}

impl Writer {
    pub fn new(pool: PgPool, retry_attempts: u32) -> Self {
        Self { pool, retry_attempts: retry_attempts.max(1) }
    }

    /// Append one reading. Duplicate `(sensor_id, recorded_at)` pairs are
    /// accepted as-is; deduplication is a reporting concern, not ours.
    pub async fn store_reading(&self, reading: &NewReading) -> Result<()> {
        self.with_retry("store_reading", || async {
            sqlx::query(
                r#"
                INSERT INTO moisture_readings
                    (id, sensor_id, recorded_at, moisture_level,
                     temperature, humidity, battery_level, raw_payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&reading.sensor_id)
            .bind(reading.recorded_at)
            .bind(reading.moisture_level)
            .bind(reading.temperature)
            .bind(reading.humidity)
            .bind(reading.battery_level)
            .bind(&reading.raw_payload)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Insert-or-update the one status row for a sensor. `battery_level` is
    /// only written when supplied; `location` and `firmware_version` survive
    /// every upsert untouched.
    pub async fn upsert_status(
        &self,
        sensor_id: &str,
        last_seen: DateTime<Utc>,
        battery_level: Option<f64>,
        status: SensorState,
    ) -> Result<()> {
        self.with_retry("upsert_status", || async {
            sqlx::query(
                r#"
                INSERT INTO sensor_status (sensor_id, last_seen, status, battery_level, updated_at)
                VALUES ($1, $2, $3, $4, now())
                ON CONFLICT (sensor_id) DO UPDATE SET
                    last_seen     = EXCLUDED.last_seen,
                    status        = EXCLUDED.status,
                    battery_level = COALESCE(EXCLUDED.battery_level, sensor_status.battery_level),
                    updated_at    = now()
                "#,
            )
            .bind(sensor_id)
            .bind(last_seen)
            .bind(status.as_str())
            .bind(battery_level)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Flip a sensor to `inactive` without touching `last_seen`. Used by the
    /// health pass when a sensor has gone silent.
    pub async fn mark_inactive(&self, sensor_id: &str) -> Result<()> {
        self.with_retry("mark_inactive", || async {
            sqlx::query(
                r#"
                UPDATE sensor_status
                   SET status = 'inactive', updated_at = now()
                 WHERE sensor_id = $1 AND status <> 'inactive'
                "#,
            )
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Insert an alert unless an unacknowledged one for the same
    /// `(sensor_id, alert_type)` already exists. Returns whether a row was
    /// created, so the caller can log new alerts distinctly from suppressed
    /// ones.
    pub async fn record_alert(
        &self,
        sensor_id: &str,
        alert_type: AlertType,
        severity: Severity,
        message: &str,
    ) -> Result<bool> {
        self.with_retry("record_alert", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO alerts (id, sensor_id, alert_type, severity, message)
                SELECT $1, $2, $3, $4, $5
                 WHERE NOT EXISTS (
                        SELECT 1 FROM alerts
                         WHERE sensor_id = $2 AND alert_type = $3 AND NOT acknowledged
                       )
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(sensor_id)
            .bind(alert_type.as_str())
            .bind(severity.as_str())
            .bind(message)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// One-way `acknowledged` transition. Returns false when the alert does
    /// not exist or was already acknowledged.
    pub async fn acknowledge_alert(&self, alert_id: Uuid) -> Result<bool> {
        self.with_retry("acknowledge_alert", || async {
            let result = sqlx::query(
                "UPDATE alerts SET acknowledged = TRUE WHERE id = $1 AND NOT acknowledged",
            )
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// All known sensors, for the health scan.
    pub async fn list_status(&self) -> Result<Vec<SensorStatus>> {
        self.with_retry("list_status", || async {
            sqlx::query_as::<_, SensorStatus>(
                "SELECT * FROM sensor_status ORDER BY sensor_id",
            )
            .fetch_all(&self.pool)
            .await
        })
        .await
    }

    /// The most recent reading for one sensor, if any.
    pub async fn latest_reading(&self, sensor_id: &str) -> Result<Option<SensorReading>> {
        self.with_retry("latest_reading", || async {
            sqlx::query_as::<_, SensorReading>(
                r#"
                SELECT * FROM moisture_readings
                 WHERE sensor_id = $1
                 ORDER BY recorded_at DESC
                 LIMIT 1
                "#,
            )
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await
        })
        .await
    }

    /// Operational self-reporting row, written by the health pass.
    pub async fn record_metric(&self, metric: &str, value: f64) -> Result<()> {
        self.with_retry("record_metric", || async {
            sqlx::query("INSERT INTO health_metrics (id, metric, value) VALUES ($1, $2, $3)")
                .bind(Uuid::new_v4())
                .bind(metric)
                .bind(value)
                .execute(&self.pool)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Run `op`, retrying connectivity failures up to the configured attempt
    /// budget. Non-transient errors (constraint violations, bad SQL) surface
    /// immediately.
    async fn with_retry<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt < self.retry_attempts => {
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.retry_attempts,
                        error = %e,
                        "Store operation failed, retrying"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(DaemonError::Persistence(e)),
            }
        }
    }
}

/// Connectivity-flavoured failures are worth retrying; anything else is a
/// programming or data error that a retry cannot fix.
fn is_transient(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn row_not_found_is_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }
}
