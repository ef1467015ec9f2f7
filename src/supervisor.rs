//! Runtime Supervisor: bounds one invocation and guarantees orderly
//! shutdown.
//!
//! The daemon is launched repeatedly by an external scheduler, so the loop
//! here runs until the wall-clock budget expires, a termination signal
//! arrives, or the broker connection becomes unrecoverable. The health pass
//! runs exactly once, at the end of the invocation, on every termination
//! path; this trades alert latency (at most one scheduler interval) for a
//! deterministic, testable policy.

use chrono::Utc;
use tokio::{signal, time};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, models::SensorState, writer::Writer};
use crate::error::Result;
use crate::health::HealthEvaluator;
use crate::ingest;
use crate::mqtt::ConnectionManager;

/// Longest payload prefix echoed into logs for diagnosis.
const LOG_PAYLOAD_LIMIT: usize = 120;

/// Drive one bounded invocation end to end.
///
/// Setup failures (store unreachable, connect/subscribe budget exhausted)
/// and a mid-run unrecoverable connection loss surface as errors, which the
/// caller maps to a non-zero exit code. Deadline expiry and termination
/// signals are clean shutdowns.
pub async fn run(config: Config) -> Result<()> {
    let deadline = time::sleep(config.max_runtime);
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let pool = db::create_pool(&config).await?;
    db::ensure_schema(&pool).await?;
    info!("Database ready");
    let writer = Writer::new(pool, config.store_retry_attempts);

    let mut manager = ConnectionManager::new(&config);
    let mut readings_ingested = 0u64;
    let mut outcome: Result<()> = Ok(());

    // The deadline and signal futures cover the whole invocation, session
    // establishment included; a hung connect cannot outlive the budget.
    let established = tokio::select! {
        _ = &mut deadline => {
            info!("Max runtime reached before broker session established");
            false
        }
        _ = &mut shutdown => false,
        result = establish(&mut manager) => match result {
            Ok(()) => true,
            Err(e) => {
                outcome = Err(e);
                false
            }
        },
    };

    if established {
        info!(
            max_runtime_secs = config.max_runtime.as_secs(),
            "Ingesting until deadline or signal"
        );
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!(
                        max_runtime_secs = config.max_runtime.as_secs(),
                        "Max runtime reached, shutting down"
                    );
                    break;
                }
                _ = &mut shutdown => break,
                publish = manager.next_publish() => match publish {
                    Ok(publish) => {
                        if process_message(&writer, &publish.topic, &publish.payload).await {
                            readings_ingested += 1;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Broker connection unrecoverable");
                        outcome = Err(e);
                        break;
                    }
                },
            }
        }
    }

    // Once per invocation, after ingestion stops and before exit, so alerts
    // reflect everything this run persisted.
    let evaluator =
        HealthEvaluator::new(writer, config.thresholds.clone(), config.metrics_file.clone());
    if let Err(e) = evaluator.run(readings_ingested).await {
        error!(error = %e, "Health pass failed");
    }

    if established {
        manager.shutdown().await;
    }

    info!(readings_ingested, "Invocation complete");
    outcome
}

async fn establish(manager: &mut ConnectionManager) -> Result<()> {
    manager.connect().await?;
    manager.subscribe().await
}

/// Normalize and persist one message. Returns whether a reading was stored.
///
/// Validation and persistence failures are logged and dropped here; nothing
/// on this path may abort the connection loop.
async fn process_message(writer: &Writer, topic: &str, payload: &[u8]) -> bool {
    let delivered_at = Utc::now();

    let reading = match ingest::normalize(topic, payload, delivered_at) {
        Ok(reading) => reading,
        Err(e) => {
            warn!(
                topic = %topic,
                payload = %truncated(payload),
                error = %e,
                "Dropping invalid message"
            );
            return false;
        }
    };

    if let Err(e) = writer.store_reading(&reading).await {
        error!(sensor_id = %reading.sensor_id, error = %e, "Dropping reading, store failed");
        return false;
    }

    // last_seen is the delivery time: liveness means we heard from the
    // sensor just now, even when it reports an older device timestamp.
    if let Err(e) = writer
        .upsert_status(&reading.sensor_id, delivered_at, reading.battery_level, SensorState::Active)
        .await
    {
        error!(sensor_id = %reading.sensor_id, error = %e, "Status upsert failed");
    }

    debug!(
        sensor_id = %reading.sensor_id,
        moisture = reading.moisture_level,
        device_timestamp = reading.device_timestamp,
        "Reading stored"
    );
    true
}

fn truncated(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.len() <= LOG_PAYLOAD_LIMIT {
        text.into_owned()
    } else {
        let mut end = LOG_PAYLOAD_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Thresholds;
    use crate::error::DaemonError;

    fn config_with_store(database_url: &str) -> Config {
        Config {
            mqtt_host: "localhost".into(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic: "moisture/+/data".into(),
            mqtt_qos: 1,
            mqtt_keepalive: Duration::from_secs(60),
            client_id: "moisture-daemon-test".into(),
            connect_attempts: 1,
            reconnect_base: Duration::from_millis(10),
            reconnect_cap: Duration::from_millis(50),
            database_url: database_url.into(),
            db_pool_max: 1,
            store_retry_attempts: 1,
            store_timeout: Duration::from_millis(500),
            max_runtime: Duration::from_secs(5),
            metrics_file: None,
            thresholds: Thresholds::default(),
        }
    }

    // Setup failure must surface as Err so the process exits non-zero and
    // the scheduler can tell a failed run from a clean one. Port 9 on
    // loopback refuses immediately; no broker connection is ever attempted.
    #[tokio::test]
    async fn unreachable_store_fails_the_invocation() {
        let config = config_with_store("postgres://daemon:pw@127.0.0.1:9/moisture");
        let err = run(config).await.unwrap_err();
        assert!(matches!(err, DaemonError::Persistence(_)), "got: {err}");
    }

    #[test]
    fn short_payload_is_logged_whole() {
        assert_eq!(truncated(b"{\"moisture\":1}"), "{\"moisture\":1}");
    }

    #[test]
    fn long_payload_is_truncated() {
        let payload = vec![b'x'; 500];
        let logged = truncated(&payload);
        assert!(logged.starts_with(&"x".repeat(LOG_PAYLOAD_LIMIT)));
        assert!(logged.ends_with('…'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut payload = "é".repeat(100).into_bytes();
        payload.truncate(250);
        // Must not panic on a multi-byte boundary.
        let _ = truncated(&payload);
    }
}
