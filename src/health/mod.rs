//! Health Evaluator: scans the fleet's persisted state against thresholds
//! and raises alerts.
//!
//! The decision logic is pure (`evaluate_sensor`) so thresholds and clocks
//! can be injected in tests; the async driver around it does the scanning and
//! writing. Runs once at the end of each invocation, on every termination
//! path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Thresholds;
use crate::db::models::{AlertType, Severity};
use crate::db::writer::Writer;
use crate::error::Result;

/// Battery tiers for severity scaling, independent of the configured alert
/// threshold.
const BATTERY_CRITICAL: f64 = 10.0;
const BATTERY_HIGH: f64 = 25.0;

// ---------------------------------------------------------------------------
// Pure decision core
// ---------------------------------------------------------------------------

/// Everything the checks need to know about one sensor: its status row plus
/// the measurements of its most recent reading, if it has one.
#[derive(Debug, Clone)]
pub struct SensorSnapshot {
    pub sensor_id: String,
    pub last_seen: DateTime<Utc>,
    pub battery_level: Option<f64>,
    pub moisture_level: Option<f64>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertDecision {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    /// The sensor has been silent past the staleness threshold and should be
    /// marked inactive.
    pub offline: bool,
    pub alerts: Vec<AlertDecision>,
}

/// Apply all threshold checks to one sensor, in fixed order: offline,
/// battery, moisture, temperature. The checks are independent; a sensor can
/// accumulate several alerts at once.
///
/// A gap of exactly `staleness_secs` is still online; one second past it is
/// offline.
pub fn evaluate_sensor(
    snapshot: &SensorSnapshot,
    thresholds: &Thresholds,
    now: DateTime<Utc>,
) -> Evaluation {
    let mut alerts = Vec::new();

    let silent_secs = (now - snapshot.last_seen).num_seconds();
    let offline = silent_secs > thresholds.staleness_secs;
    if offline {
        alerts.push(AlertDecision {
            alert_type: AlertType::SensorOffline,
            severity: Severity::High,
            message: format!(
                "Sensor {} silent for {}s (threshold {}s)",
                snapshot.sensor_id, silent_secs, thresholds.staleness_secs
            ),
        });
    }

    if let Some(battery) = snapshot.battery_level {
        if battery < thresholds.battery_low {
            let severity = if battery < BATTERY_CRITICAL {
                Severity::Critical
            } else if battery < BATTERY_HIGH {
                Severity::High
            } else {
                Severity::Medium
            };
            alerts.push(AlertDecision {
                alert_type: AlertType::LowBattery,
                severity,
                message: format!(
                    "Low battery: {battery:.1}% (threshold {:.1}%)",
                    thresholds.battery_low
                ),
            });
        }
    }

    if let Some(moisture) = snapshot.moisture_level {
        if moisture < thresholds.moisture_low {
            alerts.push(AlertDecision {
                alert_type: AlertType::LowMoisture,
                severity: Severity::Medium,
                message: format!(
                    "Low moisture: {moisture:.1}% (threshold {:.1}%)",
                    thresholds.moisture_low
                ),
            });
        }
    }

    if let Some(temperature) = snapshot.temperature {
        if temperature > thresholds.temperature_high {
            alerts.push(AlertDecision {
                alert_type: AlertType::HighTemperature,
                severity: Severity::Medium,
                message: format!(
                    "High temperature: {temperature:.1}\u{b0}C (threshold {:.1}\u{b0}C)",
                    thresholds.temperature_high
                ),
            });
        }
    }

    Evaluation { offline, alerts }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub sensors_seen: u64,
    pub offline_sensors: u64,
    pub alerts_raised: u64,
    pub alerts_suppressed: u64,
}

#[derive(Serialize)]
struct SensorReport {
    sensor_id: String,
    status: String,
    last_seen: DateTime<Utc>,
    moisture_level: Option<f64>,
    temperature: Option<f64>,
    battery_level: Option<f64>,
    alerts: Vec<String>,
}

/// JSON document dumped to the metrics file for external monitoring.
#[derive(Serialize)]
struct MetricsSnapshot {
    generated_at: DateTime<Utc>,
    readings_ingested: u64,
    summary: HealthSummary,
    sensors: Vec<SensorReport>,
}

pub struct HealthEvaluator {
    writer: Writer,
    thresholds: Thresholds,
    metrics_file: Option<String>,
}

impl HealthEvaluator {
    pub fn new(writer: Writer, thresholds: Thresholds, metrics_file: Option<String>) -> Self {
        Self { writer, thresholds, metrics_file }
    }

    /// One full pass over every known sensor. Per-sensor persistence
    /// failures are logged and skipped so one bad row cannot sink the whole
    /// evaluation; only failing to list the fleet at all is an error.
    pub async fn run(&self, readings_ingested: u64) -> Result<HealthSummary> {
        let now = Utc::now();
        let statuses = self.writer.list_status().await?;

        let mut summary = HealthSummary::default();
        let mut reports = Vec::with_capacity(statuses.len());

        for status in statuses {
            summary.sensors_seen += 1;

            let latest = match self.writer.latest_reading(&status.sensor_id).await {
                Ok(reading) => reading,
                Err(e) => {
                    error!(sensor_id = %status.sensor_id, error = %e,
                        "Skipping sensor, could not load latest reading");
                    continue;
                }
            };

            let snapshot = SensorSnapshot {
                sensor_id: status.sensor_id.clone(),
                last_seen: status.last_seen,
                battery_level: status.battery_level,
                moisture_level: latest.as_ref().map(|r| r.moisture_level),
                temperature: latest.as_ref().and_then(|r| r.temperature),
            };

            let evaluation = evaluate_sensor(&snapshot, &self.thresholds, now);

            if evaluation.offline {
                summary.offline_sensors += 1;
                if let Err(e) = self.writer.mark_inactive(&status.sensor_id).await {
                    error!(sensor_id = %status.sensor_id, error = %e,
                        "Failed to mark sensor inactive");
                }
            }

            let mut alert_lines = Vec::with_capacity(evaluation.alerts.len());
            for alert in &evaluation.alerts {
                alert_lines.push(alert.message.clone());
                match self
                    .writer
                    .record_alert(
                        &status.sensor_id,
                        alert.alert_type,
                        alert.severity,
                        &alert.message,
                    )
                    .await
                {
                    Ok(true) => {
                        summary.alerts_raised += 1;
                        warn!(
                            sensor_id = %status.sensor_id,
                            alert_type = alert.alert_type.as_str(),
                            severity = alert.severity.as_str(),
                            message = %alert.message,
                            "Alert raised"
                        );
                    }
                    Ok(false) => {
                        summary.alerts_suppressed += 1;
                        debug!(
                            sensor_id = %status.sensor_id,
                            alert_type = alert.alert_type.as_str(),
                            "Alert already open, suppressed"
                        );
                    }
                    Err(e) => {
                        error!(sensor_id = %status.sensor_id, error = %e,
                            "Failed to record alert");
                    }
                }
            }

            reports.push(SensorReport {
                sensor_id: status.sensor_id,
                status: if evaluation.offline { "inactive".into() } else { status.status },
                last_seen: status.last_seen,
                moisture_level: snapshot.moisture_level,
                temperature: snapshot.temperature,
                battery_level: snapshot.battery_level,
                alerts: alert_lines,
            });
        }

        self.record_metrics(readings_ingested, &summary).await;
        self.save_snapshot(now, readings_ingested, &summary, reports);

        info!(
            sensors = summary.sensors_seen,
            offline = summary.offline_sensors,
            raised = summary.alerts_raised,
            suppressed = summary.alerts_suppressed,
            "Health pass complete"
        );
        Ok(summary)
    }

    /// Self-reporting rows; best effort, a failure here must not fail the
    /// pass.
    async fn record_metrics(&self, readings_ingested: u64, summary: &HealthSummary) {
        let metrics = [
            ("readings_ingested", readings_ingested as f64),
            ("sensors_seen", summary.sensors_seen as f64),
            ("sensors_offline", summary.offline_sensors as f64),
            ("alerts_raised", summary.alerts_raised as f64),
        ];
        for (metric, value) in metrics {
            if let Err(e) = self.writer.record_metric(metric, value).await {
                error!(metric, error = %e, "Failed to record health metric");
            }
        }
    }

    fn save_snapshot(
        &self,
        generated_at: DateTime<Utc>,
        readings_ingested: u64,
        summary: &HealthSummary,
        sensors: Vec<SensorReport>,
    ) {
        let Some(path) = &self.metrics_file else { return };

        let snapshot = MetricsSnapshot {
            generated_at,
            readings_ingested,
            summary: summary.clone(),
            sensors,
        };

        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    error!(path = %path, error = %e, "Failed to write metrics snapshot");
                } else {
                    info!(path = %path, "Metrics snapshot written");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize metrics snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn thresholds() -> Thresholds {
        Thresholds {
            moisture_low: 20.0,
            temperature_high: 40.0,
            battery_low: 25.0,
            staleness_secs: 3600,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 12, 12, 0, 0).unwrap()
    }

    fn snapshot(last_seen_ago_secs: i64) -> SensorSnapshot {
        SensorSnapshot {
            sensor_id: "s1".into(),
            last_seen: now() - ChronoDuration::seconds(last_seen_ago_secs),
            battery_level: None,
            moisture_level: None,
            temperature: None,
        }
    }

    #[test]
    fn healthy_sensor_raises_nothing() {
        let mut s = snapshot(60);
        s.battery_level = Some(90.0);
        s.moisture_level = Some(50.0);
        s.temperature = Some(22.0);

        let e = evaluate_sensor(&s, &thresholds(), now());
        assert!(!e.offline);
        assert!(e.alerts.is_empty());
    }

    #[test]
    fn exactly_at_staleness_threshold_is_still_online() {
        let e = evaluate_sensor(&snapshot(3600), &thresholds(), now());
        assert!(!e.offline);
        assert!(e.alerts.is_empty());
    }

    #[test]
    fn one_second_past_staleness_threshold_is_offline() {
        let e = evaluate_sensor(&snapshot(3601), &thresholds(), now());
        assert!(e.offline);
        assert_eq!(e.alerts.len(), 1);
        assert_eq!(e.alerts[0].alert_type, AlertType::SensorOffline);
        assert_eq!(e.alerts[0].severity, Severity::High);
    }

    #[test]
    fn battery_severity_scales_with_depth() {
        for (battery, severity) in [
            (24.0, Severity::Medium),
            (20.0, Severity::High),
            (9.0, Severity::Critical),
        ] {
            let mut s = snapshot(60);
            s.battery_level = Some(battery);
            // Widen the gate so every tier is below it.
            let mut t = thresholds();
            t.battery_low = 30.0;

            let e = evaluate_sensor(&s, &t, now());
            assert_eq!(e.alerts.len(), 1, "battery {battery}");
            assert_eq!(e.alerts[0].alert_type, AlertType::LowBattery);
            assert_eq!(e.alerts[0].severity, severity, "battery {battery}");
        }
    }

    #[test]
    fn battery_at_threshold_does_not_fire() {
        let mut s = snapshot(60);
        s.battery_level = Some(25.0);
        let e = evaluate_sensor(&s, &thresholds(), now());
        assert!(e.alerts.is_empty());
    }

    #[test]
    fn missing_battery_never_fires() {
        let e = evaluate_sensor(&snapshot(60), &thresholds(), now());
        assert!(e.alerts.iter().all(|a| a.alert_type != AlertType::LowBattery));
    }

    #[test]
    fn low_moisture_fires_below_threshold() {
        let mut s = snapshot(60);
        s.moisture_level = Some(10.0);
        let e = evaluate_sensor(&s, &thresholds(), now());
        assert_eq!(e.alerts.len(), 1);
        assert_eq!(e.alerts[0].alert_type, AlertType::LowMoisture);
    }

    #[test]
    fn high_temperature_fires_above_threshold() {
        let mut s = snapshot(60);
        s.temperature = Some(45.5);
        let e = evaluate_sensor(&s, &thresholds(), now());
        assert_eq!(e.alerts.len(), 1);
        assert_eq!(e.alerts[0].alert_type, AlertType::HighTemperature);
        assert!(e.alerts[0].message.contains("45.5"));
    }

    #[test]
    fn checks_are_independent_and_ordered() {
        let mut s = snapshot(7200);
        s.battery_level = Some(5.0);
        s.moisture_level = Some(1.0);
        s.temperature = Some(50.0);

        let e = evaluate_sensor(&s, &thresholds(), now());
        assert!(e.offline);
        let types: Vec<_> = e.alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(
            types,
            vec![
                AlertType::SensorOffline,
                AlertType::LowBattery,
                AlertType::LowMoisture,
                AlertType::HighTemperature,
            ]
        );
    }

    #[test]
    fn zero_moisture_is_a_real_value_that_fires() {
        let mut s = snapshot(60);
        s.moisture_level = Some(0.0);
        let e = evaluate_sensor(&s, &thresholds(), now());
        assert_eq!(e.alerts.len(), 1);
        assert_eq!(e.alerts[0].alert_type, AlertType::LowMoisture);
    }
}
