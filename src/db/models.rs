use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::DaemonError;

// ---------------------------------------------------------------------------
// Enums (stored as TEXT)
// ---------------------------------------------------------------------------

/// Liveness classification of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    Active,
    Inactive,
    Error,
}

impl SensorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }
}

impl FromStr for SensorState {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "error" => Ok(Self::Error),
            other => Err(DaemonError::validation(format!(
                "unknown sensor state: {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    LowMoisture,
    LowBattery,
    SensorOffline,
    HighTemperature,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowMoisture => "low_moisture",
            Self::LowBattery => "low_battery",
            Self::SensorOffline => "sensor_offline",
            Self::HighTemperature => "high_temperature",
        }
    }
}

impl FromStr for AlertType {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_moisture" => Ok(Self::LowMoisture),
            "low_battery" => Ok(Self::LowBattery),
            "sensor_offline" => Ok(Self::SensorOffline),
            "high_temperature" => Ok(Self::HighTemperature),
            other => Err(DaemonError::validation(format!(
                "unknown alert type: {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Normalized reading produced by the pipeline, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    pub sensor_id: String,
    pub recorded_at: DateTime<Utc>,
    /// Whether `recorded_at` came from the device payload rather than the
    /// delivery time. Device timestamps are never overwritten.
    pub device_timestamp: bool,
    pub moisture_level: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery_level: Option<f64>,
    /// Original payload text, retained for audit.
    pub raw_payload: String,
}

/// Persisted reading row. Append-only; never updated or deleted here.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: Uuid,
    pub sensor_id: String,
    pub recorded_at: DateTime<Utc>,
    pub moisture_level: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery_level: Option<f64>,
    pub raw_payload: String,
    pub created_at: DateTime<Utc>,
}

/// One row per sensor_id, kept current by ingestion and the health pass.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SensorStatus {
    pub sensor_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: String,
    pub battery_level: Option<f64>,
    pub location: Option<String>,
    pub firmware_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Threshold-violation record. Immutable apart from the one-way
/// acknowledged transition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub sensor_id: String,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}
