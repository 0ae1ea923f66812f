//! Threshold-crossing alerts with per-sensor, per-severity deduplication.

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;

use crate::db::{Db, NewAlert};
use crate::sensor::{Reading, Sensor};
use crate::status::Status;

/// Default span during which a second alert of the same severity for the
/// same sensor is suppressed.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Alert pushed to `alerts` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub alert_id: i64,
    pub sensor_id: String,
    pub sensor_name: String,
    pub message: String,
    pub severity: Status,
    pub value: f64,
    pub unit: String,
    pub timestamp: i64,
}

/// Human-readable alert text naming the side and the band edge that was
/// crossed.
pub fn alert_message(sensor: &Sensor, value: f64, severity: Status) -> String {
    let t = &sensor.thresholds;
    let high = value > t.max_normal;
    let (direction, bound) = match (severity, high) {
        (Status::Critical, true) => ("above", t.max_warning),
        (Status::Critical, false) => ("below", t.min_warning),
        (_, true) => ("above", t.max_normal),
        (_, false) => ("below", t.min_normal),
    };
    format!(
        "{} {severity}: {value} {} ({direction} {bound} {})",
        sensor.name, sensor.unit, sensor.unit
    )
}

/// Store and return a new alert for `reading`, unless it is normal or an
/// unresolved alert of the same severity was raised for the sensor within
/// `window` of the reading's timestamp.
pub async fn raise(
    db: &Db,
    sensor: &Sensor,
    reading: &Reading,
    window: Duration,
) -> Result<Option<AlertEvent>> {
    if reading.status.is_normal() {
        return Ok(None);
    }

    let since = reading.ts - window.as_millis() as i64;
    if db
        .find_open_alert(&sensor.sensor_id, reading.status, since)
        .await?
        .is_some()
    {
        return Ok(None);
    }

    let message = alert_message(sensor, reading.value, reading.status);
    let alert_id = db
        .insert_alert(&NewAlert {
            sensor_id: &sensor.sensor_id,
            message: &message,
            severity: reading.status,
            value: reading.value,
            unit: &reading.unit,
            created_at: reading.ts,
        })
        .await?;

    Ok(Some(AlertEvent {
        alert_id,
        sensor_id: sensor.sensor_id.clone(),
        sensor_name: sensor.name.clone(),
        message,
        severity: reading.status,
        value: reading.value,
        unit: reading.unit.clone(),
        timestamp: reading.ts,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
