//! TOML config file loading, validation, and database seeding for zones,
//! sensors and the simulation loop.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

use crate::alerts::DEFAULT_DEDUP_WINDOW;
use crate::db::{Db, ZoneConfig};
use crate::registry::DEFAULT_QUEUE;
use crate::sensor::{Sensor, SensorType, Thresholds};

const MAX_HISTORY_LEN: usize = 1_000;
const MAX_SUBSCRIBER_QUEUE: usize = 65_536;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub tick_interval_sec: u64,
    pub alert_dedup_window_sec: u64,
    pub history_len: usize,
    /// Offset applied to UTC before taking the hour of day for the
    /// day/night curves.
    pub utc_offset_hours: i8,
    pub subscriber_queue: usize,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_interval_sec: 5,
            alert_dedup_window_sec: DEFAULT_DEDUP_WINDOW.as_secs(),
            history_len: 10,
            utc_offset_hours: 0,
            subscriber_queue: DEFAULT_QUEUE,
        }
    }
}

impl SimulationSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_sec)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.alert_dedup_window_sec)
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0)
            .with_context(|| format!("invalid utc_offset_hours: {}", self.utc_offset_hours))
    }
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub name: String,
    pub zone_id: String,
    pub sensor_type: SensorType,
    pub unit: String,
    #[serde(flatten)]
    pub thresholds: Thresholds,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl From<&SensorEntry> for Sensor {
    fn from(s: &SensorEntry) -> Self {
        Sensor {
            sensor_id: s.sensor_id.clone(),
            name: s.name.clone(),
            zone_id: s.zone_id.clone(),
            sensor_type: s.sensor_type,
            unit: s.unit.clone(),
            thresholds: s.thresholds,
            active: s.active,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_simulation(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_simulation(&self, errors: &mut Vec<String>) {
        let sim = &self.simulation;
        if sim.tick_interval_sec == 0 {
            errors.push("simulation: tick_interval_sec must be positive".into());
        }
        if sim.alert_dedup_window_sec == 0 {
            errors.push("simulation: alert_dedup_window_sec must be positive".into());
        }
        if !(1..=MAX_HISTORY_LEN).contains(&sim.history_len) {
            errors.push(format!(
                "simulation: history_len {} out of range [1, {MAX_HISTORY_LEN}]",
                sim.history_len
            ));
        }
        if !(1..=MAX_SUBSCRIBER_QUEUE).contains(&sim.subscriber_queue) {
            errors.push(format!(
                "simulation: subscriber_queue {} out of range [1, {MAX_SUBSCRIBER_QUEUE}]",
                sim.subscriber_queue
            ));
        }
        if !(-12..=14).contains(&sim.utc_offset_hours) {
            errors.push(format!(
                "simulation: utc_offset_hours {} out of range [-12, 14]",
                sim.utc_offset_hours
            ));
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<&str> = self.zones.iter().map(|z| z.zone_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }
            // Used as a single path segment in /api/sensors/{sensor_id}/readings.
            if s.sensor_id.contains('/') {
                errors.push(format!("{}: sensor_id must not contain '/'", ctx()));
            }

            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if s.unit.trim().is_empty() {
                errors.push(format!("{}: unit is empty", ctx()));
            }

            if s.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !zone_ids.contains(s.zone_id.as_str()) {
                errors.push(format!(
                    "{}: zone_id '{}' does not match any defined zone",
                    ctx(),
                    s.zone_id
                ));
            }

            // ── Threshold bands ─────────────────────────────────
            for v in s.thresholds.violations() {
                errors.push(format!("{}: {v}", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Upsert all zones and sensors from the config into the database, and
/// deactivate sensors the file no longer lists.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for z in &config.zones {
        db.upsert_zone(&ZoneConfig {
            zone_id: z.zone_id.clone(),
            name: z.name.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert zone '{}'", z.zone_id))?;
    }

    for s in &config.sensors {
        db.upsert_sensor(&Sensor::from(s))
            .await
            .with_context(|| format!("failed to upsert sensor '{}'", s.sensor_id))?;
    }

    let keep: Vec<&str> = config.sensors.iter().map(|s| s.sensor_id.as_str()).collect();
    let deactivated = db
        .deactivate_missing_sensors(&keep)
        .await
        .context("failed to deactivate removed sensors")?;

    tracing::info!(
        zones = config.zones.len(),
        sensors = config.sensors.len(),
        deactivated,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
