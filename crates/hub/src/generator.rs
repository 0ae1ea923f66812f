//! Stateful value generator for the simulated farm.
//!
//! Each sensor's next value is a small perturbation of its last one:
//! - Mean reversion toward a time-of-day target (the drift)
//! - A little momentum from the recent trend
//! - Bounded noise scaled to the sensor's normal band
//!
//! Targets are expressed as a fraction of the normal band, 0.0 at
//! `min_normal` and 1.0 at `max_normal`.  Results are clamped to the
//! critical band and rounded for display stability.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;

use time::{OffsetDateTime, UtcOffset};

use crate::sensor::{Reading, Sensor, SensorType};
use crate::status::classify;

/// Fraction of the gap to the time-of-day target closed per tick.
const REVERSION: f64 = 0.08;

/// Share of the average recent step carried into the next one.
const MOMENTUM: f64 = 0.2;

/// Noise sigma as a fraction of the normal band width.
const NOISE_FRAC: f64 = 0.02;

/// Grow lights (and ventilation) run 06:00..22:00.
const LIGHTS_ON: f64 = 6.0;
const LIGHTS_OFF: f64 = 22.0;

/// Irrigation pulses start at these hours.
const IRRIGATION_HOURS: [f64; 3] = [6.0, 12.0, 18.0];

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.  Bounded to [-6, 6].
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Time-of-day shaping
// ---------------------------------------------------------------------------

fn lights_on(hour: f64) -> bool {
    (LIGHTS_ON..LIGHTS_OFF).contains(&hour)
}

/// Sinusoid peaking at 14:00 and bottoming out at 02:00.
fn day_curve(hour: f64) -> f64 {
    (2.0 * PI * (hour - 8.0) / 24.0).sin()
}

/// Hours elapsed since the most recent irrigation pulse.
fn hours_since_irrigation(hour: f64) -> f64 {
    IRRIGATION_HOURS
        .iter()
        .map(|&start| (hour - start).rem_euclid(24.0))
        .fold(f64::INFINITY, f64::min)
}

/// Target position inside the normal band for `sensor_type` at `hour`
/// (fractional hours, 0.0..24.0).
pub fn target_fraction(sensor_type: SensorType, hour: f64) -> f64 {
    match sensor_type {
        SensorType::Temperature => 0.5 + 0.45 * day_curve(hour),
        SensorType::Humidity => 0.5 - 0.45 * day_curve(hour),
        SensorType::Light => {
            if lights_on(hour) {
                0.85
            } else {
                0.1
            }
        }
        SensorType::SoilMoisture => {
            // Boost right after a pulse, then evaporative decline.
            let since = hours_since_irrigation(hour);
            (0.95 - 0.12 * since).max(0.2)
        }
        SensorType::Co2 => {
            if lights_on(hour) {
                // Plants draw CO2 down; ventilation cycles every 3h.
                0.35 + 0.15 * (2.0 * PI * hour / 3.0).sin()
            } else {
                0.8
            }
        }
    }
}

/// Deterministic drift: a pull from `last` toward the target for this hour.
pub fn drift(sensor: &Sensor, hour: f64, last: f64) -> f64 {
    let t = &sensor.thresholds;
    let target = t.min_normal + target_fraction(sensor.sensor_type, hour) * t.normal_width();
    REVERSION * (target - last)
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// In-memory trend state for one sensor.  Lost on restart.
struct TrendState {
    history: VecDeque<f64>,
    last_ts: i64,
}

pub struct ValueGenerator {
    history_len: usize,
    offset: UtcOffset,
    trends: HashMap<String, TrendState>,
}

impl ValueGenerator {
    /// `history_len` bounds the per-sensor trend window; `offset` is the
    /// farm's local offset used to derive the hour of day.
    pub fn new(history_len: usize, offset: UtcOffset) -> Self {
        Self {
            history_len: history_len.max(1),
            offset,
            trends: HashMap::new(),
        }
    }

    /// Fractional hour of day at the farm.
    pub fn hour_of_day(&self, now: OffsetDateTime) -> f64 {
        let local = now.to_offset(self.offset);
        local.hour() as f64 + local.minute() as f64 / 60.0 + local.second() as f64 / 3600.0
    }

    /// Produce one reading per active sensor.
    pub fn generate(&mut self, sensors: &[Sensor], now: OffsetDateTime) -> Vec<Reading> {
        let hour = self.hour_of_day(now);
        let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;

        sensors
            .iter()
            .filter(|s| s.active)
            .map(|sensor| {
                let value = self.next_value(sensor, hour);
                let ts = self.next_ts(&sensor.sensor_id, now_ms);
                Reading {
                    sensor_id: sensor.sensor_id.clone(),
                    zone_id: sensor.zone_id.clone(),
                    value,
                    unit: sensor.unit.clone(),
                    status: classify(value, &sensor.thresholds),
                    ts,
                }
            })
            .collect()
    }

    /// Advance `sensor` by one step and return the new value.
    pub fn next_value(&mut self, sensor: &Sensor, hour: f64) -> f64 {
        let t = &sensor.thresholds;
        let cap = self.history_len;
        let state = self
            .trends
            .entry(sensor.sensor_id.clone())
            .or_insert_with(|| TrendState {
                history: VecDeque::new(),
                last_ts: i64::MIN,
            });

        let raw = match state.history.back() {
            None => t.min_normal + fastrand::f64() * t.normal_width(),
            Some(&last) => {
                let momentum = match state.history.front() {
                    Some(&first) if state.history.len() > 1 => {
                        MOMENTUM * (last - first) / (state.history.len() - 1) as f64
                    }
                    _ => 0.0,
                };
                let noise = NOISE_FRAC * t.normal_width() * approx_std_normal();
                last + drift(sensor, hour, last) + momentum + noise
            }
        };

        let value = t.clamp(sensor.sensor_type.round(raw));

        if state.history.len() >= cap {
            state.history.pop_front();
        }
        state.history.push_back(value);
        value
    }

    /// Strictly increasing per-sensor timestamp.
    fn next_ts(&mut self, sensor_id: &str, now_ms: i64) -> i64 {
        match self.trends.get_mut(sensor_id) {
            Some(state) => {
                let ts = if now_ms > state.last_ts {
                    now_ms
                } else {
                    state.last_ts + 1
                };
                state.last_ts = ts;
                ts
            }
            None => now_ms,
        }
    }

    #[cfg(test)]
    fn history(&self, sensor_id: &str) -> Option<&VecDeque<f64>> {
        self.trends.get(sensor_id).map(|s| &s.history)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
