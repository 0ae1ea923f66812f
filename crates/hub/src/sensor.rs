//! Sensor, threshold and reading types shared by the generator, the store and
//! the real-time fan-out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::status::Status;

// ---------------------------------------------------------------------------
// Sensor type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    SoilMoisture,
    Light,
    Co2,
}

impl SensorType {
    pub const ALL: [SensorType; 5] = [
        Self::Temperature,
        Self::Humidity,
        Self::SoilMoisture,
        Self::Light,
        Self::Co2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::SoilMoisture => "soil_moisture",
            Self::Light => "light",
            Self::Co2 => "co2",
        }
    }

    /// Light levels are reported as whole lux; everything else keeps one
    /// decimal.
    pub fn round(&self, value: f64) -> f64 {
        match self {
            Self::Light => value.round(),
            _ => (value * 10.0).round() / 10.0,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown sensor type '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// The six band boundaries of a sensor.  The critical band is the widest:
/// `min_critical <= min_warning <= min_normal <= max_normal <= max_warning <= max_critical`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_critical: f64,
    pub min_warning: f64,
    pub min_normal: f64,
    pub max_normal: f64,
    pub max_warning: f64,
    pub max_critical: f64,
}

impl Thresholds {
    /// Check finiteness and band ordering.  Returns every violation found.
    pub fn violations(&self) -> Vec<String> {
        let ordered = [
            ("min_critical", self.min_critical),
            ("min_warning", self.min_warning),
            ("min_normal", self.min_normal),
            ("max_normal", self.max_normal),
            ("max_warning", self.max_warning),
            ("max_critical", self.max_critical),
        ];

        let mut errors = Vec::new();
        for (name, v) in ordered {
            if !v.is_finite() {
                errors.push(format!("{name} is not a finite number"));
            }
        }
        if !errors.is_empty() {
            return errors;
        }

        for pair in ordered.windows(2) {
            let (lo_name, lo) = pair[0];
            let (hi_name, hi) = pair[1];
            if lo > hi {
                errors.push(format!("{lo_name} ({lo}) must not exceed {hi_name} ({hi})"));
            }
        }
        if self.min_critical >= self.max_critical && errors.is_empty() {
            errors.push(format!(
                "critical band is empty ({} .. {})",
                self.min_critical, self.max_critical
            ));
        }
        errors
    }

    pub fn normal_width(&self) -> f64 {
        self.max_normal - self.min_normal
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min_critical, self.max_critical)
    }
}

// ---------------------------------------------------------------------------
// Sensor + reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: String,
    pub name: String,
    pub zone_id: String,
    pub sensor_type: SensorType,
    pub unit: String,
    pub thresholds: Thresholds,
    pub active: bool,
}

/// One generated value.  `ts` is unix milliseconds, sent as `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub zone_id: String,
    pub value: f64,
    pub unit: String,
    pub status: Status,
    #[serde(rename = "timestamp")]
    pub ts: i64,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bands() -> Thresholds {
        Thresholds {
            min_critical: 10.0,
            min_warning: 15.0,
            min_normal: 20.0,
            max_normal: 30.0,
            max_warning: 35.0,
            max_critical: 40.0,
        }
    }

    #[test]
    fn ordered_thresholds_have_no_violations() {
        assert!(bands().violations().is_empty());
    }

    #[test]
    fn collapsed_bands_are_allowed() {
        let t = Thresholds {
            min_warning: 20.0,
            max_warning: 30.0,
            ..bands()
        };
        assert!(t.violations().is_empty());
    }

    #[test]
    fn swapped_warning_bound_is_reported() {
        let t = Thresholds {
            min_warning: 22.0,
            ..bands()
        };
        let errors = t.violations();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("min_warning (22) must not exceed min_normal (20)"));
    }

    #[test]
    fn every_violation_is_reported() {
        let t = Thresholds {
            min_critical: 50.0,
            max_critical: 0.0,
            ..bands()
        };
        assert_eq!(t.violations().len(), 2);
    }

    #[test]
    fn nan_is_rejected() {
        let t = Thresholds {
            max_normal: f64::NAN,
            ..bands()
        };
        assert!(t.violations()[0].contains("max_normal is not a finite number"));
    }

    #[test]
    fn sensor_type_parse_and_display() {
        for t in SensorType::ALL {
            assert_eq!(t.as_str().parse::<SensorType>(), Ok(t));
            assert_eq!(t.to_string(), t.as_str());
        }
        assert!("pressure".parse::<SensorType>().is_err());
    }

    #[test]
    fn sensor_type_serde_matches_display() {
        let json = serde_json::to_string(&SensorType::SoilMoisture).unwrap();
        assert_eq!(json, "\"soil_moisture\"");
    }

    #[test]
    fn rounding_per_type() {
        assert_eq!(SensorType::Temperature.round(21.349), 21.3);
        assert_eq!(SensorType::Light.round(12000.6), 12001.0);
    }
}
