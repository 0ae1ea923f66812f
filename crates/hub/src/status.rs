//! Reading status classification.
//!
//! The normal and warning bands are closed intervals nested inside each
//! other, and a value takes the status of the innermost band that contains
//! it.  Each band includes its outer edge in both directions: a value exactly
//! on `max_warning` is a warning, one exactly on `min_normal` is normal.
//! Anything outside the warning band is critical, which covers values sitting
//! on a critical bound after clamping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sensor::Thresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Normal,
    Warning,
    Critical,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("unknown status '{s}'")),
        }
    }
}

/// Map a value onto the three severity regions of `t`.
///
/// NaN is contained in no band and falls through to critical.
pub fn classify(value: f64, t: &Thresholds) -> Status {
    if (t.min_normal..=t.max_normal).contains(&value) {
        Status::Normal
    } else if (t.min_warning..=t.max_warning).contains(&value) {
        Status::Warning
    } else {
        Status::Critical
    }
}

// ===========================================================================
// Tests
// ===========================================================================
