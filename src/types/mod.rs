pub mod wire;

pub use wire::*;

use crate::error::RewatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server-authoritative phase of an assessment session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Waiting,
    /// Gait calibration walk
    Calibration,
    CalibrationComplete,
    ReactionTimeTest,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Waiting,
        Stage::Calibration,
        Stage::CalibrationComplete,
        Stage::ReactionTimeTest,
        Stage::Complete,
    ];

    /// Label used by the coordinating server
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Waiting => "WAITING",
            Stage::Calibration => "GAIT",
            Stage::CalibrationComplete => "GAIT_COMPLETE",
            Stage::ReactionTimeTest => "RT_TEST",
            Stage::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Stage {
    type Err = RewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.label() == s.trim())
            .ok_or_else(|| RewatchError::Protocol(format!("unrecognized stage label {:?}", s)))
    }
}

impl Serialize for Stage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(serde::de::Error::custom)
    }
}

/// One accelerometer reading. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    #[serde(rename = "ts", alias = "timestamp")]
    pub timestamp_millis: i64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl SensorSample {
    pub fn new(timestamp_millis: i64, x: f32, y: f32, z: f32) -> Self {
        Self {
            timestamp_millis,
            x,
            y,
            z,
        }
    }
}

/// Client-side view of a joined session. Dropped on abort or completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub experiment_id: String,
    pub last_known_stage: Stage,
    pub retry_count: u32,
}

impl SessionContext {
    pub fn new(experiment_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            last_known_stage: stage,
            retry_count: 0,
        }
    }
}
