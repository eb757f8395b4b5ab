use super::{SensorSample, Stage};
use serde::{Deserialize, Serialize};

/// Response to join and status requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedExperiment {
    #[serde(rename = "experimentID")]
    pub experiment_id: String,
    /// Kept as the raw label so unknown stages surface as protocol errors at decode time
    pub stage: String,
}

/// One round trip of the delay measurement. `timing2`/`timing3` are server
/// ingress/egress in nanoseconds; `timing1`/`timing4` are filled in locally in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingProbe {
    #[serde(default)]
    pub timing1: i64,
    #[serde(default)]
    pub timing2: i64,
    #[serde(default)]
    pub timing3: i64,
    #[serde(default)]
    pub timing4: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureTimingDelay {
    pub join_code: String,
    pub device: String,
}

impl MeasureTimingDelay {
    pub fn new(join_code: impl Into<String>) -> Self {
        Self {
            join_code: join_code.into(),
            device: "watch".to_string(),
        }
    }
}

/// Request body for a rendezvous, and the server's answer (`delay` = ms until the rendezvous)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AverageTimingDelay {
    #[serde(default)]
    pub join_code: String,
    pub delay: i64,
}

/// Server answer to a rendezvous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureTiming {
    /// Milliseconds from now until the synchronized start
    Ready(i64),
    /// Server is not ready to hand out a rendezvous yet
    RetryLater,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub stage: Stage,
    pub trial: Option<u32>,
    #[serde(rename = "memStep")]
    pub mem_step: Option<u32>,
}

/// Body of a sensor upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorUpload {
    pub metadata: UploadMetadata,
    pub data: Vec<SensorSample>,
}
