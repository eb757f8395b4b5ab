use crate::error::{Result, RewatchError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Clock handshake parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Round-trip delay probes averaged per handshake
    pub delay_probes: usize,
    /// Rendezvous candidates collected; the median wins
    pub rendezvous_probes: usize,
    /// Wait between "not ready yet" answers
    pub retry_later_interval_ms: u64,
    /// Consecutive network failures before the handshake gives up
    pub max_consecutive_failures: u32,
    /// Wall-clock bound on waiting for one rendezvous; `None` waits indefinitely
    pub ready_timeout_ms: Option<u64>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            delay_probes: 10,
            rendezvous_probes: 5,
            retry_later_interval_ms: 1_000,
            max_consecutive_failures: 3,
            ready_timeout_ms: Some(60_000),
        }
    }
}

impl HandshakeConfig {
    pub fn retry_later_interval(&self) -> Duration {
        Duration::from_millis(self.retry_later_interval_ms)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }
}

/// Client configuration, loadable from a JSON file. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub handshake: HandshakeConfig,
    /// Length of each synchronized reaction-time capture
    pub capture_window_ms: u64,
    /// Synchronized windows recorded during the reaction-time stage
    pub rt_trials: u32,
    /// Upload the gait calibration window when the stage completes
    pub upload_calibration: bool,
    /// Start the reaction-time window unsynchronized instead of aborting when the handshake fails
    pub unsynchronized_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            request_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            handshake: HandshakeConfig::default(),
            capture_window_ms: 5_000,
            rt_trials: 1,
            upload_calibration: false,
            unsynchronized_fallback: false,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            RewatchError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: ClientConfig = serde_json::from_str(&contents).map_err(|e| {
            RewatchError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(RewatchError::Config("base_url must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(RewatchError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.handshake.delay_probes == 0 || self.handshake.rendezvous_probes == 0 {
            return Err(RewatchError::Config(
                "handshake needs at least one delay probe and one rendezvous probe".into(),
            ));
        }
        if self.handshake.max_consecutive_failures == 0 {
            return Err(RewatchError::Config(
                "max_consecutive_failures must be > 0".into(),
            ));
        }
        if self.capture_window_ms == 0 {
            return Err(RewatchError::Config("capture_window_ms must be > 0".into()));
        }
        if self.rt_trials == 0 {
            return Err(RewatchError::Config("rt_trials must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn capture_window(&self) -> Duration {
        Duration::from_millis(self.capture_window_ms)
    }
}
