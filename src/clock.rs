use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Source of epoch-millisecond timestamps for the handshake and sample stamping
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock epoch sampled once, advanced by the monotonic runtime clock.
///
/// Timestamps never go backwards when the system clock is adjusted mid-session,
/// and under a paused tokio runtime they advance exactly with `tokio::time`.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    epoch_millis: i64,
    anchor: Instant,
}

impl AnchoredClock {
    pub fn new() -> Self {
        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self::starting_at(epoch_millis)
    }

    pub fn starting_at(epoch_millis: i64) -> Self {
        Self {
            epoch_millis,
            anchor: Instant::now(),
        }
    }
}

impl Default for AnchoredClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for AnchoredClock {
    fn now_millis(&self) -> i64 {
        self.epoch_millis
            .saturating_add(self.anchor.elapsed().as_millis() as i64)
    }
}
