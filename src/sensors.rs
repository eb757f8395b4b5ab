use crate::clock::Clock;
use crate::error::{Result, RewatchError};
use crate::types::SensorSample;
use std::sync::Arc;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Called once per produced sample, in production order
pub type SampleCallback = Box<dyn FnMut(SensorSample) + Send + 'static>;

/// Exclusive accelerometer capability. Only the session machine starts or stops it.
pub trait CaptureSource: Send {
    fn start(&mut self, on_sample: SampleCallback) -> Result<()>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// Default sampling period (~50Hz, the typical smartwatch accelerometer rate)
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(20);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    fn spawn<F>(make_loop: impl FnOnce(CancellationToken) -> F) -> Result<Self>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RewatchError::Sensor(format!("no async runtime for sensor loop: {}", e)))?;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(make_loop(cancel.clone()));
        Ok(Self { cancel, handle })
    }

    fn shutdown(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Walking-like waveform generator used when no hardware sensor is present
pub struct SyntheticAccelSource {
    clock: Arc<dyn Clock>,
    period: Duration,
    running: Option<Running>,
}

impl SyntheticAccelSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_period(clock, DEFAULT_SAMPLE_PERIOD)
    }

    pub fn with_period(clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            clock,
            period,
            running: None,
        }
    }
}

impl CaptureSource for SyntheticAccelSource {
    fn start(&mut self, mut on_sample: SampleCallback) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let clock = self.clock.clone();
        let period = self.period;
        self.running = Some(Running::spawn(move |cancel| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick = 0u64;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let t = tick as f64 * period.as_secs_f64();
                        on_sample(synthetic_sample(clock.now_millis(), t));
                        tick += 1;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            log::debug!("[accel] synthetic source stopped after {} samples", tick);
        })?);

        log::info!("[accel] synthetic source started ({:?} period)", self.period);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown();
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for SyntheticAccelSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reads the accelerometer through Termux:API, one `termux-sensor` call per tick.
/// Ticks where the tool is unavailable or unparsable yield a synthetic sample.
pub struct TermuxAccelSource {
    clock: Arc<dyn Clock>,
    period: Duration,
    running: Option<Running>,
}

impl TermuxAccelSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            period: DEFAULT_SAMPLE_PERIOD,
            running: None,
        }
    }
}

impl CaptureSource for TermuxAccelSource {
    fn start(&mut self, mut on_sample: SampleCallback) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let clock = self.clock.clone();
        let period = self.period;
        self.running = Some(Running::spawn(move |cancel| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut tick = 0u64;
            let mut fallbacks = 0u64;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = clock.now_millis();
                        let sample = match read_termux_accel(now).await {
                            Some(sample) => sample,
                            None => {
                                fallbacks += 1;
                                if fallbacks % 100 == 1 {
                                    log::warn!("[accel] termux-sensor unavailable, using synthetic data");
                                }
                                synthetic_sample(now, tick as f64 * period.as_secs_f64())
                            }
                        };
                        on_sample(sample);
                        tick += 1;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })?);

        log::info!("[accel] termux source started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown();
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for TermuxAccelSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_termux_accel(timestamp_millis: i64) -> Option<SensorSample> {
    let output = Command::new("termux-sensor")
        .arg("-n")
        .arg("1")
        .arg("-s")
        .arg("accelerometer")
        .output()
        .await
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    parse_accel_output(&text, timestamp_millis)
}

/// Parse "Accelerometer event: x=0.5, y=0.3, z=9.8, accuracy=0, timestamp=..."
pub fn parse_accel_output(output: &str, timestamp_millis: i64) -> Option<SensorSample> {
    let mut x = None;
    let mut y = None;
    let mut z = None;

    for part in output.split(|c| c == ',' || c == ':') {
        let part = part.trim();
        if let Some(val) = part.strip_prefix("x=") {
            x = Some(val.trim().parse().ok()?);
        } else if let Some(val) = part.strip_prefix("y=") {
            y = Some(val.trim().parse().ok()?);
        } else if let Some(val) = part.strip_prefix("z=") {
            z = Some(val.trim().parse().ok()?);
        }
    }

    Some(SensorSample::new(timestamp_millis, x?, y?, z?))
}

/// Gait-like linear acceleration at `t` seconds: ~1.9Hz step cadence,
/// vertical bounce strongest, lateral sway weakest.
fn synthetic_sample(timestamp_millis: i64, t: f64) -> SensorSample {
    use std::f64::consts::PI;
    let phase = 2.0 * PI * 1.9 * t;

    SensorSample::new(
        timestamp_millis,
        (0.3 * (phase / 2.0).sin()) as f32,
        (1.0 * phase.sin()) as f32,
        (0.15 * (phase + 1.0).sin()) as f32,
    )
}
