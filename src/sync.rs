use crate::api::SessionApi;
use crate::clock::Clock;
use crate::config::HandshakeConfig;
use crate::error::{Result, RewatchError};
use crate::types::{FutureTiming, TimingProbe};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// One-way delay estimate for a probe, in milliseconds.
///
/// `timing1`/`timing4` are local send/receive times in ms; `timing2`/`timing3`
/// are the server's ingress/egress times in ns. Assumes a symmetric path.
pub fn one_way_delay_ms(probe: &TimingProbe) -> f64 {
    const NANOS_PER_MILLI: i128 = 1_000_000;
    // Differences are taken in integer ns; epoch-scale values do not fit an f64 exactly
    let t1 = probe.timing1 as i128 * NANOS_PER_MILLI;
    let t4 = probe.timing4 as i128 * NANOS_PER_MILLI;
    let legs_ns = (probe.timing2 as i128 - t1) + (t4 - probe.timing3 as i128);
    legs_ns as f64 / (2 * NANOS_PER_MILLI) as f64
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Middle element after sorting (upper middle for even counts)
pub fn median_of(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}

/// Outcome of one handshake
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeReport {
    pub delay_samples_ms: Vec<f64>,
    pub avg_delay_ms: f64,
    /// Local-clock deadlines offered by the server, in arrival order
    pub candidates: Vec<i64>,
    pub rendezvous_millis: i64,
    /// How long the caller waits so the action itself starts on the rendezvous
    pub delay_before_start: Duration,
}

/// Consecutive retryable failures across the whole handshake
struct FailureBudget {
    consecutive: u32,
    max: u32,
}

impl FailureBudget {
    fn new(max: u32) -> Self {
        Self { consecutive: 0, max }
    }

    fn answered(&mut self) {
        self.consecutive = 0;
    }

    fn failed(&mut self, err: RewatchError) -> Result<()> {
        if !err.is_retryable() {
            return Err(err);
        }
        self.consecutive += 1;
        log::warn!(
            "[sync] probe failed ({}/{}): {}",
            self.consecutive,
            self.max,
            err
        );
        if self.consecutive >= self.max {
            return Err(RewatchError::HandshakeFailed {
                failures: self.consecutive,
            });
        }
        Ok(())
    }
}

/// Clock offset estimator: measures the mean one-way delay, collects
/// rendezvous candidates and converts the median into a start delay.
pub struct ClockSync<A> {
    api: A,
    clock: Arc<dyn Clock>,
    config: HandshakeConfig,
}

impl<A: SessionApi> ClockSync<A> {
    pub fn new(api: A, clock: Arc<dyn Clock>, config: HandshakeConfig) -> Self {
        Self { api, clock, config }
    }

    /// Delay before starting the synchronized action
    pub async fn synchronize(&self, experiment_id: &str) -> Result<Duration> {
        Ok(self.synchronize_report(experiment_id).await?.delay_before_start)
    }

    pub async fn synchronize_report(&self, experiment_id: &str) -> Result<HandshakeReport> {
        let mut budget = FailureBudget::new(self.config.max_consecutive_failures);

        let delay_samples_ms = self.measure_delays(experiment_id, &mut budget).await?;
        let avg_delay_ms = mean(&delay_samples_ms);
        // The server speaks whole milliseconds
        let avg_delay_whole = avg_delay_ms as i64;
        log::info!(
            "[sync] mean one-way delay {:.2}ms over {} probes",
            avg_delay_ms,
            delay_samples_ms.len()
        );

        let mut candidates = Vec::with_capacity(self.config.rendezvous_probes);
        while candidates.len() < self.config.rendezvous_probes {
            let deadline = self
                .await_rendezvous(experiment_id, avg_delay_whole, &mut budget)
                .await?;
            candidates.push(deadline);
        }

        let rendezvous_millis = median_of(&candidates)
            .ok_or_else(|| RewatchError::Protocol("no rendezvous candidates".into()))?;
        let wait_ms = rendezvous_millis
            .checked_sub(self.clock.now_millis())
            .and_then(|ms| ms.checked_sub(avg_delay_whole))
            .ok_or_else(|| {
                RewatchError::Protocol(format!("rendezvous {} out of range", rendezvous_millis))
            })?;
        let delay_before_start = Duration::from_millis(wait_ms.max(0) as u64);

        log::info!(
            "[sync] rendezvous at {} (candidates {:?}), starting in {:?}",
            rendezvous_millis,
            candidates,
            delay_before_start
        );

        Ok(HandshakeReport {
            delay_samples_ms,
            avg_delay_ms,
            candidates,
            rendezvous_millis,
            delay_before_start,
        })
    }

    async fn measure_delays(
        &self,
        experiment_id: &str,
        budget: &mut FailureBudget,
    ) -> Result<Vec<f64>> {
        let mut delays = Vec::with_capacity(self.config.delay_probes);

        while delays.len() < self.config.delay_probes {
            let sent = self.clock.now_millis();
            match self.api.measure_timing_delay(experiment_id).await {
                Ok(mut probe) => {
                    probe.timing1 = sent;
                    probe.timing4 = self.clock.now_millis();
                    budget.answered();
                    let delay = one_way_delay_ms(&probe);
                    log::debug!("[sync] probe {} delay {:.2}ms", delays.len(), delay);
                    delays.push(delay);
                }
                Err(err) => {
                    budget.failed(err)?;
                    sleep(self.config.retry_later_interval()).await;
                }
            }
        }

        Ok(delays)
    }

    /// Ask for a rendezvous until the server offers one; returns it as a local-clock deadline
    async fn await_rendezvous(
        &self,
        experiment_id: &str,
        avg_delay_ms: i64,
        budget: &mut FailureBudget,
    ) -> Result<i64> {
        let started = Instant::now();

        loop {
            match self
                .api
                .request_future_timing(experiment_id, avg_delay_ms)
                .await
            {
                Ok(FutureTiming::Ready(delay_ms)) => {
                    budget.answered();
                    return self.clock.now_millis().checked_add(delay_ms).ok_or_else(|| {
                        RewatchError::Protocol(format!("rendezvous delay {}ms out of range", delay_ms))
                    });
                }
                Ok(FutureTiming::RetryLater) => {
                    budget.answered();
                    if let Some(limit) = self.config.ready_timeout() {
                        if started.elapsed() >= limit {
                            return Err(RewatchError::HandshakeTimeout(limit));
                        }
                    }
                    log::debug!("[sync] rendezvous not ready, retrying");
                }
                Err(err) => budget.failed(err)?,
            }
            sleep(self.config.retry_later_interval()).await;
        }
    }
}
