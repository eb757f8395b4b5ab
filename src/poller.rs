use crate::api::SessionApi;
use crate::error::{Result, RewatchError};
use crate::types::Stage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// What one status poll produced
#[derive(Debug, Clone)]
pub enum PollEvent {
    Observed(Stage),
    /// Transport or decode failure; the loop stops after sending this
    Lost(RewatchError),
}

/// Owner-side handle of a running poll loop. Cancelling (or dropping) it
/// abandons any in-flight request, so no stale observation is delivered later.
pub struct PollHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Periodic session status check against the server
pub struct StagePoller<A> {
    api: A,
    interval: Duration,
}

impl<A> StagePoller<A>
where
    A: SessionApi + Clone + 'static,
{
    pub fn new(api: A, interval: Duration) -> Self {
        Self { api, interval }
    }

    pub async fn try_poll(&self, experiment_id: &str) -> Result<Stage> {
        fetch_stage(&self.api, experiment_id).await
    }

    /// `None` when the session can no longer be read (transport or unknown stage)
    pub async fn poll_once(&self, experiment_id: &str) -> Option<Stage> {
        match self.try_poll(experiment_id).await {
            Ok(stage) => Some(stage),
            Err(err) => {
                log::warn!("[poll] status for {} failed: {}", experiment_id, err);
                None
            }
        }
    }

    /// Spawn the poll loop. Each request completes before the next is
    /// scheduled, so observations arrive in order and never overlap.
    pub fn start_polling(&self, experiment_id: &str) -> (PollHandle, mpsc::Receiver<PollEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let api = self.api.clone();
        let interval = self.interval;
        let experiment_id = experiment_id.to_string();

        let handle = tokio::spawn(async move {
            let mut polls = 0u64;
            loop {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = fetch_stage(&api, &experiment_id) => result,
                };
                polls += 1;

                let event = match result {
                    Ok(stage) => {
                        log::debug!("[poll] #{} {} -> {}", polls, experiment_id, stage);
                        PollEvent::Observed(stage)
                    }
                    Err(err) => {
                        log::warn!("[poll] #{} {} lost: {}", polls, experiment_id, err);
                        PollEvent::Lost(err)
                    }
                };
                let lost = matches!(event, PollEvent::Lost(_));
                if tx.send(event).await.is_err() || lost {
                    break;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }
            }
            log::debug!("[poll] loop for {} ended after {} polls", experiment_id, polls);
        });

        (
            PollHandle {
                cancel,
                handle: Some(handle),
            },
            rx,
        )
    }
}

async fn fetch_stage<A: SessionApi>(api: &A, experiment_id: &str) -> Result<Stage> {
    let joined = api.poll_status(experiment_id).await?;
    joined.stage.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedApi;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn poller(api: &Arc<ScriptedApi>) -> StagePoller<Arc<ScriptedApi>> {
        StagePoller::new(api.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_poll_once_maps_failures_to_none() {
        let api = Arc::new(ScriptedApi::new());
        api.push_status("GAIT");
        api.push_status("SOMETHING_ELSE");
        api.push_status_error(RewatchError::Network("refused".into()));

        let poller = poller(&api);
        assert_eq!(poller.poll_once("exp").await, Some(Stage::Calibration));
        assert_eq!(poller.poll_once("exp").await, None);
        assert_eq!(poller.poll_once("exp").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_delivers_in_order_at_fixed_interval() {
        let api = Arc::new(ScriptedApi::new());
        api.push_statuses(&["WAITING", "WAITING", "GAIT"]);

        let (mut handle, mut rx) = poller(&api).start_polling("exp");
        let started = Instant::now();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(PollEvent::Observed(stage)) => seen.push(stage),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![Stage::Waiting, Stage::Waiting, Stage::Calibration]);
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        handle.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_is_delivered_immediately_and_ends_loop() {
        let api = Arc::new(ScriptedApi::new());
        api.push_status_error(RewatchError::Network("reset".into()));

        let (_handle, mut rx) = poller(&api).start_polling("exp");
        let started = Instant::now();

        assert!(matches!(rx.recv().await, Some(PollEvent::Lost(_))));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(rx.recv().await.is_none());
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_further_requests() {
        let api = Arc::new(ScriptedApi::new());
        api.push_status("RT_TEST");

        let (mut handle, mut rx) = poller(&api).start_polling("exp");
        assert!(matches!(rx.recv().await, Some(PollEvent::Observed(Stage::ReactionTimeTest))));
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.status_calls(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_polls_never_overlap() {
        let api = Arc::new(ScriptedApi::with_latency(Duration::from_millis(1_500)));
        api.push_statuses(&["GAIT", "GAIT"]);

        let (_handle, mut rx) = poller(&api).start_polling("exp");
        let started = Instant::now();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        // 1.5s request + 1s gap + 1.5s request
        assert_eq!(started.elapsed(), Duration::from_millis(4_000));
        assert_eq!(api.status_calls(), 2);
    }
}
