//! Scripted in-memory server used by the unit tests.

use crate::api::SessionApi;
use crate::error::{Result, RewatchError};
use crate::types::{FutureTiming, JoinedExperiment, SensorUpload, Stage, TimingProbe};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub experiment_id: String,
    pub stage: Stage,
    pub body: SensorUpload,
}

#[derive(Default)]
struct Script {
    join: VecDeque<Result<String>>,
    statuses: VecDeque<Result<String>>,
    last_status: Option<Result<String>>,
    probes: VecDeque<Result<TimingProbe>>,
    futures: VecDeque<Result<FutureTiming>>,
    upload_results: VecDeque<Result<()>>,
    uploads: Vec<RecordedUpload>,
    status_calls: usize,
    probe_calls: usize,
    future_calls: usize,
}

/// Every call pops the next scripted answer. Exhausted scripts fall back to:
/// the last status (sticky), an all-zero probe, `Ready(1000)` and upload success.
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<Script>,
    latency: Duration,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn push_join(&self, stage: Result<&str>) {
        self.script().join.push_back(stage.map(str::to_string));
    }

    pub fn push_status(&self, stage: &str) {
        self.script().statuses.push_back(Ok(stage.to_string()));
    }

    pub fn push_statuses(&self, stages: &[&str]) {
        for stage in stages {
            self.push_status(stage);
        }
    }

    pub fn push_status_error(&self, err: RewatchError) {
        self.script().statuses.push_back(Err(err));
    }

    pub fn push_probe(&self, probe: Result<TimingProbe>) {
        self.script().probes.push_back(probe);
    }

    pub fn push_future(&self, timing: Result<FutureTiming>) {
        self.script().futures.push_back(timing);
    }

    pub fn push_upload_result(&self, result: Result<()>) {
        self.script().upload_results.push_back(result);
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.script().uploads.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.script().status_calls
    }

    pub fn probe_calls(&self) -> usize {
        self.script().probe_calls
    }

    pub fn future_calls(&self) -> usize {
        self.script().future_calls
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn joined(experiment_id: &str, stage: String) -> JoinedExperiment {
    JoinedExperiment {
        experiment_id: experiment_id.to_string(),
        stage,
    }
}

impl SessionApi for ScriptedApi {
    async fn join(&self, experiment_id: &str) -> Result<JoinedExperiment> {
        self.simulate_latency().await;
        let next = self
            .script()
            .join
            .pop_front()
            .unwrap_or_else(|| Ok(Stage::Waiting.label().to_string()));
        next.map(|stage| joined(experiment_id, stage))
    }

    async fn poll_status(&self, experiment_id: &str) -> Result<JoinedExperiment> {
        self.simulate_latency().await;
        let next = {
            let mut script = self.script();
            script.status_calls += 1;
            match script.statuses.pop_front() {
                Some(next) => {
                    script.last_status = Some(next.clone());
                    next
                }
                None => script
                    .last_status
                    .clone()
                    .unwrap_or_else(|| Err(RewatchError::Network("no status scripted".into()))),
            }
        };
        next.map(|stage| joined(experiment_id, stage))
    }

    async fn measure_timing_delay(&self, _experiment_id: &str) -> Result<TimingProbe> {
        self.simulate_latency().await;
        let mut script = self.script();
        script.probe_calls += 1;
        script
            .probes
            .pop_front()
            .unwrap_or_else(|| Ok(TimingProbe::default()))
    }

    async fn request_future_timing(
        &self,
        _experiment_id: &str,
        _avg_delay_ms: i64,
    ) -> Result<FutureTiming> {
        self.simulate_latency().await;
        let mut script = self.script();
        script.future_calls += 1;
        script
            .futures
            .pop_front()
            .unwrap_or(Ok(FutureTiming::Ready(1_000)))
    }

    async fn upload_sensor_data(
        &self,
        experiment_id: &str,
        stage: Stage,
        body: &SensorUpload,
    ) -> Result<()> {
        self.simulate_latency().await;
        let mut script = self.script();
        script.uploads.push(RecordedUpload {
            experiment_id: experiment_id.to_string(),
            stage,
            body: body.clone(),
        });
        script.upload_results.pop_front().unwrap_or(Ok(()))
    }
}
