use rewatch::types::{FutureTiming, JoinedExperiment, SensorUpload, TimingProbe};
use rewatch::{
    AnchoredClock, ClientConfig, Clock, MachineState, Result, RewatchError, Screen,
    SessionApi, SessionEvent, SessionMachine, Stage, SyntheticAccelSource,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

const EPOCH: i64 = 1_700_000_000_000;

/// Server that walks through a fixed stage script, one entry per status poll
#[derive(Default)]
struct ScriptedServer {
    stages: Mutex<VecDeque<&'static str>>,
    uploads: Mutex<Vec<(Stage, SensorUpload)>>,
}

impl ScriptedServer {
    fn new(stages: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            stages: Mutex::new(stages.iter().copied().collect()),
            ..Self::default()
        })
    }

    fn uploads(&self) -> Vec<(Stage, SensorUpload)> {
        self.uploads.lock().unwrap().clone()
    }
}

impl SessionApi for ScriptedServer {
    async fn join(&self, experiment_id: &str) -> Result<JoinedExperiment> {
        Ok(JoinedExperiment {
            experiment_id: experiment_id.to_string(),
            stage: "WAITING".to_string(),
        })
    }

    async fn poll_status(&self, experiment_id: &str) -> Result<JoinedExperiment> {
        let mut stages = self.stages.lock().unwrap();
        let stage = if stages.len() > 1 {
            stages.pop_front()
        } else {
            stages.front().copied()
        }
        .ok_or_else(|| RewatchError::Network("server gone".into()))?;

        Ok(JoinedExperiment {
            experiment_id: experiment_id.to_string(),
            stage: stage.to_string(),
        })
    }

    async fn measure_timing_delay(&self, _experiment_id: &str) -> Result<TimingProbe> {
        Ok(TimingProbe::default())
    }

    async fn request_future_timing(
        &self,
        _experiment_id: &str,
        _avg_delay_ms: i64,
    ) -> Result<FutureTiming> {
        Ok(FutureTiming::Ready(750))
    }

    async fn upload_sensor_data(
        &self,
        _experiment_id: &str,
        stage: Stage,
        body: &SensorUpload,
    ) -> Result<()> {
        self.uploads.lock().unwrap().push((stage, body.clone()));
        Ok(())
    }
}

fn machine(
    server: &Arc<ScriptedServer>,
    config: ClientConfig,
) -> (
    SessionMachine<Arc<ScriptedServer>, SyntheticAccelSource>,
    tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
) {
    let clock: Arc<dyn Clock> = Arc::new(AnchoredClock::starting_at(EPOCH));
    let source = SyntheticAccelSource::new(clock.clone());
    SessionMachine::new(server.clone(), source, clock, config)
}

#[tokio::test(start_paused = true)]
async fn test_walks_every_stage_to_completion() {
    let server = ScriptedServer::new(&[
        "WAITING",
        "GAIT",
        "GAIT",
        "GAIT",
        "GAIT_COMPLETE",
        "RT_TEST",
        "RT_TEST",
        "RT_TEST",
        "RT_TEST",
        "RT_TEST",
        "RT_TEST",
        "RT_TEST",
        "RT_TEST",
        "COMPLETE",
    ]);
    let (mut machine, mut events) = machine(&server, ClientConfig::default());

    assert_eq!(machine.join("exp").await.unwrap(), Stage::Waiting);
    let state = machine.run().await.unwrap();
    assert_eq!(state, MachineState::Complete);

    let mut screens = Vec::new();
    let mut indicator = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Navigate(screen) => screens.push(screen),
            SessionEvent::CaptureIndicator(on) => indicator.push(on),
            _ => {}
        }
    }
    assert_eq!(
        screens,
        vec![
            Screen::Waiting,
            Screen::Calibration,
            Screen::ReactionTime,
            Screen::Complete
        ]
    );
    // Calibration window, then the reaction-time window
    assert_eq!(indicator, vec![true, false, true, false]);

    // Calibration data stays local by default
    let uploads = server.uploads();
    assert_eq!(uploads.len(), 1);
    let (stage, body) = &uploads[0];
    assert_eq!(*stage, Stage::ReactionTimeTest);
    assert_eq!(body.metadata.stage, Stage::ReactionTimeTest);

    // Window opened at the rendezvous and held for five seconds
    let first = body.data.first().unwrap().timestamp_millis;
    let last = body.data.last().unwrap().timestamp_millis;
    assert_eq!(first, EPOCH + 4_000 + 750);
    assert!(last - first >= 4_980 && last - first <= 5_000);
}

#[tokio::test(start_paused = true)]
async fn test_server_reset_returns_to_join() {
    let server = ScriptedServer::new(&["WAITING", "GAIT", "WAITING"]);
    let (mut machine, mut events) = machine(&server, ClientConfig::default());

    machine.join("exp").await.unwrap();
    let started = Instant::now();
    let state = machine.run().await.unwrap();

    assert!(matches!(state, MachineState::Aborted(_)));
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert!(machine.context().is_none());
    assert!(!machine.is_capturing());
    assert!(server.uploads().is_empty());

    let mut last_screen = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Navigate(screen) = event {
            last_screen = Some(screen);
        }
    }
    assert_eq!(last_screen, Some(Screen::Join));

    // A fresh join is accepted after an abort
    assert_eq!(machine.join("exp").await.unwrap(), Stage::Waiting);
}
