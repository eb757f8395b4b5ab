use crate::api::SessionApi;
use crate::capture::{CaptureWindow, SampleBuffer};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{AbortReason, Result, RewatchError};
use crate::poller::{PollEvent, PollHandle, StagePoller};
use crate::sensors::CaptureSource;
use crate::sync::ClockSync;
use crate::types::{SessionContext, Stage};
use crate::upload::{UploadCoordinator, UploadReceipt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Session state machine states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    /// No session running
    Idle,
    /// Polling the server for the next stage
    AwaitingStageConfirm(Stage),
    /// A capture window is open for the stage
    Capturing(Stage),
    /// Closed window is being delivered, tagged with the stage
    UploadPending(Stage),
    Complete,
    Aborted(AbortReason),
}

impl MachineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MachineState::Complete | MachineState::Aborted(_))
    }
}

/// Screens the UI layer is asked to show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Join,
    Waiting,
    Calibration,
    ReactionTime,
    Complete,
}

impl Screen {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Waiting => Screen::Waiting,
            Stage::Calibration | Stage::CalibrationComplete => Screen::Calibration,
            Stage::ReactionTimeTest => Screen::ReactionTime,
            Stage::Complete => Screen::Complete,
        }
    }
}

/// Side channel towards the UI layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(MachineState),
    Status(String),
    /// Whether the accelerometer is recording
    CaptureIndicator(bool),
    Navigate(Screen),
    Uploaded(UploadReceipt),
    UploadFailed {
        stage: Stage,
        window_id: u64,
        error: RewatchError,
    },
}

/// What a polled stage means given the stage the device is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    Remain,
    BeginCalibration,
    /// Stop the calibration capture and wait for the next stage
    FinishCalibration,
    EnterReactionTime,
    Complete,
    Abort,
}

/// Stage transition table
pub fn transition(expected: Stage, observed: Stage) -> StageAction {
    if expected == observed {
        return StageAction::Remain;
    }
    match (expected, observed) {
        (Stage::Waiting, Stage::Calibration) => StageAction::BeginCalibration,
        (Stage::Calibration, Stage::CalibrationComplete) => StageAction::FinishCalibration,
        // Calibration already stopped; the capture is not reopened
        (Stage::CalibrationComplete, Stage::Calibration) => StageAction::Remain,
        (
            Stage::Waiting | Stage::Calibration | Stage::CalibrationComplete,
            Stage::ReactionTimeTest,
        ) => StageAction::EnterReactionTime,
        (Stage::ReactionTimeTest, Stage::Complete) => StageAction::Complete,
        _ => StageAction::Abort,
    }
}

enum RtPhase {
    Synchronizing(JoinHandle<Result<Duration>>),
    AwaitingStart(Instant),
    Holding(Instant),
}

enum RtStep {
    Synchronized(Result<Duration>),
    StartDue,
    CloseDue,
}

/// One synchronized reaction-time capture
struct RtTrial {
    index: u32,
    phase: RtPhase,
    finish_requested: bool,
}

impl RtTrial {
    fn is_holding(&self) -> bool {
        matches!(self.phase, RtPhase::Holding(_))
    }

    async fn next_step(&mut self) -> RtStep {
        match &mut self.phase {
            RtPhase::Synchronizing(task) => match task.await {
                Ok(result) => RtStep::Synchronized(result),
                Err(err) => RtStep::Synchronized(Err(RewatchError::InvalidState(format!(
                    "handshake task ended: {}",
                    err
                )))),
            },
            RtPhase::AwaitingStart(at) => {
                sleep_until(*at).await;
                RtStep::StartDue
            }
            RtPhase::Holding(until) => {
                sleep_until(*until).await;
                RtStep::CloseDue
            }
        }
    }
}

impl Drop for RtTrial {
    fn drop(&mut self) {
        if let RtPhase::Synchronizing(task) = &self.phase {
            task.abort();
        }
    }
}

/// Per-run bookkeeping that lives outside the machine so `select!` can borrow it
struct Run {
    experiment_id: String,
    expected: Stage,
    trial: Option<RtTrial>,
    poll: Option<PollHandle>,
    poll_rx: Option<mpsc::Receiver<PollEvent>>,
}

impl Run {
    fn stop_polling(&mut self) {
        if let Some(mut poll) = self.poll.take() {
            poll.cancel();
        }
        self.poll_rx = None;
    }
}

enum Step {
    Leave,
    Poll(Option<PollEvent>),
    Rt(RtStep),
}

enum Flow {
    Continue,
    Done(MachineState),
}

async fn next_poll(rx: &mut Option<mpsc::Receiver<PollEvent>>) -> Option<PollEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_rt_step(trial: &mut Option<RtTrial>) -> RtStep {
    match trial {
        Some(trial) => trial.next_step().await,
        None => std::future::pending().await,
    }
}

/// Drives one device through an assessment: join, calibration capture,
/// synchronized reaction-time windows and completion.
///
/// Window open/close and uploads all happen on the task calling [`run`],
/// one step at a time. Polling, the handshake and the sensor run beside it
/// and only report back through channels.
///
/// [`run`]: SessionMachine::run
pub struct SessionMachine<A, S> {
    api: A,
    source: S,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    buffer: SampleBuffer,
    poller: StagePoller<A>,
    uploader: UploadCoordinator<A>,
    context: Option<SessionContext>,
    state: MachineState,
    events: mpsc::UnboundedSender<SessionEvent>,
    leave: CancellationToken,
}

impl<A, S> SessionMachine<A, S>
where
    A: SessionApi + Clone + 'static,
    S: CaptureSource,
{
    pub fn new(
        api: A,
        source: S,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let machine = Self {
            poller: StagePoller::new(api.clone(), config.poll_interval()),
            uploader: UploadCoordinator::new(api.clone()),
            api,
            source,
            clock,
            config,
            buffer: SampleBuffer::new(),
            context: None,
            state: MachineState::Idle,
            events,
            leave: CancellationToken::new(),
        };
        (machine, rx)
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub fn is_capturing(&self) -> bool {
        self.buffer.is_open()
    }

    /// Cancelling the returned token makes a running session abort with `Cancelled`
    pub fn leave_handle(&self) -> CancellationToken {
        self.leave.clone()
    }

    /// User-triggered join. Failure leaves the device on the join screen.
    pub async fn join(&mut self, experiment_id: &str) -> Result<Stage> {
        if matches!(
            self.state,
            MachineState::AwaitingStageConfirm(_)
                | MachineState::Capturing(_)
                | MachineState::UploadPending(_)
        ) {
            return Err(RewatchError::InvalidState(
                "a session is already running".to_string(),
            ));
        }

        let experiment_id = experiment_id.trim();
        if experiment_id.is_empty() {
            self.navigate(Screen::Join);
            return Err(RewatchError::InvalidState("experiment id is empty".to_string()));
        }

        if self.leave.is_cancelled() {
            self.leave = CancellationToken::new();
        }

        let joined = match self.api.join(experiment_id).await {
            Ok(joined) => joined,
            Err(err) => return Err(self.join_failed(experiment_id, err)),
        };
        let stage = match joined.stage.parse::<Stage>() {
            Ok(stage) => stage,
            Err(err) => return Err(self.join_failed(experiment_id, err)),
        };

        let id = if joined.experiment_id.is_empty() {
            experiment_id.to_string()
        } else {
            joined.experiment_id
        };
        log::info!("[session] joined {} at stage {}", id, stage);

        self.context = Some(SessionContext::new(id, stage));
        self.set_state(MachineState::Idle);
        self.status(format!("Joined, stage {}", stage));
        self.navigate(Screen::for_stage(stage));
        Ok(stage)
    }

    fn join_failed(&mut self, experiment_id: &str, err: RewatchError) -> RewatchError {
        log::warn!("[session] join {} failed: {}", experiment_id, err);
        self.context = None;
        self.status(format!("Could not join {}", experiment_id));
        self.navigate(Screen::Join);
        err
    }

    /// Run the joined session until it completes or aborts
    pub async fn run(&mut self) -> Result<MachineState> {
        let context = self
            .context
            .clone()
            .ok_or_else(|| RewatchError::InvalidState("run called before join".to_string()))?;

        let mut run = Run {
            experiment_id: context.experiment_id,
            expected: context.last_known_stage,
            trial: None,
            poll: None,
            poll_rx: None,
        };

        if let Flow::Done(state) = self.enter_stage(&mut run) {
            return Ok(state);
        }

        loop {
            let step = tokio::select! {
                biased;
                _ = self.leave.cancelled() => Step::Leave,
                event = next_poll(&mut run.poll_rx) => Step::Poll(event),
                step = next_rt_step(&mut run.trial) => Step::Rt(step),
            };

            let flow = match step {
                Step::Leave => Flow::Done(self.abort(&mut run, AbortReason::Cancelled)),
                Step::Poll(Some(PollEvent::Observed(stage))) => {
                    self.on_observed(&mut run, stage).await
                }
                Step::Poll(Some(PollEvent::Lost(err))) => {
                    Flow::Done(self.abort(&mut run, AbortReason::SessionLost(err.to_string())))
                }
                Step::Poll(None) => Flow::Done(self.abort(
                    &mut run,
                    AbortReason::SessionLost("poll loop ended".to_string()),
                )),
                Step::Rt(step) => self.on_rt_step(&mut run, step).await,
            };

            if let Flow::Done(state) = flow {
                return Ok(state);
            }
        }
    }

    /// Entry actions for the stage the session was joined at
    fn enter_stage(&mut self, run: &mut Run) -> Flow {
        match run.expected {
            Stage::Complete => return Flow::Done(self.complete(run)),
            Stage::Calibration => {
                self.restart_polling(run);
                self.begin_calibration();
                return Flow::Continue;
            }
            Stage::ReactionTimeTest => run.trial = Some(self.start_trial(0, &run.experiment_id)),
            Stage::Waiting | Stage::CalibrationComplete => {}
        }
        self.restart_polling(run);
        self.set_state(MachineState::AwaitingStageConfirm(run.expected));
        Flow::Continue
    }

    async fn on_observed(&mut self, run: &mut Run, observed: Stage) -> Flow {
        if let Some(context) = self.context.as_mut() {
            context.last_known_stage = observed;
        }

        match transition(run.expected, observed) {
            StageAction::Remain => Flow::Continue,
            StageAction::BeginCalibration => {
                run.expected = Stage::Calibration;
                self.navigate(Screen::Calibration);
                self.restart_polling(run);
                self.begin_calibration();
                Flow::Continue
            }
            StageAction::FinishCalibration => {
                self.finish_calibration(&run.experiment_id).await;
                run.expected = Stage::CalibrationComplete;
                self.status("Calibration Complete\nPlease Return".to_string());
                self.set_state(MachineState::AwaitingStageConfirm(Stage::CalibrationComplete));
                Flow::Continue
            }
            StageAction::EnterReactionTime => {
                self.finish_calibration(&run.experiment_id).await;
                run.expected = Stage::ReactionTimeTest;
                self.navigate(Screen::ReactionTime);
                self.restart_polling(run);
                run.trial = Some(self.start_trial(0, &run.experiment_id));
                self.set_state(MachineState::AwaitingStageConfirm(Stage::ReactionTimeTest));
                Flow::Continue
            }
            StageAction::Complete => {
                if let Some(trial) = run.trial.as_mut().filter(|trial| trial.is_holding()) {
                    log::info!(
                        "[session] completion observed during trial {}, finishing window first",
                        trial.index
                    );
                    trial.finish_requested = true;
                    run.stop_polling();
                    return Flow::Continue;
                }
                Flow::Done(self.complete(run))
            }
            StageAction::Abort => {
                let reason = AbortReason::UnexpectedStage {
                    expected: run.expected.label().to_string(),
                    observed: observed.label().to_string(),
                };
                Flow::Done(self.abort(run, reason))
            }
        }
    }

    async fn on_rt_step(&mut self, run: &mut Run, step: RtStep) -> Flow {
        let Some(trial) = run.trial.as_mut() else {
            return Flow::Continue;
        };

        match step {
            RtStep::Synchronized(Ok(delay)) if Instant::now().checked_add(delay).is_some() => {
                trial.phase = RtPhase::AwaitingStart(Instant::now() + delay);
                self.status(format!("Starting in {} ms", delay.as_millis()));
                Flow::Continue
            }
            RtStep::Synchronized(result) => {
                let err = match result {
                    Ok(delay) => {
                        RewatchError::Protocol(format!("start delay {:?} out of range", delay))
                    }
                    Err(err) => err,
                };
                if let Some(context) = self.context.as_mut() {
                    context.retry_count += 1;
                }
                if self.config.unsynchronized_fallback {
                    log::warn!(
                        "[session] handshake failed ({}), starting trial {} unsynchronized",
                        err,
                        trial.index
                    );
                    trial.phase = RtPhase::AwaitingStart(Instant::now());
                    Flow::Continue
                } else {
                    Flow::Done(self.abort(run, AbortReason::HandshakeFailed(err.to_string())))
                }
            }
            RtStep::StartDue => {
                trial.phase = RtPhase::Holding(Instant::now() + self.config.capture_window());
                self.open_capture(Stage::ReactionTimeTest);
                Flow::Continue
            }
            RtStep::CloseDue => {
                let index = trial.index;
                let finish = trial.finish_requested;
                run.trial = None;

                let label = if finish {
                    Stage::Complete
                } else {
                    Stage::ReactionTimeTest
                };
                if let Some(window) = self.close_capture() {
                    self.set_state(MachineState::UploadPending(label));
                    self.upload(&run.experiment_id, label, Some(index), &window)
                        .await;
                }

                if finish {
                    return Flow::Done(self.complete(run));
                }
                if index + 1 < self.config.rt_trials {
                    run.trial = Some(self.start_trial(index + 1, &run.experiment_id));
                }
                self.set_state(MachineState::AwaitingStageConfirm(Stage::ReactionTimeTest));
                Flow::Continue
            }
        }
    }

    fn start_trial(&self, index: u32, experiment_id: &str) -> RtTrial {
        let sync = ClockSync::new(
            self.api.clone(),
            self.clock.clone(),
            self.config.handshake.clone(),
        );
        let experiment_id = experiment_id.to_string();
        log::info!("[session] synchronizing trial {} for {}", index, experiment_id);
        self.status("Synchronizing with server".to_string());

        let task = tokio::spawn(async move { sync.synchronize(&experiment_id).await });
        RtTrial {
            index,
            phase: RtPhase::Synchronizing(task),
            finish_requested: false,
        }
    }

    fn begin_calibration(&mut self) {
        if self.open_capture(Stage::Calibration) {
            self.status("Calibrating Watch".to_string());
        }
    }

    async fn finish_calibration(&mut self, experiment_id: &str) {
        let Some(window) = self.close_capture() else {
            return;
        };
        if self.config.upload_calibration {
            self.set_state(MachineState::UploadPending(Stage::Calibration));
            self.upload(experiment_id, Stage::Calibration, None, &window)
                .await;
        } else {
            log::info!(
                "[session] calibration window {} ({} samples) discarded",
                window.id(),
                window.len()
            );
        }
    }

    fn open_capture(&mut self, stage: Stage) -> bool {
        if let Err(err) = self.buffer.open(stage) {
            log::error!("[session] cannot open {} window: {}", stage, err);
            return false;
        }

        let sink = self.buffer.clone();
        if let Err(err) = self.source.start(Box::new(move |sample| sink.push(sample))) {
            log::error!("[session] capture source failed to start: {}", err);
            let _ = self.buffer.close();
            self.status(format!("Sensor unavailable: {}", err));
            return false;
        }

        log::info!("[session] capturing {}", stage);
        self.emit(SessionEvent::CaptureIndicator(true));
        self.set_state(MachineState::Capturing(stage));
        true
    }

    fn close_capture(&mut self) -> Option<CaptureWindow> {
        if !self.buffer.is_open() {
            return None;
        }
        self.source.stop();
        let window = self.buffer.close().ok()?;
        log::info!(
            "[session] closed {} window {} with {} samples over {}ms",
            window.stage(),
            window.id(),
            window.len(),
            window.span_millis()
        );
        self.emit(SessionEvent::CaptureIndicator(false));
        Some(window)
    }

    async fn upload(
        &self,
        experiment_id: &str,
        stage: Stage,
        trial: Option<u32>,
        window: &CaptureWindow,
    ) {
        match self
            .uploader
            .upload_trial(experiment_id, stage, trial, window)
            .await
        {
            Ok(receipt) => self.emit(SessionEvent::Uploaded(receipt)),
            Err(error) => self.emit(SessionEvent::UploadFailed {
                stage,
                window_id: window.id(),
                error,
            }),
        }
    }

    fn restart_polling(&self, run: &mut Run) {
        run.stop_polling();
        let (poll, rx) = self.poller.start_polling(&run.experiment_id);
        run.poll = Some(poll);
        run.poll_rx = Some(rx);
    }

    fn complete(&mut self, run: &mut Run) -> MachineState {
        run.stop_polling();
        run.trial = None;
        if let Some(window) = self.close_capture() {
            log::warn!("[session] window {} discarded at completion", window.id());
        }
        log::info!("[session] {} complete", run.experiment_id);

        self.context = None;
        self.set_state(MachineState::Complete);
        self.status("Session Complete".to_string());
        self.navigate(Screen::Complete);
        MachineState::Complete
    }

    fn abort(&mut self, run: &mut Run, reason: AbortReason) -> MachineState {
        log::warn!("[session] {} aborted: {}", run.experiment_id, reason);
        run.stop_polling();
        run.trial = None;
        if let Some(window) = self.close_capture() {
            log::warn!(
                "[session] window {} ({} samples) discarded on abort",
                window.id(),
                window.len()
            );
        }

        self.context = None;
        let state = MachineState::Aborted(reason);
        self.set_state(state.clone());
        self.status("Session ended, please rejoin".to_string());
        self.navigate(Screen::Join);
        state
    }

    fn set_state(&mut self, state: MachineState) {
        if self.state != state {
            log::debug!("[session] {:?} -> {:?}", self.state, state);
            self.state = state.clone();
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn status(&self, text: String) {
        self.emit(SessionEvent::Status(text));
    }

    fn navigate(&self, screen: Screen) {
        self.emit(SessionEvent::Navigate(screen));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
