use crate::error::{Result, RewatchError};
use crate::types::{SensorSample, Stage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Samples collected between one `open` and `close` of a [`SampleBuffer`].
///
/// Once handed out by `close` a window has no mutating API, so a window in
/// flight to the server can never alias a newer capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureWindow {
    id: u64,
    stage: Stage,
    samples: Vec<SensorSample>,
}

impl CaptureWindow {
    fn new(id: u64, stage: Stage) -> Self {
        Self {
            id,
            stage,
            samples: Vec::with_capacity(512),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stage the window was opened for
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn samples(&self) -> &[SensorSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time covered by the window, first to last sample
    pub fn span_millis(&self) -> i64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp_millis - first.timestamp_millis,
            _ => 0,
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    open: Option<CaptureWindow>,
    next_id: u64,
    dropped: u64,
}

/// Shared handle between the session machine (sole opener/closer) and the
/// sensor callback (appender). At most one window is open at a time.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    state: Arc<Mutex<BufferState>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh window for `stage`
    pub fn open(&self, stage: Stage) -> Result<u64> {
        let mut state = self.state();
        if state.open.is_some() {
            return Err(RewatchError::AlreadyCapturing);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.open = Some(CaptureWindow::new(id, stage));
        Ok(id)
    }

    /// Append to the open window; samples arriving with no window open are dropped
    pub fn push(&self, sample: SensorSample) {
        let mut state = self.state();
        match state.open.as_mut() {
            Some(window) => window.samples.push(sample),
            None => state.dropped += 1,
        }
    }

    pub fn close(&self) -> Result<CaptureWindow> {
        self.state().open.take().ok_or(RewatchError::NotCapturing)
    }

    pub fn is_open(&self) -> bool {
        self.state().open.is_some()
    }

    /// Samples that arrived while no window was open
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }
}
