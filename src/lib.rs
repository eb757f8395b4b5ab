// Rewatch session client
// Joins a server-coordinated assessment, captures accelerometer windows and
// uploads them at a rendezvous agreed with the server.

pub mod api;
pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod poller;
pub mod sensors;
pub mod session;
pub mod sync;
pub mod types;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use api::{HttpSessionApi, SessionApi};
pub use capture::{CaptureWindow, SampleBuffer};
pub use clock::{AnchoredClock, Clock};
pub use config::{ClientConfig, HandshakeConfig};
pub use error::{AbortReason, Result, RewatchError};
pub use poller::{PollEvent, PollHandle, StagePoller};
pub use sensors::{CaptureSource, SyntheticAccelSource, TermuxAccelSource};
pub use session::{MachineState, Screen, SessionEvent, SessionMachine};
pub use sync::{ClockSync, HandshakeReport};
pub use types::{SensorSample, SessionContext, Stage};
pub use upload::{UploadCoordinator, UploadReceipt};
