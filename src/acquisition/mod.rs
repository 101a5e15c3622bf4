//! Run orchestration: preflight, session state and the controller that drives
//! a measurement from arm to persisted records.

pub mod controller;
pub mod events;
pub mod preflight;
pub mod session;

pub use controller::{AcquisitionController, MeasurementSetup, RunOutcome};
pub use events::{ControllerEvent, EventOutcome, UiEvent};
pub use preflight::{PreflightFacts, PreflightReport, PreflightValidator};
pub use session::{AcquisitionSession, FailureKind, RunStatus, SessionState, StopFlag};
