//! # Keithley dI/dV Acquisition Library
//!
//! Measurement sequencing for a Keithley 6221 current source paired with a
//! 2182A nanovoltmeter: differential conductance, delta, fixed pulse delta
//! and sweep pulse delta runs. The library plans sweeps, translates mode
//! parameters into SCPI command sequences, drives the arm/run/poll/fetch state
//! machine and persists the fetched records.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The `AcquisitionController` state machine, preflight
//!   checks and the event types a front end exchanges with it.
//! - **`config`**: Figment-based settings (defaults, TOML file, environment).
//! - **`error`**: The `DaqError` enum shared by every module.
//! - **`instrument`**: The `InstrumentLink` transport trait, a line-oriented
//!   stream link (TCP or serial) and a simulated source for tests.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`measurement`**: Pure planning: sweep point counts, custom lists,
//!   filter selection, command sequences and trace buffer parsing.
//! - **`storage`**: Record sinks and run metadata sidecars.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod storage;

pub use acquisition::{AcquisitionController, ControllerEvent, RunOutcome, SessionState, UiEvent};
pub use config::Settings;
pub use error::{AppResult, DaqError};
pub use measurement::MeasurementMode;
