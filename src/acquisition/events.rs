//! Events exchanged with a front end.
//!
//! [`UiEvent`]s flow in through [`AcquisitionController::dispatch`];
//! [`ControllerEvent`]s flow out on a broadcast channel. Front ends never hold
//! references into the controller.
//!
//! [`AcquisitionController::dispatch`]: super::controller::AcquisitionController::dispatch

use crate::acquisition::controller::RunOutcome;
use crate::acquisition::session::{RunStatus, SessionState};
use crate::error::AppResult;
use crate::measurement::custom_list::{BuiltList, ListKind};
use crate::measurement::mode::{MeasurementMode, ModeParameters, SourceSettings};
use std::path::PathBuf;
use tokio::task::JoinHandle;

/// Requests from the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    SetMode(MeasurementMode),
    /// Replace one mode's parameters; the mode is implied by the variant.
    UpdateModeConfig(ModeParameters),
    UpdateSource(SourceSettings),
    BuildCustomList { kind: ListKind, text: String },
    Start,
    Stop,
    /// Filter settings of the active mode.
    SetFilter {
        enabled: bool,
        window: u32,
        count: u32,
    },
    /// Output file for the next run; `None` deselects.
    SelectSink(Option<PathBuf>),
}

/// Result of dispatching a [`UiEvent`].
#[derive(Debug)]
pub enum EventOutcome {
    Applied,
    ListBuilt(BuiltList),
    /// The run task; resolves when the run ends.
    Started(JoinHandle<AppResult<RunOutcome>>),
}

/// Notifications to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Parameter inputs must be disabled until `ControlsUnlocked`.
    ControlsLocked,
    ControlsUnlocked,
    Progress {
        filled: u32,
        expected: u32,
        polls: u64,
    },
    Finished {
        status: RunStatus,
        records: usize,
    },
    Failed {
        message: String,
    },
    /// A lenient custom list does not match the current list length.
    ListWarning {
        kind: ListKind,
        expected: usize,
        actual: usize,
    },
}
