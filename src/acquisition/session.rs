//! Acquisition session state.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──> Validating ──ok──> Configuring ──> Armed ──ok──> Running ──> Polling
//!   ▲                 │                   │            │                          │
//!   │                 │fail               │fail        │not armed      filled / timeout
//!   │                 ▼                   ▼            ▼                          ▼
//!   │               Error ◄───────────────┴────────────┘                     Completing
//!   │                                                                             │
//!   └──────────────────────────────── Stopping ◄──stop()── (any active) ──────────┘
//! ```
//!
//! `Error` is a resting state: a new `start` is accepted from it.

use crate::error::DaqError;
use crate::measurement::filter::FilterConfig;
use crate::measurement::mode::{MeasurementMode, ModeConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Why a session ended in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Preflight,
    Planning,
    ArmFailure,
    Timeout,
    MalformedBuffer,
    Link,
    Storage,
}

impl FailureKind {
    /// Classify an error raised during a run.
    pub fn of(error: &DaqError) -> Self {
        match error {
            e if e.is_preflight() => FailureKind::Preflight,
            DaqError::ArmFailure(_) => FailureKind::ArmFailure,
            DaqError::Timeout { .. } => FailureKind::Timeout,
            DaqError::MalformedBuffer(_) => FailureKind::MalformedBuffer,
            DaqError::Link(_) | DaqError::UnexpectedResponse { .. } => FailureKind::Link,
            DaqError::Io(_) => FailureKind::Storage,
            _ => FailureKind::Planning,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Preflight => write!(f, "Preflight"),
            FailureKind::Planning => write!(f, "Planning"),
            FailureKind::ArmFailure => write!(f, "ArmFailure"),
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::MalformedBuffer => write!(f, "MalformedBuffer"),
            FailureKind::Link => write!(f, "Link"),
            FailureKind::Storage => write!(f, "Storage"),
        }
    }
}

/// Lifecycle state of the acquisition controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Validating,
    Configuring,
    Armed,
    Running,
    Polling,
    Completing,
    Stopping,
    Error(FailureKind),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Validating => write!(f, "Validating"),
            SessionState::Configuring => write!(f, "Configuring"),
            SessionState::Armed => write!(f, "Armed"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Polling => write!(f, "Polling"),
            SessionState::Completing => write!(f, "Completing"),
            SessionState::Stopping => write!(f, "Stopping"),
            SessionState::Error(kind) => write!(f, "Error({kind})"),
        }
    }
}

impl SessionState {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Error(_))
    }

    /// A run task owns the device in this state.
    pub fn is_active(&self) -> bool {
        !self.can_begin()
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Stopped,
    TimedOut,
    Failed,
}

/// The run currently (or most recently) driven by the controller.
#[derive(Debug, Clone)]
pub struct AcquisitionSession {
    pub run_id: Option<Uuid>,
    pub mode: MeasurementMode,
    pub config: Option<ModeConfig>,
    pub filter: Option<FilterConfig>,
    pub point_count: u32,
    /// Last fill count reported by the device.
    pub buffer_count: u32,
    pub state: SessionState,
    pub armed: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub polls: u64,
    pub last_error: Option<String>,
}

impl AcquisitionSession {
    pub fn new(mode: MeasurementMode) -> Self {
        Self {
            run_id: None,
            mode,
            config: None,
            filter: None,
            point_count: 0,
            buffer_count: 0,
            state: SessionState::Idle,
            armed: false,
            started_at: None,
            polls: 0,
            last_error: None,
        }
    }

    /// Reset for a new run and enter `Validating`.
    pub fn begin(&mut self, mode: MeasurementMode) -> Uuid {
        let run_id = Uuid::new_v4();
        *self = Self {
            run_id: Some(run_id),
            state: SessionState::Validating,
            ..Self::new(mode)
        };
        run_id
    }

    /// Attach the planned configuration.
    pub fn plan(&mut self, config: ModeConfig) {
        self.point_count = config.point_count();
        self.filter = Some(*config.filter());
        self.config = Some(config);
    }
}

/// Cancellation request checked by the run task at suspension points.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::mode::{DeltaParams, ModeParameters};

    #[test]
    fn only_resting_states_can_begin() {
        assert!(SessionState::Idle.can_begin());
        assert!(SessionState::Error(FailureKind::Timeout).can_begin());
        for state in [
            SessionState::Validating,
            SessionState::Configuring,
            SessionState::Armed,
            SessionState::Running,
            SessionState::Polling,
            SessionState::Completing,
            SessionState::Stopping,
        ] {
            assert!(state.is_active(), "{state} should be active");
        }
    }

    #[test]
    fn displays_error_kind() {
        assert_eq!(
            SessionState::Error(FailureKind::ArmFailure).to_string(),
            "Error(ArmFailure)"
        );
    }

    #[test]
    fn begin_resets_previous_run() {
        let mut session = AcquisitionSession::new(MeasurementMode::Delta);
        session.buffer_count = 7;
        session.last_error = Some("old".into());

        let run_id = session.begin(MeasurementMode::Delta);
        assert_eq!(session.run_id, Some(run_id));
        assert_eq!(session.state, SessionState::Validating);
        assert_eq!(session.buffer_count, 0);
        assert!(session.last_error.is_none());

        let config =
            ModeConfig::from_parameters(&ModeParameters::Delta(DeltaParams::default())).unwrap();
        session.plan(config);
        assert_eq!(session.point_count, 100);
        assert!(session.filter.is_some());
    }

    #[test]
    fn classifies_failures() {
        assert_eq!(
            FailureKind::of(&DaqError::Preflight(vec![])),
            FailureKind::Preflight
        );
        assert_eq!(
            FailureKind::of(&DaqError::ArmFailure(MeasurementMode::Delta)),
            FailureKind::ArmFailure
        );
        assert_eq!(
            FailureKind::of(&DaqError::MalformedBuffer("x".into())),
            FailureKind::MalformedBuffer
        );
        assert_eq!(FailureKind::of(&DaqError::DivideByZero), FailureKind::Planning);
    }

    #[test]
    fn stop_flag_is_shared_between_clones() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        clone.trigger();
        assert!(flag.is_triggered());
        flag.reset();
        assert!(!clone.is_triggered());
    }
}
