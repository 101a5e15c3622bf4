//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to
//! instrument and acquisition problems.
//!
//! ## Error Hierarchy
//!
//! `DaqError` is an enum that consolidates various error sources:
//!
//! - **Preflight**: `Connectivity`, `VoltmeterNotConnected`, `NoSinkSelected` and
//!   `BufferOverflow` are raised before any device command is sent. They are
//!   collected, in check order, into a single `Preflight` error.
//! - **Runtime**: `ArmFailure`, `Timeout` and `MalformedBuffer` abort an active
//!   session. The controller sends an abort to the device and closes the sink
//!   before surfacing them.
//! - **Planning**: `DivideByZero`, `InvalidCount`, `Overflow` and `InvalidSweep`
//!   come from sweep point arithmetic.
//! - **Custom lists**: `Parse` and `LengthMismatch` come from user-entered lists.
//! - **Transport**: `Link` wraps a [`LinkError`] from the instrument link.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use crate::acquisition::session::SessionState;
use crate::instrument::LinkError;
use crate::measurement::custom_list::ListKind;
use crate::measurement::mode::MeasurementMode;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for measurement planning and acquisition.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration sources could not be merged or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The instrument link failed while writing or querying.
    #[error("Instrument link error: {0}")]
    Link(#[from] LinkError),

    /// No listed resource matches the configured current source.
    #[error("No instrument resource matches '{0}'. Check the address and cabling.")]
    Connectivity(String),

    /// The current source reports no voltmeter on its serial link.
    #[error("Voltmeter is not connected to the current source. Check the RS-232 link.")]
    VoltmeterNotConnected,

    /// Persistence was requested but no output file was selected.
    #[error("No file selected. Specify a location to save data.")]
    NoSinkSelected,

    /// The planned point count does not fit the device trace buffer.
    #[error("Requested {points} points exceeds the maximum buffer size ({capacity})")]
    BufferOverflow { points: u64, capacity: u32 },

    /// The device did not report armed after configuration.
    #[error("{0} did not report armed after configuration")]
    ArmFailure(MeasurementMode),

    /// The poll loop exhausted its iteration bound.
    #[error("Timed out after {iterations} polls with {filled} of {expected} points in buffer")]
    Timeout {
        iterations: u64,
        filled: u32,
        expected: u32,
    },

    /// The fetched buffer does not decode into whole records.
    #[error("Malformed buffer: {0}")]
    MalformedBuffer(String),

    /// A custom-list token is not a number.
    #[error("Cannot parse '{token}' in {kind} list as a number")]
    Parse { kind: ListKind, token: String },

    /// A custom list does not match the length of the current list.
    #[error("{kind} list has {actual} entries but the current list has {expected}")]
    LengthMismatch {
        kind: ListKind,
        expected: usize,
        actual: usize,
    },

    #[error("Sweep step must be non-zero")]
    DivideByZero,

    #[error("Point count must be at least 1")]
    InvalidCount,

    #[error("Point count overflows the supported range")]
    Overflow,

    #[error("Invalid sweep: {0}")]
    InvalidSweep(String),

    /// Every failing preflight check, in check order.
    #[error("Cannot start measurement: {}", join_errors(.0))]
    Preflight(Vec<DaqError>),

    /// A run is active; the request was rejected without touching it.
    #[error("Acquisition already in progress ({0})")]
    SessionBusy(SessionState),

    #[error("Unexpected response to '{query}': '{response}'")]
    UnexpectedResponse { query: String, response: String },
}

fn join_errors(errors: &[DaqError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DaqError {
    /// Individual errors carried by this error.
    ///
    /// A `Preflight` aggregate yields its members; anything else yields itself.
    pub fn causes(&self) -> Vec<&DaqError> {
        match self {
            DaqError::Preflight(errors) => errors.iter().collect(),
            other => vec![other],
        }
    }

    /// Whether the error was raised before the device was touched.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DaqError::Preflight(_)
                | DaqError::Connectivity(_)
                | DaqError::VoltmeterNotConnected
                | DaqError::NoSinkSelected
                | DaqError::BufferOverflow { .. }
        )
    }
}
