//! Instrument link abstraction.
//!
//! The acquisition core talks to the current source through the narrow
//! [`InstrumentLink`] capability: write a command, query a response, list the
//! resources visible on the bus. Device discovery and connection management
//! live behind implementations of this trait.
//!
//! # Implementations
//!
//! - [`stream::StreamLink`] - line-oriented SCPI over any async byte stream
//!   (TCP raw socket, or a serial GPIB adapter with the `serial` feature)
//! - [`mock::SimulatedInstrument`] - simulated current source and voltmeter
//!   for tests and dry runs
//!
//! Commands cross this boundary as wire text. Everything above it works with
//! the typed values in [`crate::measurement::command`].

pub mod mock;
pub mod stream;

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

/// An error that can occur when talking to the instrument.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,

    #[error("Timed out waiting for response to '{0}'")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device (or simulator) refused the command.
    #[error("Command '{command}' rejected: {reason}")]
    Rejected { command: String, reason: String },
}

/// Capability set the acquisition core consumes from the instrument transport.
///
/// # Contract
/// - `write` sends one command and does not wait for a response
/// - `query` sends one command and returns the device response
/// - A write or query is never interleaved with another call on the same link
#[async_trait]
pub trait InstrumentLink: Send + Sync {
    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> Result<(), LinkError>;

    /// Send a query and return the raw response.
    async fn query(&self, command: &str) -> Result<String, LinkError>;

    /// Resources visible to this link (VISA-style resource strings).
    async fn list_resources(&self) -> Vec<String>;
}

static GPIB_RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^GPIB(\d*)::(\d+)(?:::\d+)?::INSTR$").expect("Invalid GPIB resource regex")
});

/// Primary GPIB address of a resource string, if it is a GPIB instrument.
pub fn gpib_address(resource: &str) -> Option<u8> {
    GPIB_RESOURCE
        .captures(resource.trim())
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// Whether a listed resource refers to the configured device.
///
/// GPIB resources match on primary address regardless of board index;
/// anything else must match exactly (case-insensitive).
pub fn resource_matches(configured: &str, listed: &str) -> bool {
    match (gpib_address(configured), gpib_address(listed)) {
        (Some(want), Some(have)) => want == have,
        _ => configured.trim().eq_ignore_ascii_case(listed.trim()),
    }
}

/// First listed resource matching the configured one.
pub fn find_resource<'a>(configured: &str, listed: &'a [String]) -> Option<&'a String> {
    listed.iter().find(|r| resource_matches(configured, r))
}
