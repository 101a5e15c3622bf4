//! Simulated current source with an attached voltmeter.
//!
//! Understands the subset of the command set the acquisition controller
//! uses: buffer size and clear, arm and arm query, initiate, abort, buffer
//! fill and buffer data. Every call is logged so tests can assert on the
//! exact wire sequence.
//!
//! After `INIT:IMM` on an armed instrument, each `TRAC:POIN:ACT?` advances
//! the buffer fill by a configurable number of points, optionally stalling
//! below the configured size to exercise timeouts.

use super::{InstrumentLink, LinkError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct SimState {
    call_log: Vec<String>,
    buffer_size: u32,
    filled: u32,
    armed: bool,
    running: bool,
}

/// In-process stand-in for the current source and voltmeter.
#[derive(Debug)]
pub struct SimulatedInstrument {
    state: Mutex<SimState>,
    resources: Vec<String>,
    voltmeter_present: bool,
    refuse_arm: bool,
    points_per_poll: u32,
    stall_at: Option<u32>,
    fail_next: AtomicBool,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    /// Default resource reported by [`InstrumentLink::list_resources`].
    pub const DEFAULT_RESOURCE: &'static str = "GPIB0::12::INSTR";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            resources: vec![Self::DEFAULT_RESOURCE.to_string()],
            voltmeter_present: true,
            refuse_arm: false,
            points_per_poll: u32::MAX,
            stall_at: None,
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    pub fn without_voltmeter(mut self) -> Self {
        self.voltmeter_present = false;
        self
    }

    /// Never report armed.
    pub fn refusing_arm(mut self) -> Self {
        self.refuse_arm = true;
        self
    }

    /// Points acquired between consecutive fill queries.
    pub fn with_fill_per_poll(mut self, points: u32) -> Self {
        self.points_per_poll = points.max(1);
        self
    }

    /// Stop filling once `points` are buffered.
    pub fn stalling_at(mut self, points: u32) -> Self {
        self.stall_at = Some(points);
        self
    }

    /// Make the next call fail with `LinkError::Rejected`.
    pub fn trigger_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every command and query received, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    /// Whether a sweep is in progress.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_failure(&self, command: &str) -> Result<(), LinkError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LinkError::Rejected {
                command: command.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    fn buffer_data(filled: u32) -> String {
        let mut tokens = Vec::with_capacity(filled as usize * 5);
        for i in 0..filled {
            let n = f64::from(i);
            let current = if i % 2 == 0 { 1e-5 } else { -1e-5 };
            tokens.push(format!("{:.6E}", 1e-3 + n * 1e-6));
            tokens.push(format!("{:.3}", n * 0.1));
            tokens.push(format!("{current:.6E}"));
            tokens.push(format!("{:.6E}", 2e-3 + n * 1e-6));
            tokens.push(i.to_string());
        }
        format!("{}\n", tokens.join(","))
    }
}

#[async_trait]
impl InstrumentLink for SimulatedInstrument {
    async fn write(&self, command: &str) -> Result<(), LinkError> {
        self.check_failure(command)?;
        let mut state = self.lock();
        state.call_log.push(command.to_string());

        if command.starts_with("*RST") {
            let log = std::mem::take(&mut state.call_log);
            *state = SimState {
                call_log: log,
                ..SimState::default()
            };
        } else if command == "TRAC:CLE" {
            state.filled = 0;
        } else if let Some(points) = command.strip_prefix("TRAC:POIN ") {
            state.buffer_size = points.trim().parse().map_err(|_| LinkError::Rejected {
                command: command.to_string(),
                reason: "invalid point count".to_string(),
            })?;
        } else if command.ends_with(":ARM") {
            state.armed = !self.refuse_arm;
        } else if command == "INIT:IMM" {
            state.running = state.armed;
        } else if command == "SOUR:SWE:ABOR" {
            state.running = false;
            state.armed = false;
        }
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String, LinkError> {
        self.check_failure(command)?;
        let mut state = self.lock();
        state.call_log.push(command.to_string());

        let response = match command {
            "*IDN?" => "KEITHLEY INSTRUMENTS INC.,MODEL 6221,SIMULATED,A01\n".to_string(),
            "SOUR:DCON:NVPR?" => format!("{}\n", u8::from(self.voltmeter_present)),
            "TRAC:POIN:ACT?" => {
                if state.running {
                    let limit = self
                        .stall_at
                        .map_or(state.buffer_size, |stall| stall.min(state.buffer_size));
                    state.filled = state.filled.saturating_add(self.points_per_poll).min(limit);
                }
                format!("{}\n", state.filled)
            }
            "TRAC:DATA?" => Self::buffer_data(state.filled),
            cmd if cmd.ends_with(":ARM?") => format!("{}\n", u8::from(state.armed)),
            _ => {
                return Err(LinkError::Rejected {
                    command: command.to_string(),
                    reason: "unsupported query".to_string(),
                })
            }
        };
        debug!(command, response = response.trim_end(), "Simulated response");
        Ok(response)
    }

    async fn list_resources(&self) -> Vec<String> {
        self.resources.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::parser::parse_buffer;

    #[tokio::test]
    async fn fills_buffer_only_after_initiate() -> Result<(), LinkError> {
        let sim = SimulatedInstrument::new().with_fill_per_poll(2);
        sim.write("TRAC:POIN 5").await?;
        assert_eq!(sim.query("TRAC:POIN:ACT?").await?, "0\n");

        sim.write("SOUR:DELT:ARM").await?;
        assert_eq!(sim.query("SOUR:DELT:ARM?").await?, "1\n");
        sim.write("INIT:IMM").await?;

        assert_eq!(sim.query("TRAC:POIN:ACT?").await?, "2\n");
        assert_eq!(sim.query("TRAC:POIN:ACT?").await?, "4\n");
        assert_eq!(sim.query("TRAC:POIN:ACT?").await?, "5\n");
        Ok(())
    }

    #[tokio::test]
    async fn refusing_arm_never_runs() -> Result<(), LinkError> {
        let sim = SimulatedInstrument::new().refusing_arm();
        sim.write("TRAC:POIN 5").await?;
        sim.write("SOUR:PDEL:ARM").await?;
        assert_eq!(sim.query("SOUR:PDEL:ARM?").await?, "0\n");
        sim.write("INIT:IMM").await?;
        assert!(!sim.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn buffer_data_parses_into_records() -> Result<(), LinkError> {
        let sim = SimulatedInstrument::new();
        sim.write("TRAC:POIN 3").await?;
        sim.write("SOUR:DCON:ARM").await?;
        sim.write("INIT:IMM").await?;
        sim.query("TRAC:POIN:ACT?").await?;

        let parsed = parse_buffer(&sim.query("TRAC:DATA?").await?).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed.records()[2].reading_number, 2);
        Ok(())
    }

    #[tokio::test]
    async fn reports_voltmeter_and_failures() {
        let sim = SimulatedInstrument::new().without_voltmeter();
        assert_eq!(sim.query("SOUR:DCON:NVPR?").await.unwrap(), "0\n");

        sim.trigger_failure();
        assert!(sim.write("TRAC:CLE").await.is_err());
        assert!(sim.write("TRAC:CLE").await.is_ok());
        assert_eq!(sim.call_log(), vec!["SOUR:DCON:NVPR?", "TRAC:CLE"]);
    }
}
