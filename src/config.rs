//! Configuration loading with Figment.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. `config/keithley.toml` (or the path given to [`Settings::load_from`])
//! 3. Environment variables prefixed with `KEITHLEY_DIDV_`, nested keys
//!    separated by `__` (e.g. `KEITHLEY_DIDV_ACQUISITION__POLL_INTERVAL_MS=500`)
//!
//! # Example
//! ```no_run
//! use keithley_didv::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Instrument: {}", settings.instrument.resource);
//! # Ok::<(), keithley_didv::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::logging::{parse_log_level, OutputFormat};
use crate::measurement::custom_list::LengthPolicy;
use crate::measurement::mode::{MeasurementMode, ModeParameterSet, SourceSettings};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/keithley.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "KEITHLEY_DIDV_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub instrument: InstrumentConfig,
    pub acquisition: AcquisitionConfig,
    pub storage: StorageConfig,
    /// Instrument-wide source and voltmeter settings.
    pub source: SourceSettings,
    /// Initial parameters for every mode.
    pub modes: ModeParameterSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Keithley dI/dV".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// How to reach the current source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// VISA-style resource string the preflight looks for.
    pub resource: String,
    /// `host:port` of a raw SCPI socket.
    pub address: Option<String>,
    /// Serial GPIB adapter path (requires the `serial` feature).
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    /// Per-query response timeout.
    pub timeout_ms: u64,
    /// Appended to every command.
    pub terminator: String,
    /// Reset the source when connecting.
    pub reset_on_connect: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            resource: "GPIB0::12::INSTR".to_string(),
            address: None,
            serial_port: None,
            baud_rate: 9600,
            timeout_ms: 5000,
            terminator: "\n".to_string(),
            reset_on_connect: true,
        }
    }
}

impl InstrumentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What to do when the poll loop exhausts its iteration bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Fetch and persist whatever is buffered, then fail with `Timeout`.
    #[default]
    BestEffortFetch,
    /// Fail with `Timeout` without fetching.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Mode selected at startup.
    pub mode: MeasurementMode,
    pub poll_interval_ms: u64,
    /// Wait between initiate and the first poll.
    pub settle_delay_ms: u64,
    /// Poll iterations allowed per planned point.
    pub iteration_factor: u64,
    pub timeout_policy: TimeoutPolicy,
    pub list_length_policy: LengthPolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: MeasurementMode::DifferentialConductance,
            poll_interval_ms: 2000,
            settle_delay_ms: 5000,
            iteration_factor: 1000,
            timeout_policy: TimeoutPolicy::BestEffortFetch,
            list_length_policy: LengthPolicy::Lenient,
        }
    }
}

impl AcquisitionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Refuse to start without a selected output file.
    pub require_sink: bool,
    /// Directory for relative output paths.
    pub output_dir: PathBuf,
    /// Write `<stem>.meta.json` beside each data file.
    pub write_metadata: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            require_sink: true,
            output_dir: PathBuf::from("data"),
            write_metadata: true,
        }
    }
}

impl StorageConfig {
    /// Resolve an output path against `output_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.output_dir.join(path)
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file is not
    /// an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level)?;

        let invalid = |msg: String| Err(DaqError::Configuration(msg));
        if self.instrument.resource.trim().is_empty() {
            return invalid("instrument.resource must not be empty".into());
        }
        if self.instrument.timeout_ms == 0 {
            return invalid("instrument.timeout_ms must be positive".into());
        }
        if self.instrument.terminator.is_empty() {
            return invalid("instrument.terminator must not be empty".into());
        }
        if self.acquisition.poll_interval_ms == 0 {
            return invalid("acquisition.poll_interval_ms must be positive".into());
        }
        if self.acquisition.iteration_factor == 0 {
            return invalid("acquisition.iteration_factor must be at least 1".into());
        }
        let compliance = self.source.compliance_v;
        if !(0.1..=105.0).contains(&compliance) {
            return invalid(format!(
                "source.compliance_v {compliance} outside 0.1..=105 V"
            ));
        }
        Ok(())
    }
}
