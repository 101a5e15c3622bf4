//! Measurement modes and their parameter bundles.
//!
//! Parameters exist at two levels:
//!
//! - **UI level** ([`ModeParameters`]): what an operator edits, in the units the
//!   front panel shows (µA, ms, µs, PLC). These are serializable so they can
//!   live in the configuration file.
//! - **Device level** ([`ModeConfig`]): the same bundle converted to amperes,
//!   volts and seconds, with the planned point count resolved. Only a
//!   `ModeConfig` reaches the command builder.
//!
//! Conversion divides by exact powers of ten (µA → A is `x / 1e6`) so that
//! round values stay round on the wire.

use crate::error::AppResult;
use crate::measurement::filter::{self, FilterConfig};
use crate::measurement::sweep::{self, CustomSweep, SweepSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Seconds per power-line cycle used for cycle-interval conversion.
pub const PLC_SECONDS: f64 = 16.667e-3;

/// Microamps to amps.
pub fn micro(value: f64) -> f64 {
    value / 1e6
}

/// Milliseconds to seconds.
pub fn milli(value: f64) -> f64 {
    value / 1e3
}

/// Power-line cycles to seconds.
pub fn plc_to_seconds(plc: f64) -> f64 {
    plc * PLC_SECONDS
}

/// One of the four mutually exclusive sourcing/measurement modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    DifferentialConductance,
    Delta,
    FixedPulseDelta,
    SweepPulseDelta,
}

impl MeasurementMode {
    /// Every mode, in front-panel tab order.
    pub const ALL: [MeasurementMode; 4] = [
        MeasurementMode::DifferentialConductance,
        MeasurementMode::Delta,
        MeasurementMode::FixedPulseDelta,
        MeasurementMode::SweepPulseDelta,
    ];

    /// Human-readable name, used in the persisted header line.
    pub fn title(&self) -> &'static str {
        match self {
            MeasurementMode::DifferentialConductance => "Differential Conductance",
            MeasurementMode::Delta => "Delta",
            MeasurementMode::FixedPulseDelta => "Fixed Pulse Delta",
            MeasurementMode::SweepPulseDelta => "Sweep Pulse Delta",
        }
    }

    /// Whether the voltmeter integration rate is part of this mode's sequence.
    pub fn uses_voltmeter_rate(&self) -> bool {
        matches!(
            self,
            MeasurementMode::DifferentialConductance | MeasurementMode::Delta
        )
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl FromStr for MeasurementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "differential_conductance" | "didv" | "dcon" => {
                Ok(MeasurementMode::DifferentialConductance)
            }
            "delta" => Ok(MeasurementMode::Delta),
            "fixed_pulse_delta" | "fpd" => Ok(MeasurementMode::FixedPulseDelta),
            "sweep_pulse_delta" | "spd" => Ok(MeasurementMode::SweepPulseDelta),
            other => Err(format!("Unknown measurement mode '{other}'")),
        }
    }
}

// =============================================================================
// Instrument-wide settings
// =============================================================================

/// Fixed source ranges of the current source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceRange {
    #[serde(rename = "2nA")]
    Nano2,
    #[serde(rename = "20nA")]
    Nano20,
    #[serde(rename = "200nA")]
    Nano200,
    #[serde(rename = "2uA")]
    Micro2,
    #[serde(rename = "20uA")]
    Micro20,
    #[serde(rename = "200uA")]
    Micro200,
    #[serde(rename = "2mA")]
    Milli2,
    #[serde(rename = "20mA")]
    Milli20,
    #[serde(rename = "100mA")]
    Milli100,
}

impl SourceRange {
    /// Range value as sent to the device.
    pub fn wire_value(&self) -> &'static str {
        match self {
            SourceRange::Nano2 => "2e-9",
            SourceRange::Nano20 => "20e-9",
            SourceRange::Nano200 => "200e-9",
            SourceRange::Micro2 => "2e-6",
            SourceRange::Micro20 => "20e-6",
            SourceRange::Micro200 => "200e-6",
            SourceRange::Milli2 => "2e-3",
            SourceRange::Milli20 => "20e-3",
            SourceRange::Milli100 => "100e-3",
        }
    }
}

/// Source ranging policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRanging {
    /// Best (pulse modes) or auto (delta) ranging.
    Best,
    Fixed(SourceRange),
}

/// Voltmeter measurement ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltmeterRange {
    #[serde(rename = "10mV")]
    Milli10,
    #[serde(rename = "100mV")]
    Milli100,
    #[serde(rename = "1V")]
    Volt1,
    #[serde(rename = "10V")]
    Volt10,
    #[serde(rename = "100V")]
    Volt100,
}

impl VoltmeterRange {
    pub fn wire_value(&self) -> &'static str {
        match self {
            VoltmeterRange::Milli10 => "10e-3",
            VoltmeterRange::Milli100 => "100e-3",
            VoltmeterRange::Volt1 => "1",
            VoltmeterRange::Volt10 => "10",
            VoltmeterRange::Volt100 => "100",
        }
    }
}

/// Units the device reports readings in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingUnit {
    Volts,
    Siemens,
    Ohms,
    WattsAverage,
    WattsPeak,
}

impl ReadingUnit {
    /// Column label for the reading channel in the persisted header.
    pub fn reading_label(&self) -> &'static str {
        match self {
            ReadingUnit::Volts => "Reading (V)",
            ReadingUnit::Siemens => "Reading (S)",
            ReadingUnit::Ohms => "Reading (Ohms)",
            ReadingUnit::WattsAverage => "Reading (W, avg.)",
            ReadingUnit::WattsPeak => "Reading (W, peak)",
        }
    }
}

/// Settings shared by every mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub ranging: SourceRanging,
    /// Compliance voltage in volts.
    pub compliance_v: f64,
    /// Abort the sweep when compliance is reached.
    pub compliance_abort: bool,
    pub voltmeter_range: VoltmeterRange,
    pub units: ReadingUnit,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            ranging: SourceRanging::Best,
            compliance_v: 10.0,
            compliance_abort: false,
            voltmeter_range: VoltmeterRange::Milli100,
            units: ReadingUnit::Volts,
        }
    }
}

// =============================================================================
// UI-level parameters
// =============================================================================

/// Averaging filter state as edited for one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub enabled: bool,
    pub window: u32,
    pub count: u32,
    /// Repeating instead of moving average (Delta and Fixed Pulse Delta only).
    pub repeating: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            window: 0,
            count: 10,
            repeating: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferentialConductanceParams {
    pub start_ua: f64,
    pub stop_ua: f64,
    pub step_ua: f64,
    pub delta_ua: f64,
    pub delay_ms: f64,
    pub rate_plc: f64,
    pub filter: FilterSettings,
}

impl Default for DifferentialConductanceParams {
    fn default() -> Self {
        Self {
            start_ua: -10.0,
            stop_ua: 10.0,
            step_ua: 1.0,
            delta_ua: 0.5,
            delay_ms: 2.0,
            rate_plc: 1.0,
            filter: FilterSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaParams {
    pub high_ua: f64,
    pub low_ua: f64,
    pub count: u32,
    pub delay_ms: f64,
    pub rate_plc: f64,
    pub filter: FilterSettings,
}

impl Default for DeltaParams {
    fn default() -> Self {
        Self {
            high_ua: 10.0,
            low_ua: -10.0,
            count: 100,
            delay_ms: 2.0,
            rate_plc: 1.0,
            filter: FilterSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedPulseDeltaParams {
    pub high_ua: f64,
    pub low_ua: f64,
    pub count: u32,
    pub source_delay_us: f64,
    pub width_us: f64,
    /// Pulse repetition interval in whole power-line cycles.
    pub interval_plc: u32,
    pub low_measure: bool,
    pub filter: FilterSettings,
}

impl Default for FixedPulseDeltaParams {
    fn default() -> Self {
        Self {
            high_ua: 10.0,
            low_ua: 0.0,
            count: 100,
            source_delay_us: 16.0,
            width_us: 110.0,
            interval_plc: 5,
            low_measure: true,
            filter: FilterSettings::default(),
        }
    }
}

/// Sweep shape selected for Sweep Pulse Delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepType {
    Linear,
    Logarithmic,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepPulseDeltaParams {
    pub sweep_type: SweepType,
    pub start_ua: f64,
    pub stop_ua: f64,
    pub step_ua: f64,
    /// Points per sweep for logarithmic sweeps.
    pub points: u32,
    pub width_us: f64,
    /// Cycle interval in power-line cycles.
    pub cycle_plc: f64,
    pub sweeps: u32,
    pub low_measure: bool,
    pub filter: FilterSettings,
    /// Lists for custom sweeps, already converted to amps and volts.
    pub custom: CustomSweep,
}

impl Default for SweepPulseDeltaParams {
    fn default() -> Self {
        Self {
            sweep_type: SweepType::Linear,
            start_ua: 0.0,
            stop_ua: 10.0,
            step_ua: 1.0,
            points: 11,
            width_us: 110.0,
            cycle_plc: 5.0,
            sweeps: 1,
            low_measure: true,
            filter: FilterSettings::default(),
            custom: CustomSweep::default(),
        }
    }
}

/// UI-level parameters for exactly one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeParameters {
    DifferentialConductance(DifferentialConductanceParams),
    Delta(DeltaParams),
    FixedPulseDelta(FixedPulseDeltaParams),
    SweepPulseDelta(SweepPulseDeltaParams),
}

impl ModeParameters {
    pub fn mode(&self) -> MeasurementMode {
        match self {
            ModeParameters::DifferentialConductance(_) => MeasurementMode::DifferentialConductance,
            ModeParameters::Delta(_) => MeasurementMode::Delta,
            ModeParameters::FixedPulseDelta(_) => MeasurementMode::FixedPulseDelta,
            ModeParameters::SweepPulseDelta(_) => MeasurementMode::SweepPulseDelta,
        }
    }

    pub fn filter_settings(&self) -> &FilterSettings {
        match self {
            ModeParameters::DifferentialConductance(p) => &p.filter,
            ModeParameters::Delta(p) => &p.filter,
            ModeParameters::FixedPulseDelta(p) => &p.filter,
            ModeParameters::SweepPulseDelta(p) => &p.filter,
        }
    }

    /// Filter derived for this mode from its edited state.
    pub fn filter_config(&self) -> FilterConfig {
        let settings = self.filter_settings();
        filter::configure(
            self.mode(),
            settings.repeating,
            settings.window,
            settings.count,
            settings.enabled,
        )
    }
}

/// The parameter bundles of all four modes, as held by the front end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeParameterSet {
    pub differential_conductance: DifferentialConductanceParams,
    pub delta: DeltaParams,
    pub fixed_pulse_delta: FixedPulseDeltaParams,
    pub sweep_pulse_delta: SweepPulseDeltaParams,
}

impl ModeParameterSet {
    pub fn get(&self, mode: MeasurementMode) -> ModeParameters {
        match mode {
            MeasurementMode::DifferentialConductance => {
                ModeParameters::DifferentialConductance(self.differential_conductance.clone())
            }
            MeasurementMode::Delta => ModeParameters::Delta(self.delta.clone()),
            MeasurementMode::FixedPulseDelta => {
                ModeParameters::FixedPulseDelta(self.fixed_pulse_delta.clone())
            }
            MeasurementMode::SweepPulseDelta => {
                ModeParameters::SweepPulseDelta(self.sweep_pulse_delta.clone())
            }
        }
    }

    /// Replace one mode's bundle wholesale.
    pub fn set(&mut self, parameters: ModeParameters) {
        match parameters {
            ModeParameters::DifferentialConductance(p) => self.differential_conductance = p,
            ModeParameters::Delta(p) => self.delta = p,
            ModeParameters::FixedPulseDelta(p) => self.fixed_pulse_delta = p,
            ModeParameters::SweepPulseDelta(p) => self.sweep_pulse_delta = p,
        }
    }

    pub fn filter_mut(&mut self, mode: MeasurementMode) -> &mut FilterSettings {
        match mode {
            MeasurementMode::DifferentialConductance => &mut self.differential_conductance.filter,
            MeasurementMode::Delta => &mut self.delta.filter,
            MeasurementMode::FixedPulseDelta => &mut self.fixed_pulse_delta.filter,
            MeasurementMode::SweepPulseDelta => &mut self.sweep_pulse_delta.filter,
        }
    }
}

// =============================================================================
// Device-level configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DifferentialConductanceConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub delta: f64,
    pub delay: f64,
    pub rate_plc: f64,
    pub filter: FilterConfig,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaConfig {
    pub high: f64,
    pub low: f64,
    pub delay: f64,
    pub count: u32,
    pub rate_plc: f64,
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixedPulseDeltaConfig {
    pub high: f64,
    pub low: f64,
    pub source_delay: f64,
    pub width: f64,
    pub interval_plc: u32,
    pub count: u32,
    pub low_measure: bool,
    pub filter: FilterConfig,
}

impl FixedPulseDeltaConfig {
    /// Pulse duty cycle in percent.
    pub fn duty_cycle_percent(&self) -> f64 {
        let period = plc_to_seconds(f64::from(self.interval_plc));
        if period > 0.0 {
            self.width / period * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPulseDeltaConfig {
    pub sweep: SweepSpec,
    pub width: f64,
    pub cycle_plc: f64,
    pub sweeps: u32,
    pub low_measure: bool,
    pub filter: FilterConfig,
    pub points_per_sweep: u32,
    pub total_points: u32,
}

impl SweepPulseDeltaConfig {
    /// Cycle interval (source delay between pulses) in seconds.
    pub fn cycle_seconds(&self) -> f64 {
        plc_to_seconds(self.cycle_plc)
    }
}

/// Device-level parameters for the active mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeConfig {
    DifferentialConductance(DifferentialConductanceConfig),
    Delta(DeltaConfig),
    FixedPulseDelta(FixedPulseDeltaConfig),
    SweepPulseDelta(SweepPulseDeltaConfig),
}

impl ModeConfig {
    /// Convert UI-level parameters and plan the point count.
    ///
    /// # Errors
    /// Propagates sweep planning failures (`DivideByZero`, `InvalidCount`,
    /// `Overflow`, `InvalidSweep`).
    pub fn from_parameters(parameters: &ModeParameters) -> AppResult<Self> {
        let filter = parameters.filter_config();
        let config = match parameters {
            ModeParameters::DifferentialConductance(p) => {
                let (start, stop, step) = (micro(p.start_ua), micro(p.stop_ua), micro(p.step_ua));
                ModeConfig::DifferentialConductance(DifferentialConductanceConfig {
                    start,
                    stop,
                    step,
                    delta: micro(p.delta_ua),
                    delay: milli(p.delay_ms),
                    rate_plc: p.rate_plc,
                    filter,
                    points: sweep::compute_linear_points(start, stop, step)?,
                })
            }
            ModeParameters::Delta(p) => ModeConfig::Delta(DeltaConfig {
                high: micro(p.high_ua),
                low: micro(p.low_ua),
                delay: milli(p.delay_ms),
                count: sweep::validate_count(p.count)?,
                rate_plc: p.rate_plc,
                filter,
            }),
            ModeParameters::FixedPulseDelta(p) => ModeConfig::FixedPulseDelta(FixedPulseDeltaConfig {
                high: micro(p.high_ua),
                low: micro(p.low_ua),
                source_delay: micro(p.source_delay_us),
                width: micro(p.width_us),
                interval_plc: p.interval_plc,
                count: sweep::validate_count(p.count)?,
                low_measure: p.low_measure,
                filter,
            }),
            ModeParameters::SweepPulseDelta(p) => {
                let spec = match p.sweep_type {
                    SweepType::Linear => SweepSpec::Linear {
                        start: micro(p.start_ua),
                        stop: micro(p.stop_ua),
                        step: micro(p.step_ua),
                    },
                    SweepType::Logarithmic => SweepSpec::Logarithmic {
                        start: micro(p.start_ua),
                        stop: micro(p.stop_ua),
                        points: p.points,
                    },
                    SweepType::Custom => SweepSpec::CustomList(p.custom.clone()),
                };
                let points_per_sweep = spec.points_per_sweep()?;
                let sweeps = sweep::validate_count(p.sweeps)?;
                ModeConfig::SweepPulseDelta(SweepPulseDeltaConfig {
                    sweep: spec,
                    width: micro(p.width_us),
                    cycle_plc: p.cycle_plc,
                    sweeps,
                    low_measure: p.low_measure,
                    filter,
                    points_per_sweep,
                    total_points: sweep::compute_sweep_total_points(points_per_sweep, sweeps)?,
                })
            }
        };
        Ok(config)
    }

    pub fn mode(&self) -> MeasurementMode {
        match self {
            ModeConfig::DifferentialConductance(_) => MeasurementMode::DifferentialConductance,
            ModeConfig::Delta(_) => MeasurementMode::Delta,
            ModeConfig::FixedPulseDelta(_) => MeasurementMode::FixedPulseDelta,
            ModeConfig::SweepPulseDelta(_) => MeasurementMode::SweepPulseDelta,
        }
    }

    /// Total points the device buffer must hold for one run.
    pub fn point_count(&self) -> u32 {
        match self {
            ModeConfig::DifferentialConductance(c) => c.points,
            ModeConfig::Delta(c) => c.count,
            ModeConfig::FixedPulseDelta(c) => c.count,
            ModeConfig::SweepPulseDelta(c) => c.total_points,
        }
    }

    pub fn filter(&self) -> &FilterConfig {
        match self {
            ModeConfig::DifferentialConductance(c) => &c.filter,
            ModeConfig::Delta(c) => &c.filter,
            ModeConfig::FixedPulseDelta(c) => &c.filter,
            ModeConfig::SweepPulseDelta(c) => &c.filter,
        }
    }

    /// One-line description of the run, in operator units.
    pub fn summary(&self, source: &SourceSettings) -> String {
        let body = match self {
            ModeConfig::DifferentialConductance(c) => format!(
                "start {} uA, stop {} uA, step {} uA, delta {} uA, delay {} ms, rate {} PLC",
                c.start * 1e6,
                c.stop * 1e6,
                c.step * 1e6,
                c.delta * 1e6,
                c.delay * 1e3,
                c.rate_plc
            ),
            ModeConfig::Delta(c) => format!(
                "high {} uA, low {} uA, delay {} ms, count {}, rate {} PLC",
                c.high * 1e6,
                c.low * 1e6,
                c.delay * 1e3,
                c.count,
                c.rate_plc
            ),
            ModeConfig::FixedPulseDelta(c) => format!(
                "high {} uA, low {} uA, width {} us, interval {} PLC, duty {:.2}%, count {}",
                c.high * 1e6,
                c.low * 1e6,
                c.width * 1e6,
                c.interval_plc,
                c.duty_cycle_percent(),
                c.count
            ),
            ModeConfig::SweepPulseDelta(c) => {
                let sweep = match &c.sweep {
                    SweepSpec::Linear { .. } => "linear",
                    SweepSpec::Logarithmic { .. } => "logarithmic",
                    SweepSpec::CustomList(_) => "custom",
                };
                format!(
                    "{sweep} sweep, {} points x {} sweeps, width {} us, cycle {} PLC",
                    c.points_per_sweep,
                    c.sweeps,
                    c.width * 1e6,
                    c.cycle_plc
                )
            }
        };
        let filter = self.filter();
        let filter = if filter.enabled {
            format!("filter {} {}", filter.kind.wire_value(), filter.count)
        } else {
            "filter off".to_string()
        };
        format!(
            "{}: {body}, compliance {} V, {filter}",
            self.mode().title(),
            source.compliance_v
        )
    }

    /// Voltmeter integration rate, for the modes that set one.
    pub fn voltmeter_rate(&self) -> Option<f64> {
        match self {
            ModeConfig::DifferentialConductance(c) => Some(c.rate_plc),
            ModeConfig::Delta(c) => Some(c.rate_plc),
            ModeConfig::FixedPulseDelta(_) | ModeConfig::SweepPulseDelta(_) => None,
        }
    }
}
