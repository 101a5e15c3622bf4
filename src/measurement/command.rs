//! Typed device commands and the per-mode command sequence.
//!
//! Every command the controller sends is a [`Command`] or [`Query`] value.
//! Wire text is produced in exactly one place ([`Command::to_wire`] /
//! [`Query::to_wire`]), so sequences can be compared structurally in tests
//! and rendered once at the link boundary.
//!
//! Numbers are rendered in Rust's shortest round-trip exponent form
//! (`1e-5`, `-1e-5`, `1.6667e-2`), which the source accepts for every
//! numeric parameter.

use crate::error::{AppResult, DaqError};
use crate::measurement::filter::FilterKind;
use crate::measurement::mode::{
    DeltaConfig, DifferentialConductanceConfig, FixedPulseDeltaConfig, MeasurementMode, ModeConfig,
    ReadingUnit, SourceRange, SourceRanging, SourceSettings, SweepPulseDeltaConfig, VoltmeterRange,
};
use crate::measurement::sweep::SweepSpec;

fn num(value: f64) -> String {
    format!("{value:e}")
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "ON"
    } else {
        "OFF"
    }
}

fn list(values: &[f64]) -> String {
    values.iter().map(|v| num(*v)).collect::<Vec<_>>().join(", ")
}

/// Mode whose arm command and arm query are used.
///
/// Both pulse modes arm through the pulse-delta subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmTarget {
    Conductance,
    Delta,
    PulseDelta,
}

impl ArmTarget {
    pub fn for_mode(mode: MeasurementMode) -> Self {
        match mode {
            MeasurementMode::DifferentialConductance => ArmTarget::Conductance,
            MeasurementMode::Delta => ArmTarget::Delta,
            MeasurementMode::FixedPulseDelta | MeasurementMode::SweepPulseDelta => {
                ArmTarget::PulseDelta
            }
        }
    }

    fn subsystem(&self) -> &'static str {
        match self {
            ArmTarget::Conductance => "SOUR:DCON",
            ArmTarget::Delta => "SOUR:DELT",
            ArmTarget::PulseDelta => "SOUR:PDEL",
        }
    }
}

/// Subsystem that owns the source ranging policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingScope {
    /// Delta: auto range on or off.
    Delta,
    /// Fixed pulse delta: best or fixed.
    PulseDelta,
    /// Sweep pulse delta: best or fixed.
    Sweep,
}

/// Subsystem that owns the compliance-abort flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortScope {
    Conductance,
    Delta,
    Sweep,
}

impl AbortScope {
    /// Fixed pulse delta has no compliance-abort setting.
    pub fn for_mode(mode: MeasurementMode) -> Option<Self> {
        match mode {
            MeasurementMode::DifferentialConductance => Some(AbortScope::Conductance),
            MeasurementMode::Delta => Some(AbortScope::Delta),
            MeasurementMode::FixedPulseDelta => None,
            MeasurementMode::SweepPulseDelta => Some(AbortScope::Sweep),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConductanceSetting {
    Start(f64),
    Step(f64),
    Stop(f64),
    Delta(f64),
    Delay(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaSetting {
    High(f64),
    Low(f64),
    Delay(f64),
    Count(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PulseSetting {
    High(f64),
    Low(f64),
    Width(f64),
    SourceDelay(f64),
    Count(u32),
    /// Pulse interval in whole PLC.
    Interval(u32),
    SweepEnabled(bool),
    /// Two low measurements per pulse instead of one.
    LowMeasure(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spacing {
    Linear,
    Logarithmic,
    List,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepSetting {
    Count(u32),
    Spacing(Spacing),
    Points(u32),
    SourceDelay(f64),
    Start(f64),
    Stop(f64),
    Step(f64),
    ListCurrents(Vec<f64>),
    ListCompliances(Vec<f64>),
    ListDelays(Vec<f64>),
}

/// A command that expects no response.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Reset and select slow output response.
    Reset,
    ClearBuffer,
    FilterControl {
        kind: FilterKind,
        window: u32,
        count: u32,
    },
    FilterState(bool),
    Units(ReadingUnit),
    VoltmeterRange(VoltmeterRange),
    /// Voltmeter integration rate in PLC.
    VoltmeterRate(f64),
    Compliance(f64),
    Ranging {
        scope: RangingScope,
        best: bool,
    },
    SourceRange(SourceRange),
    Conductance(ConductanceSetting),
    Delta(DeltaSetting),
    PulseDelta(PulseSetting),
    Sweep(SweepSetting),
    ComplianceAbort {
        scope: AbortScope,
        enabled: bool,
    },
    BufferPoints(u32),
    Arm(ArmTarget),
    /// Select the five buffer elements the parser expects.
    FormatElements,
    Initiate,
    AbortSweep,
}

impl Command {
    /// Text sent to the device.
    pub fn to_wire(&self) -> String {
        match self {
            Command::Reset => "*RST; OUTP:RESP SLOW".to_string(),
            Command::ClearBuffer => "TRAC:CLE".to_string(),
            Command::FilterControl {
                kind,
                window,
                count,
            } => format!(
                "SENS:AVER:TCON {}; WIND {window}; COUN {count}",
                kind.wire_value()
            ),
            Command::FilterState(enabled) => format!("SENS:AVER {}", on_off(*enabled)),
            Command::Units(unit) => match unit {
                ReadingUnit::Volts => "UNIT V".to_string(),
                ReadingUnit::Siemens => "UNIT SIEM".to_string(),
                ReadingUnit::Ohms => "UNIT OHMS".to_string(),
                ReadingUnit::WattsAverage => "UNIT W; POWER AVER".to_string(),
                ReadingUnit::WattsPeak => "UNIT W; POWER PEAK".to_string(),
            },
            Command::VoltmeterRange(range) => format!(
                "SYST:COMM:SER:SEND ':SENS:VOLT:RANG {}'",
                range.wire_value()
            ),
            Command::VoltmeterRate(plc) => {
                format!("SYST:COMM:SER:SEND ':SENS:VOLT:NPLC {plc}'")
            }
            Command::Compliance(volts) => format!("CURR:COMP {}", num(*volts)),
            Command::Ranging { scope, best } => match scope {
                RangingScope::Delta => format!("CURR:RANG:AUTO {}", on_off(*best)),
                RangingScope::PulseDelta => {
                    format!("SOUR:PDEL:RANG {}", if *best { "BEST" } else { "FIX" })
                }
                RangingScope::Sweep => {
                    format!("SOUR:SWE:RANG {}", if *best { "BEST" } else { "FIX" })
                }
            },
            Command::SourceRange(range) => format!("CURR:RANG {}", range.wire_value()),
            Command::Conductance(setting) => match setting {
                ConductanceSetting::Start(v) => format!("SOUR:DCON:STAR {}", num(*v)),
                ConductanceSetting::Step(v) => format!("SOUR:DCON:STEP {}", num(*v)),
                ConductanceSetting::Stop(v) => format!("SOUR:DCON:STOP {}", num(*v)),
                ConductanceSetting::Delta(v) => format!("SOUR:DCON:DELTA {}", num(*v)),
                ConductanceSetting::Delay(v) => format!("SOUR:DCON:DELAY {}", num(*v)),
            },
            Command::Delta(setting) => match setting {
                DeltaSetting::High(v) => format!("SOUR:DELT:HIGH {}", num(*v)),
                DeltaSetting::Low(v) => format!("SOUR:DELT:LOW {}", num(*v)),
                DeltaSetting::Delay(v) => format!("SOUR:DELT:DEL {}", num(*v)),
                DeltaSetting::Count(n) => format!("SOUR:DELT:COUN {n}"),
            },
            Command::PulseDelta(setting) => match setting {
                PulseSetting::High(v) => format!("SOUR:PDEL:HIGH {}", num(*v)),
                PulseSetting::Low(v) => format!("SOUR:PDEL:LOW {}", num(*v)),
                PulseSetting::Width(v) => format!("SOUR:PDEL:WIDT {}", num(*v)),
                PulseSetting::SourceDelay(v) => format!("SOUR:PDEL:SDEL {}", num(*v)),
                PulseSetting::Count(n) => format!("SOUR:PDEL:COUN {n}"),
                PulseSetting::Interval(n) => format!("SOUR:PDEL:INT {n}"),
                PulseSetting::SweepEnabled(on) => format!("SOUR:PDEL:SWE {}", on_off(*on)),
                PulseSetting::LowMeasure(two) => {
                    format!("SOUR:PDEL:LME {}", if *two { 2 } else { 1 })
                }
            },
            Command::Sweep(setting) => match setting {
                SweepSetting::Count(n) => format!("SOUR:SWE:COUN {n}"),
                SweepSetting::Spacing(spacing) => format!(
                    "SOUR:SWE:SPAC {}",
                    match spacing {
                        Spacing::Linear => "LIN",
                        Spacing::Logarithmic => "LOG",
                        Spacing::List => "LIST",
                    }
                ),
                SweepSetting::Points(n) => format!("SOUR:SWE:POIN {n}"),
                SweepSetting::SourceDelay(v) => format!("SOUR:DEL {}", num(*v)),
                SweepSetting::Start(v) => format!("SOUR:CURR:STAR {}", num(*v)),
                SweepSetting::Stop(v) => format!("SOUR:CURR:STOP {}", num(*v)),
                SweepSetting::Step(v) => format!("SOUR:CURR:STEP {}", num(*v)),
                SweepSetting::ListCurrents(values) => format!("SOUR:LIST:CURR {}", list(values)),
                SweepSetting::ListCompliances(values) => {
                    format!("SOUR:LIST:COMP {}", list(values))
                }
                SweepSetting::ListDelays(values) => format!("SOUR:LIST:DEL {}", list(values)),
            },
            Command::ComplianceAbort { scope, enabled } => {
                let subsystem = match scope {
                    AbortScope::Conductance => "SOUR:DCON",
                    AbortScope::Delta => "SOUR:DELT",
                    AbortScope::Sweep => "SOUR:SWE",
                };
                format!("{subsystem}:CAB {}", on_off(*enabled))
            }
            Command::BufferPoints(n) => format!("TRAC:POIN {n}"),
            Command::Arm(target) => format!("{}:ARM", target.subsystem()),
            Command::FormatElements => "FORM:ELEM READ, TST, RNUM, SOUR, AVOL".to_string(),
            Command::Initiate => "INIT:IMM".to_string(),
            Command::AbortSweep => "SOUR:SWE:ABOR".to_string(),
        }
    }
}

/// A command that expects a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Identify,
    VoltmeterPresent,
    ArmState(ArmTarget),
    BufferFill,
    BufferData,
}

impl Query {
    pub fn to_wire(&self) -> String {
        match self {
            Query::Identify => "*IDN?".to_string(),
            Query::VoltmeterPresent => "SOUR:DCON:NVPR?".to_string(),
            Query::ArmState(target) => format!("{}:ARM?", target.subsystem()),
            Query::BufferFill => "TRAC:POIN:ACT?".to_string(),
            Query::BufferData => "TRAC:DATA?".to_string(),
        }
    }
}

/// Armed iff the response contains a `1`.
pub fn parse_armed(response: &str) -> bool {
    response.contains('1')
}

/// Boolean response (`0`/`1`, optionally signed or as a float).
pub fn parse_flag(query: Query, response: &str) -> AppResult<bool> {
    let trimmed = response.trim();
    trimmed
        .parse::<f64>()
        .map(|v| v != 0.0)
        .map_err(|_| unexpected(query, response))
}

/// Buffer fill count.
pub fn parse_fill(response: &str) -> AppResult<u32> {
    let trimmed = response.trim();
    if let Ok(count) = trimmed.parse::<u32>() {
        return Ok(count);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) => {
            Ok(v as u32)
        }
        _ => Err(unexpected(Query::BufferFill, response)),
    }
}

fn unexpected(query: Query, response: &str) -> DaqError {
    DaqError::UnexpectedResponse {
        query: query.to_wire(),
        response: response.trim().to_string(),
    }
}

/// Ordered commands for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    /// Filter, instrument-wide, mode-specific, compliance-abort and buffer
    /// size commands.
    pub configure: Vec<Command>,
    pub arm: Command,
    pub confirm: Query,
}

impl CommandPlan {
    /// Whole sequence as wire text, arm query last.
    pub fn wire_sequence(&self) -> Vec<String> {
        self.configure
            .iter()
            .chain(std::iter::once(&self.arm))
            .map(Command::to_wire)
            .chain(std::iter::once(self.confirm.to_wire()))
            .collect()
    }
}

/// Assembles the command sequence for a mode configuration.
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn build(config: &ModeConfig, source: &SourceSettings) -> CommandPlan {
        let mode = config.mode();
        let mut commands: Vec<Command> = config.filter().commands().into();

        commands.push(Command::Units(source.units));
        commands.push(Command::VoltmeterRange(source.voltmeter_range));
        if let Some(rate) = config.voltmeter_rate() {
            commands.push(Command::VoltmeterRate(rate));
        }
        commands.push(Command::Compliance(source.compliance_v));
        commands.extend(ranging_commands(mode, source.ranging));

        match config {
            ModeConfig::DifferentialConductance(c) => conductance_commands(c, &mut commands),
            ModeConfig::Delta(c) => delta_commands(c, &mut commands),
            ModeConfig::FixedPulseDelta(c) => fixed_pulse_commands(c, &mut commands),
            ModeConfig::SweepPulseDelta(c) => sweep_pulse_commands(c, source, &mut commands),
        }

        if let Some(scope) = AbortScope::for_mode(mode) {
            commands.push(Command::ComplianceAbort {
                scope,
                enabled: source.compliance_abort,
            });
        }
        commands.push(Command::BufferPoints(config.point_count()));

        let target = ArmTarget::for_mode(mode);
        CommandPlan {
            configure: commands,
            arm: Command::Arm(target),
            confirm: Query::ArmState(target),
        }
    }
}

fn ranging_commands(mode: MeasurementMode, ranging: SourceRanging) -> Vec<Command> {
    let scope = match mode {
        MeasurementMode::DifferentialConductance => return Vec::new(),
        MeasurementMode::Delta => RangingScope::Delta,
        MeasurementMode::FixedPulseDelta => RangingScope::PulseDelta,
        MeasurementMode::SweepPulseDelta => RangingScope::Sweep,
    };
    match ranging {
        SourceRanging::Best => vec![Command::Ranging { scope, best: true }],
        SourceRanging::Fixed(range) => vec![
            Command::Ranging { scope, best: false },
            Command::SourceRange(range),
        ],
    }
}

fn conductance_commands(c: &DifferentialConductanceConfig, out: &mut Vec<Command>) {
    out.extend(
        [
            ConductanceSetting::Start(c.start),
            ConductanceSetting::Step(c.step),
            ConductanceSetting::Stop(c.stop),
            ConductanceSetting::Delta(c.delta),
            ConductanceSetting::Delay(c.delay),
        ]
        .map(Command::Conductance),
    );
}

fn delta_commands(c: &DeltaConfig, out: &mut Vec<Command>) {
    out.extend(
        [
            DeltaSetting::High(c.high),
            DeltaSetting::Low(c.low),
            DeltaSetting::Delay(c.delay),
            DeltaSetting::Count(c.count),
        ]
        .map(Command::Delta),
    );
}

fn fixed_pulse_commands(c: &FixedPulseDeltaConfig, out: &mut Vec<Command>) {
    out.extend(
        [
            PulseSetting::High(c.high),
            PulseSetting::Low(c.low),
            PulseSetting::Width(c.width),
            PulseSetting::SourceDelay(c.source_delay),
            PulseSetting::Count(c.count),
            PulseSetting::Interval(c.interval_plc),
            PulseSetting::SweepEnabled(false),
            PulseSetting::LowMeasure(c.low_measure),
        ]
        .map(Command::PulseDelta),
    );
}

fn sweep_pulse_commands(c: &SweepPulseDeltaConfig, source: &SourceSettings, out: &mut Vec<Command>) {
    out.extend(
        [
            PulseSetting::Width(c.width),
            PulseSetting::Count(c.points_per_sweep),
            PulseSetting::LowMeasure(c.low_measure),
            PulseSetting::SweepEnabled(true),
        ]
        .map(Command::PulseDelta),
    );
    out.push(Command::Sweep(SweepSetting::Count(c.sweeps)));

    let delay = c.cycle_seconds();
    let settings = match &c.sweep {
        SweepSpec::Linear { start, stop, step } => vec![
            SweepSetting::Spacing(Spacing::Linear),
            SweepSetting::SourceDelay(delay),
            SweepSetting::Start(*start),
            SweepSetting::Stop(*stop),
            SweepSetting::Step(*step),
        ],
        SweepSpec::Logarithmic {
            start,
            stop,
            points,
        } => vec![
            SweepSetting::Spacing(Spacing::Logarithmic),
            SweepSetting::Points(*points),
            SweepSetting::SourceDelay(delay),
            SweepSetting::Start(*start),
            SweepSetting::Stop(*stop),
        ],
        SweepSpec::CustomList(lists) => vec![
            SweepSetting::Spacing(Spacing::List),
            SweepSetting::ListCurrents(lists.currents.clone()),
            SweepSetting::ListCompliances(lists.resolved_compliances(source.compliance_v)),
            SweepSetting::ListDelays(lists.resolved_delays(c.cycle_plc)),
        ],
    };
    out.extend(settings.into_iter().map(Command::Sweep));
}
