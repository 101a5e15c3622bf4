//! Averaging filter selection.

use crate::measurement::command::Command;
use crate::measurement::mode::MeasurementMode;
use serde::{Deserialize, Serialize};

/// Averaging filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Moving,
    Repeating,
}

impl FilterKind {
    pub fn wire_value(&self) -> &'static str {
        match self {
            FilterKind::Moving => "MOV",
            FilterKind::Repeating => "REP",
        }
    }
}

/// Filter settings as applied to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub kind: FilterKind,
    pub window: u32,
    pub count: u32,
    pub enabled: bool,
}

impl FilterConfig {
    /// The control command followed by the state command.
    ///
    /// Both are always sent, so a disabled filter is explicitly switched off.
    pub fn commands(&self) -> [Command; 2] {
        [
            Command::FilterControl {
                kind: self.kind,
                window: self.window,
                count: self.count,
            },
            Command::FilterState(self.enabled),
        ]
    }
}

/// Filter type for a mode.
///
/// Differential conductance always uses a repeating filter and sweep pulse
/// delta a moving one; the other modes follow the operator's toggle.
pub fn select_kind(mode: MeasurementMode, repeating_toggle: bool) -> FilterKind {
    match mode {
        MeasurementMode::DifferentialConductance => FilterKind::Repeating,
        MeasurementMode::SweepPulseDelta => FilterKind::Moving,
        MeasurementMode::Delta | MeasurementMode::FixedPulseDelta => {
            if repeating_toggle {
                FilterKind::Repeating
            } else {
                FilterKind::Moving
            }
        }
    }
}

pub fn configure(
    mode: MeasurementMode,
    repeating_toggle: bool,
    window: u32,
    count: u32,
    enabled: bool,
) -> FilterConfig {
    FilterConfig {
        kind: select_kind(mode, repeating_toggle),
        window,
        count,
        enabled,
    }
}
