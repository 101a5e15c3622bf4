//! Custom sweep list construction from free-form operator input.
//!
//! Lists are typed in as numbers separated by commas and/or whitespace. The
//! current list anchors the other two: an empty compliance or cycle-interval
//! list is filled from the scalar setting, one entry per current.

use crate::error::{AppResult, DaqError};
use crate::measurement::mode::micro;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Which custom list is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Currents,
    Compliances,
    CycleIntervals,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListKind::Currents => "Current",
            ListKind::Compliances => "Compliance",
            ListKind::CycleIntervals => "Cycle interval",
        })
    }
}

/// How a dependent list whose length differs from the current list is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthPolicy {
    /// Accept the list and report the mismatch.
    #[default]
    Lenient,
    /// Reject the list with `LengthMismatch`.
    Strict,
}

/// Length disagreement between a dependent list and the current list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: usize,
    pub actual: usize,
}

impl Mismatch {
    pub fn to_error(self, kind: ListKind) -> DaqError {
        DaqError::LengthMismatch {
            kind,
            expected: self.expected,
            actual: self.actual,
        }
    }
}

/// Current list in amps, with its endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentList {
    pub values: Vec<f64>,
    pub start: f64,
    pub end: f64,
}

/// A compliance or cycle-interval list.
#[derive(Debug, Clone, PartialEq)]
pub struct DependentList {
    pub kind: ListKind,
    /// Volts for compliances, PLC for cycle intervals.
    pub values: Vec<f64>,
    /// Filled from the scalar setting because the input was empty.
    pub auto_copied: bool,
    pub mismatch: Option<Mismatch>,
}

/// Result of building any list.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltList {
    Currents(CurrentList),
    Dependent(DependentList),
}

/// Split operator text into numbers.
///
/// # Errors
/// `Parse` naming the first token that is not a finite number.
pub fn parse_list(kind: ListKind, text: &str) -> AppResult<Vec<f64>> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| DaqError::Parse {
                    kind,
                    token: token.to_string(),
                })
        })
        .collect()
}

/// Builds custom lists according to a [`LengthPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomListBuilder {
    policy: LengthPolicy,
}

impl CustomListBuilder {
    pub fn new(policy: LengthPolicy) -> Self {
        Self { policy }
    }

    /// Build the current list from µA text. Empty input yields `[0.0]`.
    pub fn build_currents(&self, text: &str) -> AppResult<CurrentList> {
        let mut values: Vec<f64> = parse_list(ListKind::Currents, text)?
            .into_iter()
            .map(micro)
            .collect();
        if values.is_empty() {
            values.push(0.0);
        }
        let start = values[0];
        let end = values[values.len() - 1];
        Ok(CurrentList { values, start, end })
    }

    /// Build a compliance (V) or cycle-interval (PLC) list.
    ///
    /// Empty input replicates `scalar` `reference_len` times.
    pub fn build_dependent(
        &self,
        kind: ListKind,
        text: &str,
        scalar: f64,
        reference_len: usize,
    ) -> AppResult<DependentList> {
        let values = parse_list(kind, text)?;
        if values.is_empty() {
            return Ok(DependentList {
                kind,
                values: vec![scalar; reference_len],
                auto_copied: true,
                mismatch: None,
            });
        }

        let mismatch = self.check_length(kind, values.len(), reference_len)?;
        Ok(DependentList {
            kind,
            values,
            auto_copied: false,
            mismatch,
        })
    }

    /// Apply the length policy to a dependent list of `actual` entries
    /// against a current list of `expected` entries.
    ///
    /// # Errors
    /// `LengthMismatch` under [`LengthPolicy::Strict`]. Lenient mismatches are
    /// logged and returned.
    pub fn check_length(
        &self,
        kind: ListKind,
        actual: usize,
        expected: usize,
    ) -> AppResult<Option<Mismatch>> {
        if actual == expected {
            return Ok(None);
        }
        let mismatch = Mismatch { expected, actual };
        match self.policy {
            LengthPolicy::Strict => Err(mismatch.to_error(kind)),
            LengthPolicy::Lenient => {
                warn!(
                    list = %kind,
                    expected,
                    actual,
                    "Custom list length differs from current list"
                );
                Ok(Some(mismatch))
            }
        }
    }
}
