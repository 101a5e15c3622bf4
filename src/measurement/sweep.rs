//! Sweep point planning.
//!
//! Point counts decide the device trace buffer size, so every function here
//! is exact about edge cases: a zero step is an error rather than an infinite
//! loop, and products are checked against `u32`.

use crate::error::{AppResult, DaqError};
use crate::measurement::mode::plc_to_seconds;
use serde::{Deserialize, Serialize};

/// Capacity of the current source trace buffer, in points.
pub const BUFFER_CAPACITY: u32 = 65_536;

/// Relative tolerance applied before flooring a linear point count.
///
/// `(stop - start) / step` is often a hair below an integer after the
/// µA → A conversion; the tolerance keeps e.g. 0..1e-5 by 1e-6 at 11 points.
const LINEAR_TOLERANCE: f64 = 1e-9;

/// User-entered lists for a custom sweep, in amps, volts and PLC.
///
/// An empty `compliances` or `cycle_intervals_plc` list means the scalar
/// setting applies to every point. Lists of another length than `currents`
/// are sent as entered; the list builder decides whether to allow them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomSweep {
    pub currents: Vec<f64>,
    pub compliances: Vec<f64>,
    pub cycle_intervals_plc: Vec<f64>,
}

impl CustomSweep {
    /// Compliance per point, replicating `scalar` when no list was given.
    pub fn resolved_compliances(&self, scalar: f64) -> Vec<f64> {
        resolve(&self.compliances, scalar, self.currents.len())
    }

    /// Source delay per point in seconds, replicating `scalar_plc` when no
    /// list was given.
    pub fn resolved_delays(&self, scalar_plc: f64) -> Vec<f64> {
        resolve(&self.cycle_intervals_plc, scalar_plc, self.currents.len())
            .into_iter()
            .map(plc_to_seconds)
            .collect()
    }
}

fn resolve(values: &[f64], scalar: f64, len: usize) -> Vec<f64> {
    if values.is_empty() {
        vec![scalar; len]
    } else {
        values.to_vec()
    }
}

/// Sweep shape for Sweep Pulse Delta, in device units.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepSpec {
    Linear { start: f64, stop: f64, step: f64 },
    Logarithmic { start: f64, stop: f64, points: u32 },
    CustomList(CustomSweep),
}

impl SweepSpec {
    /// Points in one sweep.
    pub fn points_per_sweep(&self) -> AppResult<u32> {
        match self {
            SweepSpec::Linear { start, stop, step } => compute_linear_points(*start, *stop, *step),
            SweepSpec::Logarithmic { start, stop, points } => {
                if *start <= 0.0 || *stop <= 0.0 {
                    return Err(DaqError::InvalidSweep(
                        "logarithmic sweep bounds must be positive".into(),
                    ));
                }
                compute_logarithmic_points(*points)
            }
            SweepSpec::CustomList(list) => validate_count(compute_custom_points(&list.currents)),
        }
    }
}

/// Points in a linear sweep: `floor(|stop - start| / |step|) + 1`.
///
/// # Errors
/// `DivideByZero` for a zero step, `InvalidSweep` for non-finite input,
/// `Overflow` when the count does not fit `u32`.
pub fn compute_linear_points(start: f64, stop: f64, step: f64) -> AppResult<u32> {
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return Err(DaqError::InvalidSweep(format!(
            "non-finite sweep bounds ({start}, {stop}, {step})"
        )));
    }
    if step == 0.0 {
        return Err(DaqError::DivideByZero);
    }
    let ratio = ((stop - start) / step).abs();
    let intervals = (ratio * (1.0 + LINEAR_TOLERANCE)).floor();
    if intervals >= f64::from(u32::MAX) {
        return Err(DaqError::Overflow);
    }
    // In range and non-negative after the check above.
    Ok(intervals as u32 + 1)
}

/// A user-entered count, which must be at least one.
pub fn validate_count(value: u32) -> AppResult<u32> {
    if value == 0 {
        Err(DaqError::InvalidCount)
    } else {
        Ok(value)
    }
}

/// Points in a logarithmic sweep: the user value, if at least one.
pub fn compute_logarithmic_points(user_value: u32) -> AppResult<u32> {
    validate_count(user_value)
}

/// Points in a custom sweep: the number of currents.
pub fn compute_custom_points(currents: &[f64]) -> u32 {
    u32::try_from(currents.len()).unwrap_or(u32::MAX)
}

/// Total points across repeated sweeps.
pub fn compute_sweep_total_points(points_per_sweep: u32, sweep_count: u32) -> AppResult<u32> {
    points_per_sweep
        .checked_mul(sweep_count)
        .ok_or(DaqError::Overflow)
}

/// Reject point counts the trace buffer cannot hold.
pub fn check_buffer_capacity(points: u32) -> AppResult<()> {
    if points > BUFFER_CAPACITY {
        Err(DaqError::BufferOverflow {
            points: u64::from(points),
            capacity: BUFFER_CAPACITY,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_counts_include_both_ends() {
        assert_eq!(compute_linear_points(0.0, 10e-6, 1e-6).unwrap(), 11);
        assert_eq!(compute_linear_points(-10e-6, 10e-6, 1e-6).unwrap(), 21);
        assert_eq!(compute_linear_points(0.0, -10.0, 2.0).unwrap(), 6);
        assert_eq!(compute_linear_points(5.0, 5.0, 1.0).unwrap(), 1);
    }

    #[test]
    fn linear_counts_floor_partial_steps() {
        assert_eq!(compute_linear_points(0.0, 1.0, 0.3).unwrap(), 4);
    }

    #[test]
    fn linear_direction_does_not_matter() {
        assert_eq!(compute_linear_points(10e-6, 0.0, 1e-6).unwrap(), 11);
        assert_eq!(compute_linear_points(0.0, 10e-6, -1e-6).unwrap(), 11);
    }

    #[test]
    fn zero_step_is_divide_by_zero() {
        assert!(matches!(
            compute_linear_points(0.0, 1.0, 0.0),
            Err(DaqError::DivideByZero)
        ));
    }

    #[test]
    fn non_finite_bounds_are_rejected() {
        assert!(matches!(
            compute_linear_points(f64::NAN, 1.0, 0.1),
            Err(DaqError::InvalidSweep(_))
        ));
    }

    #[test]
    fn huge_linear_counts_overflow() {
        assert!(matches!(
            compute_linear_points(0.0, 1.0, 1e-12),
            Err(DaqError::Overflow)
        ));
    }

    #[test]
    fn logarithmic_requires_at_least_one_point() {
        assert_eq!(compute_logarithmic_points(20).unwrap(), 20);
        assert!(matches!(
            compute_logarithmic_points(0),
            Err(DaqError::InvalidCount)
        ));
    }

    #[test]
    fn total_points_checks_overflow() {
        assert_eq!(compute_sweep_total_points(20, 3).unwrap(), 60);
        assert!(matches!(
            compute_sweep_total_points(u32::MAX, 2),
            Err(DaqError::Overflow)
        ));
    }

    #[test]
    fn buffer_capacity_boundary() {
        assert!(check_buffer_capacity(BUFFER_CAPACITY).is_ok());
        assert!(matches!(
            check_buffer_capacity(BUFFER_CAPACITY + 1),
            Err(DaqError::BufferOverflow { points: 65_537, capacity: 65_536 })
        ));
    }

    #[test]
    fn custom_sweep_replicates_scalars() {
        let sweep = CustomSweep {
            currents: vec![1e-6, 2e-6, 3e-6],
            compliances: vec![],
            cycle_intervals_plc: vec![],
        };
        assert_eq!(sweep.resolved_compliances(5.0), vec![5.0; 3]);
        assert_eq!(sweep.resolved_delays(1.0), vec![16.667e-3; 3]);
        assert_eq!(
            SweepSpec::CustomList(sweep).points_per_sweep().unwrap(),
            3
        );
    }

    #[test]
    fn custom_sweep_counts_currents_only() {
        let sweep = CustomSweep {
            currents: vec![1e-6, 2e-6],
            compliances: vec![1.0],
            cycle_intervals_plc: vec![],
        };
        assert_eq!(sweep.resolved_compliances(5.0), vec![1.0]);
        assert_eq!(SweepSpec::CustomList(sweep).points_per_sweep().unwrap(), 2);
    }

    #[test]
    fn logarithmic_bounds_must_be_positive() {
        let spec = SweepSpec::Logarithmic {
            start: 0.0,
            stop: 1e-5,
            points: 10,
        };
        assert!(matches!(
            spec.points_per_sweep(),
            Err(DaqError::InvalidSweep(_))
        ));
    }
}
