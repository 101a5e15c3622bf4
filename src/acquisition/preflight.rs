//! Checks run before any device command is sent.
//!
//! Gathering facts talks to the link (resource listing, voltmeter presence);
//! judging them is pure. All failing checks are reported together, in the
//! order connectivity, voltmeter, sink, buffer.

use crate::error::{AppResult, DaqError};
use crate::instrument::{find_resource, InstrumentLink};
use crate::measurement::command::{parse_flag, Query};
use crate::measurement::sweep::check_buffer_capacity;
use tracing::{debug, warn};

/// Observations the checks are decided on.
#[derive(Debug)]
pub struct PreflightFacts {
    /// Listed resource matching the configured one.
    pub resource: Option<String>,
    /// Voltmeter presence; `None` when the source was not reachable.
    pub voltmeter: Option<AppResult<bool>>,
    pub sink_required: bool,
    pub sink_selected: bool,
    /// Planned point count, or the planning error.
    pub points: AppResult<u32>,
}

/// A passed preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub resource: String,
    pub points: u32,
}

#[derive(Debug, Clone)]
pub struct PreflightValidator {
    resource: String,
    require_sink: bool,
}

impl PreflightValidator {
    pub fn new(resource: impl Into<String>, require_sink: bool) -> Self {
        Self {
            resource: resource.into(),
            require_sink,
        }
    }

    /// Query the link for everything the checks need.
    ///
    /// The voltmeter is only queried when the source itself was found.
    pub async fn gather(
        &self,
        link: &dyn InstrumentLink,
        sink_selected: bool,
        points: AppResult<u32>,
    ) -> PreflightFacts {
        let listed = link.list_resources().await;
        let resource = find_resource(&self.resource, &listed).cloned();
        debug!(configured = %self.resource, found = ?resource, "Resource lookup");

        let voltmeter = match resource {
            Some(_) => {
                let query = Query::VoltmeterPresent;
                let present = match link.query(&query.to_wire()).await {
                    Ok(response) => parse_flag(query, &response),
                    Err(e) => Err(e.into()),
                };
                Some(present)
            }
            None => None,
        };

        PreflightFacts {
            resource,
            voltmeter,
            sink_required: self.require_sink,
            sink_selected,
            points,
        }
    }

    /// Judge gathered facts.
    ///
    /// # Errors
    /// `Preflight` carrying every failed check in order.
    pub fn evaluate(&self, facts: PreflightFacts) -> AppResult<PreflightReport> {
        let mut failures = Vec::new();

        match facts.voltmeter {
            Some(Ok(true)) => {}
            Some(Ok(false)) => failures.push(DaqError::VoltmeterNotConnected),
            Some(Err(e)) => failures.push(e),
            None => failures.push(DaqError::Connectivity(self.resource.clone())),
        }
        if facts.sink_required && !facts.sink_selected {
            failures.push(DaqError::NoSinkSelected);
        }
        let points = match facts.points {
            Ok(points) => match check_buffer_capacity(points) {
                Ok(()) => Some(points),
                Err(e) => {
                    failures.push(e);
                    None
                }
            },
            Err(e) => {
                failures.push(e);
                None
            }
        };

        match (facts.resource, points) {
            (Some(resource), Some(points)) if failures.is_empty() => {
                Ok(PreflightReport { resource, points })
            }
            _ => {
                for failure in &failures {
                    warn!(%failure, "Preflight check failed");
                }
                Err(DaqError::Preflight(failures))
            }
        }
    }

    pub async fn run(
        &self,
        link: &dyn InstrumentLink,
        sink_selected: bool,
        points: AppResult<u32>,
    ) -> AppResult<PreflightReport> {
        let facts = self.gather(link, sink_selected, points).await;
        self.evaluate(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::SimulatedInstrument;
    use crate::measurement::sweep::BUFFER_CAPACITY;

    fn validator() -> PreflightValidator {
        PreflightValidator::new(SimulatedInstrument::DEFAULT_RESOURCE, true)
    }

    #[tokio::test]
    async fn passes_with_everything_present() {
        let sim = SimulatedInstrument::new();
        let report = validator().run(&sim, true, Ok(10)).await.unwrap();
        assert_eq!(report.points, 10);
        assert_eq!(report.resource, SimulatedInstrument::DEFAULT_RESOURCE);
    }

    #[tokio::test]
    async fn missing_resource_skips_voltmeter_query() {
        let sim = SimulatedInstrument::new().with_resources(vec![]);
        let err = validator().run(&sim, true, Ok(10)).await.unwrap_err();

        assert!(matches!(err.causes().as_slice(), [DaqError::Connectivity(_)]));
        assert!(sim.call_log().is_empty());
    }

    #[tokio::test]
    async fn reports_all_failures_in_order() {
        let sim = SimulatedInstrument::new().without_voltmeter();
        let err = validator()
            .run(&sim, false, Ok(BUFFER_CAPACITY + 1))
            .await
            .unwrap_err();

        let causes = err.causes();
        assert_eq!(causes.len(), 3);
        assert!(matches!(causes[0], DaqError::VoltmeterNotConnected));
        assert!(matches!(causes[1], DaqError::NoSinkSelected));
        assert!(matches!(
            causes[2],
            DaqError::BufferOverflow {
                points: 65_537,
                capacity: 65_536
            }
        ));
    }

    #[tokio::test]
    async fn buffer_boundary_is_inclusive() {
        let sim = SimulatedInstrument::new();
        assert!(validator().run(&sim, true, Ok(BUFFER_CAPACITY)).await.is_ok());
    }

    #[tokio::test]
    async fn sink_optional_when_not_required() {
        let sim = SimulatedInstrument::new();
        let validator = PreflightValidator::new(SimulatedInstrument::DEFAULT_RESOURCE, false);
        assert!(validator.run(&sim, false, Ok(5)).await.is_ok());
    }

    #[tokio::test]
    async fn planning_errors_are_reported() {
        let sim = SimulatedInstrument::new();
        let err = validator()
            .run(&sim, true, Err(DaqError::DivideByZero))
            .await
            .unwrap_err();
        assert!(matches!(err.causes().as_slice(), [DaqError::DivideByZero]));
    }
}
