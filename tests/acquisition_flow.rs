//! End-to-end runs of the acquisition controller against the simulated source.

use async_trait::async_trait;
use keithley_didv::acquisition::{
    AcquisitionController, ControllerEvent, EventOutcome, FailureKind, RunOutcome, RunStatus,
    SessionState, UiEvent,
};
use keithley_didv::config::{Settings, TimeoutPolicy};
use keithley_didv::error::{AppResult, DaqError};
use keithley_didv::instrument::mock::SimulatedInstrument;
use keithley_didv::instrument::{InstrumentLink, LinkError};
use keithley_didv::measurement::custom_list::ListKind;
use keithley_didv::measurement::mode::{
    DeltaParams, MeasurementMode, ModeParameters, SweepPulseDeltaParams, SweepType,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const DELTA_HEADER: &str =
    "Delta Reading (V)\ttimestamp (s)\tCurrent (A)\tAvg. Voltage (V)\tReading Number";

/// Simulated source that rejects one command.
struct FailOn {
    inner: Arc<SimulatedInstrument>,
    command: &'static str,
}

#[async_trait]
impl InstrumentLink for FailOn {
    async fn write(&self, command: &str) -> Result<(), LinkError> {
        if command == self.command {
            return Err(LinkError::Rejected {
                command: command.to_string(),
                reason: "injected".to_string(),
            });
        }
        self.inner.write(command).await
    }

    async fn query(&self, command: &str) -> Result<String, LinkError> {
        self.inner.query(command).await
    }

    async fn list_resources(&self) -> Vec<String> {
        self.inner.list_resources().await
    }
}

/// Simulated source whose writes take a while, as over a slow bus.
struct Sluggish {
    inner: Arc<SimulatedInstrument>,
    delay: Duration,
}

#[async_trait]
impl InstrumentLink for Sluggish {
    async fn write(&self, command: &str) -> Result<(), LinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.write(command).await
    }

    async fn query(&self, command: &str) -> Result<String, LinkError> {
        self.inner.query(command).await
    }

    async fn list_resources(&self) -> Vec<String> {
        self.inner.list_resources().await
    }
}

fn sluggish(sim: &Arc<SimulatedInstrument>, settings: &Settings) -> Arc<AcquisitionController> {
    let link = Arc::new(Sluggish {
        inner: sim.clone(),
        delay: Duration::from_millis(20),
    });
    Arc::new(AcquisitionController::new(link, settings))
}

/// The final abort comes after every arm and trigger command.
fn assert_abort_is_last_word(log: &[String]) {
    let last_abort = log
        .iter()
        .rposition(|c| c == "SOUR:SWE:ABOR")
        .expect("abort never sent");
    let last_trigger = log
        .iter()
        .rposition(|c| c == "INIT:IMM" || c.ends_with(":ARM"));
    assert!(
        last_trigger.map_or(true, |i| i < last_abort),
        "trigger after abort: {log:?}"
    );
}

fn settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.mode = MeasurementMode::Delta;
    settings.acquisition.poll_interval_ms = 5;
    settings.acquisition.settle_delay_ms = 0;
    settings.storage.output_dir = dir.path().to_path_buf();
    settings.modes.delta = DeltaParams {
        high_ua: 10.0,
        low_ua: -10.0,
        count: 5,
        delay_ms: 1.0,
        rate_plc: 1.0,
        ..DeltaParams::default()
    };
    settings
}

fn controller(
    sim: &Arc<SimulatedInstrument>,
    settings: &Settings,
) -> Arc<AcquisitionController> {
    Arc::new(AcquisitionController::new(sim.clone(), settings))
}

async fn start(controller: &Arc<AcquisitionController>) -> JoinHandle<AppResult<RunOutcome>> {
    match controller.dispatch(UiEvent::Start).await.unwrap() {
        EventOutcome::Started(handle) => handle,
        other => panic!("unexpected outcome {other:?}"),
    }
}

async fn wait_for(controller: &AcquisitionController, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while controller.state().await != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {state}"));
}

fn data_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn delta_run_writes_header_and_records() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new().with_fill_per_poll(2));
    let controller = controller(&sim, &settings(&dir));
    let mut events = controller.subscribe();

    controller
        .dispatch(UiEvent::SelectSink(Some("delta.txt".into())))
        .await
        .unwrap();
    let outcome = start(&controller).await.await.unwrap().unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.point_count, 5);
    assert_eq!(outcome.records.len(), 5);
    assert_eq!(outcome.records[4].reading_number, 4);
    assert_eq!(controller.state().await, SessionState::Idle);

    let path = dir.path().join("delta.txt");
    assert_eq!(outcome.output.as_deref(), Some(path.as_path()));
    let lines = data_lines(&path);
    assert_eq!(lines.len(), 7);
    assert_eq!(lines[0], DELTA_HEADER);
    assert_eq!(lines[1], "");
    assert!(lines[2..].iter().all(|l| l.split('\t').count() == 5));
    assert!(lines[6].ends_with("\t4"));
    assert!(dir.path().join("delta.meta.json").exists());

    let log = sim.call_log();
    let position = |cmd: &str| {
        log.iter()
            .position(|c| c == cmd)
            .unwrap_or_else(|| panic!("{cmd} not sent"))
    };
    assert!(position("TRAC:CLE") < position("TRAC:POIN 5"));
    assert!(position("TRAC:POIN 5") < position("SOUR:DELT:ARM"));
    assert!(position("SOUR:DELT:ARM?") < position("INIT:IMM"));
    assert!(position("INIT:IMM") < position("TRAC:DATA?"));
    assert_eq!(log.last().map(String::as_str), Some("SOUR:SWE:ABOR"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&ControllerEvent::ControlsLocked));
    assert!(seen.contains(&ControllerEvent::ControlsUnlocked));
    assert!(seen.contains(&ControllerEvent::Finished {
        status: RunStatus::Completed,
        records: 5
    }));
}

#[tokio::test]
async fn refused_arm_aborts_without_creating_a_file() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new().refusing_arm());
    let controller = controller(&sim, &settings(&dir));
    controller
        .dispatch(UiEvent::SelectSink(Some("never.txt".into())))
        .await
        .unwrap();

    let err = controller.start().await.unwrap_err();

    assert!(matches!(err, DaqError::ArmFailure(MeasurementMode::Delta)));
    assert_eq!(
        controller.state().await,
        SessionState::Error(FailureKind::ArmFailure)
    );
    assert!(!dir.path().join("never.txt").exists());
    let log = sim.call_log();
    assert!(!log.iter().any(|c| c == "INIT:IMM"));
    assert_eq!(log.last().map(String::as_str), Some("SOUR:SWE:ABOR"));

    // Error is a resting state.
    controller.stop().await.unwrap();
    assert_eq!(controller.state().await, SessionState::Idle);
}

#[tokio::test]
async fn oversized_buffer_fails_preflight_before_any_command() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(&dir);
    settings.modes.delta.count = 65_537;
    let sim = Arc::new(SimulatedInstrument::new());
    let controller = controller(&sim, &settings);
    controller
        .dispatch(UiEvent::SelectSink(Some("big.txt".into())))
        .await
        .unwrap();

    let err = controller.start().await.unwrap_err();

    assert!(matches!(
        err.causes().as_slice(),
        [DaqError::BufferOverflow {
            points: 65_537,
            capacity: 65_536
        }]
    ));
    assert_eq!(
        controller.state().await,
        SessionState::Error(FailureKind::Preflight)
    );
    assert_eq!(sim.call_log(), vec!["SOUR:DCON:NVPR?"]);
}

#[tokio::test]
async fn missing_sink_is_reported_with_other_failures() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new().with_resources(vec![]));
    let controller = controller(&sim, &settings(&dir));

    let err = controller.start().await.unwrap_err();

    assert!(matches!(
        err.causes().as_slice(),
        [DaqError::Connectivity(_), DaqError::NoSinkSelected]
    ));
    assert!(sim.call_log().is_empty());
}

#[tokio::test]
async fn start_and_edits_are_rejected_while_polling_then_stop_keeps_partial_data() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new().stalling_at(2));
    let controller = controller(&sim, &settings(&dir));
    controller
        .dispatch(UiEvent::SelectSink(Some("partial.txt".into())))
        .await
        .unwrap();

    let run = start(&controller).await;
    wait_for(&controller, SessionState::Polling).await;

    assert!(matches!(
        controller.start().await,
        Err(DaqError::SessionBusy(SessionState::Polling))
    ));
    assert!(matches!(
        controller
            .dispatch(UiEvent::SetMode(MeasurementMode::FixedPulseDelta))
            .await,
        Err(DaqError::SessionBusy(_))
    ));

    controller.dispatch(UiEvent::Stop).await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(controller.state().await, SessionState::Idle);
    assert!(!sim.is_running());
    assert_eq!(data_lines(&dir.path().join("partial.txt")).len(), 4);
    assert_eq!(controller.setup().await.mode, MeasurementMode::Delta);
}

#[tokio::test]
async fn exhausted_poll_bound_fetches_what_was_buffered() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(&dir);
    settings.acquisition.poll_interval_ms = 1;
    settings.acquisition.iteration_factor = 1;
    let sim = Arc::new(SimulatedInstrument::new().stalling_at(2));
    let controller = controller(&sim, &settings);
    controller
        .dispatch(UiEvent::SelectSink(Some("slow.txt".into())))
        .await
        .unwrap();

    let err = controller.start().await.unwrap_err();

    assert!(matches!(
        err,
        DaqError::Timeout {
            iterations: 5,
            filled: 2,
            expected: 5
        }
    ));
    assert_eq!(
        controller.state().await,
        SessionState::Error(FailureKind::Timeout)
    );
    let last = controller.last_run().await.unwrap();
    assert_eq!(last.status, RunStatus::TimedOut);
    assert_eq!(last.records.len(), 2);
    assert_eq!(data_lines(&dir.path().join("slow.txt")).len(), 4);
}

#[tokio::test]
async fn fail_policy_skips_the_fetch() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(&dir);
    settings.acquisition.poll_interval_ms = 1;
    settings.acquisition.iteration_factor = 1;
    settings.acquisition.timeout_policy = TimeoutPolicy::Fail;
    let sim = Arc::new(SimulatedInstrument::new().stalling_at(2));
    let controller = controller(&sim, &settings);
    controller
        .dispatch(UiEvent::SelectSink(Some("slow.txt".into())))
        .await
        .unwrap();

    assert!(matches!(
        controller.start().await,
        Err(DaqError::Timeout { .. })
    ));
    assert!(!sim.call_log().iter().any(|c| c == "TRAC:DATA?"));
    assert_eq!(data_lines(&dir.path().join("slow.txt")), vec![DELTA_HEADER, ""]);
}

#[tokio::test]
async fn link_failure_after_sink_opened_aborts_and_closes() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new());
    let link = Arc::new(FailOn {
        inner: sim.clone(),
        command: "INIT:IMM",
    });
    let controller = Arc::new(AcquisitionController::new(link, &settings(&dir)));
    controller
        .dispatch(UiEvent::SelectSink(Some("broken.txt".into())))
        .await
        .unwrap();
    let mut events = controller.subscribe();

    let err = controller.start().await.unwrap_err();

    assert!(matches!(err, DaqError::Link(LinkError::Rejected { .. })));
    assert_eq!(
        controller.state().await,
        SessionState::Error(FailureKind::Link)
    );
    assert_eq!(
        data_lines(&dir.path().join("broken.txt")),
        vec![DELTA_HEADER, ""]
    );
    assert_eq!(sim.call_log().last().map(String::as_str), Some("SOUR:SWE:ABOR"));

    let mut unlocked = false;
    while let Ok(event) = events.try_recv() {
        unlocked |= event == ControllerEvent::ControlsUnlocked;
    }
    assert!(unlocked);
}

#[tokio::test]
async fn custom_sweep_runs_from_built_lists() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new());
    let controller = controller(&sim, &settings(&dir));

    controller
        .dispatch(UiEvent::SetMode(MeasurementMode::SweepPulseDelta))
        .await
        .unwrap();
    let built = controller
        .dispatch(UiEvent::BuildCustomList {
            kind: ListKind::Currents,
            text: "1, 2, 3".into(),
        })
        .await
        .unwrap();
    assert!(matches!(built, EventOutcome::ListBuilt(_)));

    // An empty custom list cannot be selected.
    let mut empty = SweepPulseDeltaParams {
        sweep_type: SweepType::Custom,
        ..SweepPulseDeltaParams::default()
    };
    assert!(matches!(
        controller
            .dispatch(UiEvent::UpdateModeConfig(ModeParameters::SweepPulseDelta(
                empty.clone()
            )))
            .await,
        Err(DaqError::InvalidCount)
    ));
    empty.custom = controller.setup().await.parameters.sweep_pulse_delta.custom;
    controller
        .dispatch(UiEvent::UpdateModeConfig(ModeParameters::SweepPulseDelta(
            empty,
        )))
        .await
        .unwrap();
    controller
        .dispatch(UiEvent::SelectSink(Some("spd.txt".into())))
        .await
        .unwrap();

    let outcome = start(&controller).await.await.unwrap().unwrap();

    assert_eq!(outcome.mode, MeasurementMode::SweepPulseDelta);
    assert_eq!(outcome.records.len(), 3);
    let log = sim.call_log();
    assert!(log.iter().any(|c| c.starts_with("SOUR:LIST:CURR")));
    assert!(log.iter().any(|c| c == "TRAC:POIN 3"));
    assert!(log.iter().any(|c| c == "SOUR:PDEL:ARM"));
    assert!(data_lines(&dir.path().join("spd.txt"))[0].starts_with("Sweep Pulse Delta Reading (V)"));
}

#[tokio::test]
async fn stop_right_after_start_is_not_lost() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new());
    let controller = controller(&sim, &settings(&dir));
    controller
        .dispatch(UiEvent::SelectSink(Some("early.txt".into())))
        .await
        .unwrap();

    let run = start(&controller).await;
    assert!(matches!(
        controller.dispatch(UiEvent::Start).await,
        Err(DaqError::SessionBusy(SessionState::Validating))
    ));
    controller.dispatch(UiEvent::Stop).await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert!(outcome.records.is_empty());
    assert_eq!(controller.state().await, SessionState::Idle);
    assert!(!sim.call_log().iter().any(|c| c == "INIT:IMM"));
    assert!(!dir.path().join("early.txt").exists());
}

#[tokio::test]
async fn stop_while_configuring_sends_nothing_after_the_final_abort() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new());
    let controller = sluggish(&sim, &settings(&dir));
    controller
        .dispatch(UiEvent::SelectSink(Some("configuring.txt".into())))
        .await
        .unwrap();

    let run = start(&controller).await;
    wait_for(&controller, SessionState::Configuring).await;
    controller.dispatch(UiEvent::Stop).await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(controller.state().await, SessionState::Idle);
    assert!(!sim.is_running());
    let log = sim.call_log();
    assert!(!log.iter().any(|c| c == "INIT:IMM"));
    assert_eq!(log.last().map(String::as_str), Some("SOUR:SWE:ABOR"));
    assert_abort_is_last_word(&log);
    assert!(!dir.path().join("configuring.txt").exists());
}

#[tokio::test]
async fn stop_while_triggering_leaves_the_source_idle() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedInstrument::new().stalling_at(2));
    let controller = sluggish(&sim, &settings(&dir));
    controller
        .dispatch(UiEvent::SelectSink(Some("running.txt".into())))
        .await
        .unwrap();

    let run = start(&controller).await;
    wait_for(&controller, SessionState::Running).await;
    controller.dispatch(UiEvent::Stop).await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(controller.state().await, SessionState::Idle);
    assert!(!sim.is_running());
    assert_abort_is_last_word(&sim.call_log());
    assert_eq!(
        data_lines(&dir.path().join("running.txt"))[0],
        DELTA_HEADER
    );
}
