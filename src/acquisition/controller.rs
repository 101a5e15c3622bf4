//! AcquisitionController - arm, run, poll and collect one measurement.
//!
//! The controller owns the instrument link and the editable measurement setup.
//! A run goes through [`SessionState`]s in a fixed order; cancellation is only
//! observed at the boundaries between steps and while waiting, never in the
//! middle of a device command.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = Arc::new(AcquisitionController::new(link, &settings));
//! let mut events = controller.subscribe();
//!
//! controller.dispatch(UiEvent::SetMode(MeasurementMode::Delta)).await?;
//! controller.dispatch(UiEvent::SelectSink(Some("delta.txt".into()))).await?;
//! let EventOutcome::Started(run) = controller.dispatch(UiEvent::Start).await? else {
//!     unreachable!()
//! };
//! let outcome = run.await??;
//! println!("{} records", outcome.records.len());
//! ```

use crate::acquisition::events::{ControllerEvent, EventOutcome, UiEvent};
use crate::acquisition::preflight::PreflightValidator;
use crate::acquisition::session::{
    AcquisitionSession, FailureKind, RunStatus, SessionState, StopFlag,
};
use crate::config::{AcquisitionConfig, Settings, StorageConfig, TimeoutPolicy};
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentLink;
use crate::measurement::command::{parse_armed, parse_fill, Command, CommandBuilder, Query};
use crate::measurement::custom_list::{BuiltList, CustomListBuilder, ListKind};
use crate::measurement::filter::FilterConfig;
use crate::measurement::mode::{MeasurementMode, ModeConfig, ModeParameters, ModeParameterSet, SourceSettings};
use crate::measurement::parser::{header_line, parse_buffer, ParsedBuffer, Record};
use crate::storage::{write_metadata, FileSinkFactory, RecordSink, RunMetadata, SinkFactory};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Parameters the operator edits between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSetup {
    pub mode: MeasurementMode,
    pub parameters: ModeParameterSet,
    pub source: SourceSettings,
    pub sink_path: Option<PathBuf>,
    /// Compliance list follows the compliance setting.
    pub auto_compliances: bool,
    /// Cycle-interval list follows the cycle-interval setting.
    pub auto_cycle_intervals: bool,
}

impl MeasurementSetup {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mode: settings.acquisition.mode,
            parameters: settings.modes.clone(),
            source: settings.source.clone(),
            sink_path: None,
            auto_compliances: true,
            auto_cycle_intervals: true,
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub mode: MeasurementMode,
    pub status: RunStatus,
    pub point_count: u32,
    pub records: Vec<Record>,
    pub polls: u64,
    pub output: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
}

/// Per-run state owned by the run task.
struct RunContext {
    run_id: Uuid,
    parameters: ModeParameters,
    source: SourceSettings,
    sink_path: Option<PathBuf>,
    resource: String,
    started_at: chrono::DateTime<Utc>,
    filter: FilterConfig,
    summary: String,
    points: u32,
    polls: u64,
    device_touched: bool,
    controls_locked: bool,
    sink: Option<Box<dyn RecordSink>>,
    records: Vec<Record>,
}

impl RunContext {
    fn mode(&self) -> MeasurementMode {
        self.parameters.mode()
    }
}

/// Drives the measurement state machine against an [`InstrumentLink`].
pub struct AcquisitionController {
    link: Arc<dyn InstrumentLink>,
    acquisition: AcquisitionConfig,
    storage: StorageConfig,
    preflight: PreflightValidator,
    lists: CustomListBuilder,
    sinks: Arc<dyn SinkFactory>,
    setup: RwLock<MeasurementSetup>,
    session: RwLock<AcquisitionSession>,
    stop: StopFlag,
    wake: Notify,
    events: broadcast::Sender<ControllerEvent>,
    last_run: RwLock<Option<RunOutcome>>,
}

impl AcquisitionController {
    pub fn new(link: Arc<dyn InstrumentLink>, settings: &Settings) -> Self {
        Self::with_sink_factory(link, settings, Arc::new(FileSinkFactory))
    }

    pub fn with_sink_factory(
        link: Arc<dyn InstrumentLink>,
        settings: &Settings,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let setup = MeasurementSetup::from_settings(settings);
        Self {
            link,
            acquisition: settings.acquisition.clone(),
            storage: settings.storage.clone(),
            preflight: PreflightValidator::new(
                settings.instrument.resource.clone(),
                settings.storage.require_sink,
            ),
            lists: CustomListBuilder::new(settings.acquisition.list_length_policy),
            sinks,
            session: RwLock::new(AcquisitionSession::new(setup.mode)),
            setup: RwLock::new(setup),
            stop: StopFlag::new(),
            wake: Notify::new(),
            events,
            last_run: RwLock::new(None),
        }
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.session.read().await.state
    }

    pub async fn session(&self) -> AcquisitionSession {
        self.session.read().await.clone()
    }

    pub async fn setup(&self) -> MeasurementSetup {
        self.setup.read().await.clone()
    }

    /// Outcome of the most recent run, including failed and stopped runs.
    pub async fn last_run(&self) -> Option<RunOutcome> {
        self.last_run.read().await.clone()
    }

    fn emit(&self, event: ControllerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Device I/O
    // =========================================================================

    async fn send(&self, command: &Command) -> AppResult<()> {
        let wire = command.to_wire();
        debug!(command = %wire, "send");
        self.link.write(&wire).await?;
        Ok(())
    }

    async fn ask(&self, query: Query) -> AppResult<String> {
        let wire = query.to_wire();
        let response = self.link.query(&wire).await?;
        debug!(query = %wire, response = response.trim_end(), "ask");
        Ok(response)
    }

    /// Optionally reset the source, then return its identification string.
    pub async fn initialize_instrument(&self, reset: bool) -> AppResult<String> {
        let state = self.state().await;
        if state.is_active() {
            return Err(DaqError::SessionBusy(state));
        }
        if reset {
            self.send(&Command::Reset).await?;
        }
        let idn = self.ask(Query::Identify).await?;
        info!(identity = idn.trim(), "Instrument ready");
        Ok(idn.trim().to_string())
    }

    // =========================================================================
    // Front-end events
    // =========================================================================

    /// Apply a front-end event.
    ///
    /// Edits are rejected with `SessionBusy` while a run is active.
    pub async fn dispatch(self: &Arc<Self>, event: UiEvent) -> AppResult<EventOutcome> {
        match event {
            UiEvent::Start => Ok(EventOutcome::Started(self.spawn_run().await?)),
            UiEvent::Stop => {
                self.stop().await?;
                Ok(EventOutcome::Applied)
            }
            UiEvent::SetMode(mode) => {
                self.ensure_editable().await?;
                self.setup.write().await.mode = mode;
                self.session.write().await.mode = mode;
                debug!(%mode, "Mode selected");
                Ok(EventOutcome::Applied)
            }
            UiEvent::UpdateModeConfig(parameters) => {
                self.ensure_editable().await?;
                ModeConfig::from_parameters(&parameters)?;
                self.setup.write().await.parameters.set(parameters);
                Ok(EventOutcome::Applied)
            }
            UiEvent::UpdateSource(source) => {
                self.ensure_editable().await?;
                self.setup.write().await.source = source;
                Ok(EventOutcome::Applied)
            }
            UiEvent::SetFilter {
                enabled,
                window,
                count,
            } => {
                self.ensure_editable().await?;
                let mut setup = self.setup.write().await;
                let mode = setup.mode;
                let filter = setup.parameters.filter_mut(mode);
                filter.enabled = enabled;
                filter.window = window;
                filter.count = count;
                Ok(EventOutcome::Applied)
            }
            UiEvent::SelectSink(path) => {
                self.ensure_editable().await?;
                let resolved = path.map(|p| self.storage.resolve(&p));
                info!(path = ?resolved, "Output file selected");
                self.setup.write().await.sink_path = resolved;
                Ok(EventOutcome::Applied)
            }
            UiEvent::BuildCustomList { kind, text } => {
                self.ensure_editable().await?;
                Ok(EventOutcome::ListBuilt(self.build_custom_list(kind, &text).await?))
            }
        }
    }

    async fn ensure_editable(&self) -> AppResult<()> {
        let state = self.state().await;
        if state.is_active() {
            Err(DaqError::SessionBusy(state))
        } else {
            Ok(())
        }
    }

    /// Build a custom sweep list and store it in the sweep pulse delta setup.
    ///
    /// Rebuilding the currents re-checks any explicitly entered compliance or
    /// cycle-interval list against the new length. Under the strict policy a
    /// mismatch rejects the rebuild and leaves the stored lists untouched.
    pub async fn build_custom_list(&self, kind: ListKind, text: &str) -> AppResult<BuiltList> {
        let mut setup = self.setup.write().await;
        let compliance = setup.source.compliance_v;
        let cycle_plc = setup.parameters.sweep_pulse_delta.cycle_plc;

        let built = match kind {
            ListKind::Currents => {
                let list = self.lists.build_currents(text)?;
                let n = list.values.len();
                let auto_compliances = setup.auto_compliances;
                let auto_cycles = setup.auto_cycle_intervals;
                let custom = &mut setup.parameters.sweep_pulse_delta.custom;
                let explicit = [
                    (ListKind::Compliances, !auto_compliances, custom.compliances.len()),
                    (ListKind::CycleIntervals, !auto_cycles, custom.cycle_intervals_plc.len()),
                ];
                let mut mismatches = Vec::new();
                for (dependent, kept, len) in explicit {
                    if !kept {
                        continue;
                    }
                    if let Some(mismatch) = self.lists.check_length(dependent, len, n)? {
                        mismatches.push((dependent, mismatch));
                    }
                }
                for (dependent, mismatch) in mismatches {
                    self.emit(ControllerEvent::ListWarning {
                        kind: dependent,
                        expected: mismatch.expected,
                        actual: mismatch.actual,
                    });
                }
                custom.currents = list.values.clone();
                if auto_compliances {
                    custom.compliances = vec![compliance; n];
                }
                if auto_cycles {
                    custom.cycle_intervals_plc = vec![cycle_plc; n];
                }
                BuiltList::Currents(list)
            }
            ListKind::Compliances | ListKind::CycleIntervals => {
                let reference = setup.parameters.sweep_pulse_delta.custom.currents.len();
                let scalar = if kind == ListKind::Compliances {
                    compliance
                } else {
                    cycle_plc
                };
                let list = self.lists.build_dependent(kind, text, scalar, reference)?;
                if let Some(mismatch) = list.mismatch {
                    self.emit(ControllerEvent::ListWarning {
                        kind,
                        expected: mismatch.expected,
                        actual: mismatch.actual,
                    });
                }
                let custom = &mut setup.parameters.sweep_pulse_delta.custom;
                if kind == ListKind::Compliances {
                    custom.compliances = list.values.clone();
                    setup.auto_compliances = list.auto_copied;
                } else {
                    custom.cycle_intervals_plc = list.values.clone();
                    setup.auto_cycle_intervals = list.auto_copied;
                }
                BuiltList::Dependent(list)
            }
        };
        debug!(list = %kind, "Custom list built");
        Ok(built)
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    /// Start a run on a background task.
    ///
    /// Rejects immediately with `SessionBusy` if a run is active.
    /// The session has left `Idle` when this returns, so a following `Stop`
    /// or `Start` sees the new run.
    pub async fn spawn_run(self: &Arc<Self>) -> AppResult<JoinHandle<AppResult<RunOutcome>>> {
        let (run_id, setup) = self.begin_run().await?;
        let controller = Arc::clone(self);
        Ok(tokio::spawn(async move { controller.execute(run_id, setup).await }))
    }

    /// Request cancellation.
    ///
    /// A no-op while `Idle`. Otherwise the abort command is sent immediately and
    /// the run task finalizes (partial data, sink close, `Idle`) at its next
    /// suspension point. The run task sends no further configuration or
    /// trigger commands once the flag is set and closes with its own abort.
    pub async fn stop(&self) -> AppResult<()> {
        {
            let mut session = self.session.write().await;
            let from = session.state;
            match from {
                SessionState::Idle | SessionState::Stopping => return Ok(()),
                SessionState::Error(_) => {
                    session.state = SessionState::Idle;
                }
                _ => {
                    self.stop.trigger();
                    session.state = SessionState::Stopping;
                }
            }
            info!(%from, "Stop requested");
            self.emit(ControllerEvent::StateChanged {
                from,
                to: session.state,
            });
        }
        self.wake.notify_one();
        self.send(&Command::AbortSweep).await
    }

    /// Move to `to` unless a stop was requested.
    async fn advance(&self, to: SessionState) -> bool {
        let mut session = self.session.write().await;
        if self.stop.is_triggered() {
            return false;
        }
        let from = session.state;
        session.state = to;
        debug!(%from, %to, "Session transition");
        self.emit(ControllerEvent::StateChanged { from, to });
        true
    }

    /// Sleep for `duration`, waking early on stop. Returns `false` if stopped.
    async fn pause(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.stop.is_triggered() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return !self.stop.is_triggered(),
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Run one measurement to completion.
    ///
    /// # Errors
    /// - `SessionBusy` if a run is already active (the active run is untouched)
    /// - `Preflight` if any check failed; no device command was sent
    /// - `ArmFailure`, `Timeout`, `MalformedBuffer`, link and storage errors;
    ///   the device was sent an abort and the sink closed
    pub async fn start(&self) -> AppResult<RunOutcome> {
        let (run_id, setup) = self.begin_run().await?;
        self.execute(run_id, setup).await
    }

    /// Claim the session for a new run: `Idle`/`Error` to `Validating`.
    async fn begin_run(&self) -> AppResult<(Uuid, MeasurementSetup)> {
        let setup = self.setup.read().await.clone();
        let mut session = self.session.write().await;
        if session.state.is_active() {
            warn!(state = %session.state, "Start rejected");
            return Err(DaqError::SessionBusy(session.state));
        }
        self.stop.reset();
        let from = session.state;
        let run_id = session.begin(setup.mode);
        self.emit(ControllerEvent::StateChanged {
            from,
            to: SessionState::Validating,
        });
        Ok((run_id, setup))
    }

    #[instrument(skip(self, setup), fields(mode = %setup.mode))]
    async fn execute(&self, run_id: Uuid, setup: MeasurementSetup) -> AppResult<RunOutcome> {
        let parameters = setup.parameters.get(setup.mode);
        let mut ctx = RunContext {
            run_id,
            filter: parameters.filter_config(),
            parameters,
            source: setup.source.clone(),
            sink_path: setup.sink_path.clone(),
            resource: String::new(),
            started_at: Utc::now(),
            points: 0,
            polls: 0,
            summary: String::new(),
            device_touched: false,
            controls_locked: false,
            sink: None,
            records: Vec::new(),
        };
        if self.stop.is_triggered() {
            return self.finish_stopped(ctx).await;
        }

        // Validating
        let (config, points) = match ModeConfig::from_parameters(&ctx.parameters) {
            Ok(config) => {
                let points = config.point_count();
                (Some(config), Ok(points))
            }
            Err(e) => (None, Err(e)),
        };
        let report = self
            .preflight
            .run(self.link.as_ref(), ctx.sink_path.is_some(), points)
            .await;
        let (report, config) = match (report, config) {
            (Ok(report), Some(config)) => (report, config),
            (Err(e), _) => return self.fail(ctx, e).await,
            (Ok(_), None) => {
                return self
                    .fail(ctx, DaqError::InvalidSweep("no configuration planned".into()))
                    .await
            }
        };
        ctx.resource = report.resource;
        ctx.points = report.points;
        ctx.summary = config.summary(&ctx.source);
        info!(points = ctx.points, resource = %ctx.resource, "Preflight passed");

        // Configuring
        if !self.advance(SessionState::Configuring).await {
            return self.finish_stopped(ctx).await;
        }
        let plan = CommandBuilder::build(&config, &ctx.source);
        self.session.write().await.plan(config);
        ctx.device_touched = true;
        match self.configure(&plan.configure).await {
            Ok(true) => {}
            Ok(false) => return self.finish_stopped(ctx).await,
            Err(e) => return self.fail(ctx, e).await,
        }
        if self.stop.is_triggered() {
            return self.finish_stopped(ctx).await;
        }
        let armed = match self.arm(&plan.arm, plan.confirm).await {
            Ok(armed) => armed,
            Err(e) => return self.fail(ctx, e).await,
        };
        if !armed {
            let mode = ctx.mode();
            return self.fail(ctx, DaqError::ArmFailure(mode)).await;
        }
        self.session.write().await.armed = true;
        if !self.advance(SessionState::Armed).await {
            return self.finish_stopped(ctx).await;
        }

        // Running
        if !self.advance(SessionState::Running).await {
            return self.finish_stopped(ctx).await;
        }
        ctx.controls_locked = true;
        self.emit(ControllerEvent::ControlsLocked);
        if let Err(e) = self.open_sink(&mut ctx).await {
            return self.fail(ctx, e).await;
        }
        for command in [Command::FormatElements, Command::Initiate] {
            if self.stop.is_triggered() {
                return self.finish_stopped(ctx).await;
            }
            if let Err(e) = self.send(&command).await {
                return self.fail(ctx, e).await;
            }
        }
        ctx.started_at = Utc::now();
        self.session.write().await.started_at = Some(ctx.started_at);
        info!(points = ctx.points, "Measurement initiated");
        if !self.pause(self.acquisition.settle_delay()).await {
            return self.finish_stopped(ctx).await;
        }

        // Polling
        if !self.advance(SessionState::Polling).await {
            return self.finish_stopped(ctx).await;
        }
        let bound = self
            .acquisition
            .iteration_factor
            .saturating_mul(u64::from(ctx.points));
        let filled = loop {
            let filled = match self.poll_fill(&mut ctx).await {
                Ok(filled) => filled,
                Err(e) => return self.fail(ctx, e).await,
            };
            if filled >= ctx.points {
                break filled;
            }
            if ctx.polls >= bound {
                return self.timed_out(ctx, filled).await;
            }
            if !self.pause(self.acquisition.poll_interval()).await {
                return self.finish_stopped(ctx).await;
            }
        };
        debug!(filled, polls = ctx.polls, "Buffer full");

        // Completing
        if !self.advance(SessionState::Completing).await {
            return self.finish_stopped(ctx).await;
        }
        let parsed = match self.fetch().await {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(ctx, e).await,
        };
        if let Err(e) = self.persist(&mut ctx, parsed).await {
            return self.fail(ctx, e).await;
        }
        if let Err(e) = self.send(&Command::AbortSweep).await {
            warn!(error = %e, "Post-run abort failed");
        }
        self.finish(ctx, RunStatus::Completed, SessionState::Idle).await
    }

    /// Clear the buffer and send the mode's configuration.
    /// Returns `false` if a stop arrived part way through.
    async fn configure(&self, commands: &[Command]) -> AppResult<bool> {
        self.send(&Command::ClearBuffer).await?;
        let cleared = parse_fill(&self.ask(Query::BufferFill).await?)?;
        self.session.write().await.buffer_count = cleared;
        for command in commands {
            if self.stop.is_triggered() {
                return Ok(false);
            }
            self.send(command).await?;
        }
        Ok(true)
    }

    async fn arm(&self, arm: &Command, confirm: Query) -> AppResult<bool> {
        self.send(arm).await?;
        let response = self.ask(confirm).await?;
        let armed = parse_armed(&response);
        debug!(armed, response = response.trim(), "Arm state");
        Ok(armed)
    }

    async fn open_sink(&self, ctx: &mut RunContext) -> AppResult<()> {
        if let Some(path) = ctx.sink_path.clone() {
            let mut sink = self.sinks.open(&path).await?;
            sink.write_header(&header_line(ctx.mode(), ctx.source.units))
                .await?;
            ctx.sink = Some(sink);
        }
        Ok(())
    }

    async fn poll_fill(&self, ctx: &mut RunContext) -> AppResult<u32> {
        let filled = parse_fill(&self.ask(Query::BufferFill).await?)?;
        ctx.polls += 1;
        {
            let mut session = self.session.write().await;
            session.buffer_count = filled;
            session.polls = ctx.polls;
        }
        self.emit(ControllerEvent::Progress {
            filled,
            expected: ctx.points,
            polls: ctx.polls,
        });
        Ok(filled)
    }

    async fn fetch(&self) -> AppResult<ParsedBuffer> {
        let raw = self.ask(Query::BufferData).await?;
        parse_buffer(&raw)
    }

    /// Write parsed records to the open sink and keep them for the outcome.
    async fn persist(&self, ctx: &mut RunContext, parsed: ParsedBuffer) -> AppResult<()> {
        if let Some(sink) = ctx.sink.as_mut() {
            for line in parsed.lines() {
                sink.write_line(&line).await?;
            }
        }
        ctx.records = parsed.into_records();
        Ok(())
    }

    /// Best-effort collection of whatever the device buffered.
    async fn salvage(&self, ctx: &mut RunContext) {
        let filled = match self.ask(Query::BufferFill).await.and_then(|r| parse_fill(&r)) {
            Ok(filled) => filled,
            Err(e) => {
                warn!(error = %e, "Could not read buffer fill for partial data");
                return;
            }
        };
        if filled == 0 {
            return;
        }
        match self.fetch().await {
            Ok(parsed) => {
                if let Err(e) = self.persist(ctx, parsed).await {
                    warn!(error = %e, "Could not write partial data");
                }
            }
            Err(e) => warn!(error = %e, "Could not fetch partial data"),
        }
    }

    async fn timed_out(&self, mut ctx: RunContext, filled: u32) -> AppResult<RunOutcome> {
        let err = DaqError::Timeout {
            iterations: ctx.polls,
            filled,
            expected: ctx.points,
        };
        warn!(%err, "Poll bound exhausted");
        if self.acquisition.timeout_policy == TimeoutPolicy::BestEffortFetch && filled > 0 {
            self.salvage(&mut ctx).await;
        }
        self.fail(ctx, err).await
    }

    /// Finalize a run whose stop was requested.
    ///
    /// A touched device gets a closing abort after the last command this task
    /// sent; the one from `stop()` may have gone out before it.
    async fn finish_stopped(&self, mut ctx: RunContext) -> AppResult<RunOutcome> {
        info!("Run stopped");
        if ctx.device_touched {
            if let Err(e) = self.send(&Command::AbortSweep).await {
                warn!(error = %e, "Abort after stop failed");
            }
        }
        if ctx.sink.is_some() {
            self.salvage(&mut ctx).await;
        }
        self.finish(ctx, RunStatus::Stopped, SessionState::Idle).await
    }

    /// Abort, close and record a failed run.
    async fn fail(&self, ctx: RunContext, err: DaqError) -> AppResult<RunOutcome> {
        error!(error = %err, "Run failed");
        if ctx.device_touched {
            if let Err(e) = self.send(&Command::AbortSweep).await {
                warn!(error = %e, "Abort after failure failed");
            }
        }
        let status = if matches!(err, DaqError::Timeout { .. }) {
            RunStatus::TimedOut
        } else {
            RunStatus::Failed
        };
        let to = if self.stop.is_triggered() {
            SessionState::Idle
        } else {
            SessionState::Error(FailureKind::of(&err))
        };
        self.session.write().await.last_error = Some(err.to_string());
        self.emit(ControllerEvent::Failed {
            message: err.to_string(),
        });
        self.finish(ctx, status, to).await?;
        Err(err)
    }

    /// Close the sink, write metadata, unlock controls and settle the state.
    async fn finish(
        &self,
        mut ctx: RunContext,
        status: RunStatus,
        to: SessionState,
    ) -> AppResult<RunOutcome> {
        let mut metadata_path = None;
        let mut output = None;
        if let Some(mut sink) = ctx.sink.take() {
            if let Err(e) = sink.close().await {
                warn!(error = %e, "Closing data file failed");
            }
            output = ctx.sink_path.clone();
            if self.storage.write_metadata {
                if let Some(path) = ctx.sink_path.as_deref() {
                    let mut metadata = RunMetadata::new(
                        ctx.run_id,
                        &ctx.resource,
                        ctx.started_at,
                        ctx.points,
                        ctx.parameters.clone(),
                        ctx.source.clone(),
                        ctx.filter,
                    )
                    .with_summary(ctx.summary.clone());
                    metadata.finish(status, ctx.records.len());
                    match write_metadata(path, &metadata).await {
                        Ok(path) => metadata_path = Some(path),
                        Err(e) => warn!(error = %e, "Writing run metadata failed"),
                    }
                }
            }
        }

        if ctx.controls_locked {
            self.emit(ControllerEvent::ControlsUnlocked);
        }
        {
            let mut session = self.session.write().await;
            let from = session.state;
            session.state = to;
            session.armed = false;
            self.emit(ControllerEvent::StateChanged { from, to });
        }
        self.emit(ControllerEvent::Finished {
            status,
            records: ctx.records.len(),
        });

        let outcome = RunOutcome {
            run_id: ctx.run_id,
            mode: ctx.mode(),
            status,
            point_count: ctx.points,
            records: ctx.records,
            polls: ctx.polls,
            output,
            metadata: metadata_path,
        };
        info!(status = ?status, records = outcome.records.len(), "Run finished");
        *self.last_run.write().await = Some(outcome.clone());
        Ok(outcome)
    }
}
