//! Test sequencer: the run lifecycle state machine.
//!
//! The sequencer is single-threaded and never sleeps. Every continuation
//! (settle delay, countdown tick, ramp or short cycle) is an entry in its
//! [`Scheduler`], tagged with the run generation that created it; the owner
//! feeds time in through [`Sequencer::run_due`]. Cancelling bumps the
//! generation, so whatever was still queued for the old run is dropped.

pub mod result;
pub mod steps;

use anyhow::{bail, Context, Result};
use chrono::Local;
use flume::Sender;
use std::{path::PathBuf, time::Duration};
use strum::{AsRefStr, Display};

use self::{
    result::StepResult,
    steps::{
        display_bounds, resolve_bindings, CurrentLimitRun, DirectCurrentRun, ShortRun,
        StepContext, StepProgress, StepRun,
    },
};
use super::{
    bus::CoreToUi,
    definition::{ChannelId, Step, StepId, StepType, TestDefinition},
    delay::{DelayTick, DelayTimer, TickToken, DELAY_TICK},
    report::{render_report, save_report, ReportHeader},
    scheduler::Scheduler,
    serial_number::SerialNumber,
    telemetry::{Reading, TelemetryChannel},
};
use crate::protocol::gateway::{GatewayKind, InstrumentGateway, RelayGateway};

/// Hardware settle time before each step and before the final verdict.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Publish a sequencer event. A missing frontend is not an error.
pub(crate) fn notify(events: &Sender<CoreToUi>, event: CoreToUi) {
    if events.send(event).is_err() {
        log::debug!("No frontend listening for sequencer events");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TestState {
    None,
    Running,
    Paused,
    Canceled,
    Passed,
    Failed,
    WaitKey,
}

impl TestState {
    /// States from which a new run may be started.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            TestState::None | TestState::Passed | TestState::Failed | TestState::Canceled
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TestState::Passed | TestState::Failed | TestState::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Settle,
    Delay(TickToken),
    StepTick,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    generation: u64,
    wake: Wake,
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub settle: Duration,
    /// Where passed full runs are persisted. `None` keeps reports in memory only.
    pub reports_dir: Option<PathBuf>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            settle: SETTLE_DELAY,
            reports_dir: None,
        }
    }
}

pub struct Sequencer {
    definition: TestDefinition,
    instrument: Box<dyn InstrumentGateway>,
    relay: Box<dyn RelayGateway>,
    events: Sender<CoreToUi>,
    config: SequencerConfig,

    scheduler: Scheduler<Timer>,
    generation: u64,
    delay: DelayTimer,
    channels: Vec<TelemetryChannel>,

    state: TestState,
    step_index: usize,
    single_step: Option<usize>,
    active: Option<StepRun>,
    step_passes: Vec<bool>,
    results: Vec<StepResult>,
    last_report: Option<String>,

    serial_number: Option<SerialNumber>,
    tester_id: String,
    increment_serial: bool,
}

impl Sequencer {
    pub fn new(
        definition: TestDefinition,
        instrument: Box<dyn InstrumentGateway>,
        relay: Box<dyn RelayGateway>,
        events: Sender<CoreToUi>,
        config: SequencerConfig,
    ) -> Self {
        let channels = definition
            .channel_ids()
            .into_iter()
            .map(TelemetryChannel::new)
            .collect();
        Self {
            definition,
            instrument,
            relay,
            events,
            config,
            scheduler: Scheduler::new(),
            generation: 0,
            delay: DelayTimer::new(),
            channels,
            state: TestState::None,
            step_index: 0,
            single_step: None,
            active: None,
            step_passes: Vec::new(),
            results: Vec::new(),
            last_report: None,
            serial_number: None,
            tester_id: String::new(),
            increment_serial: false,
        }
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn definition(&self) -> &TestDefinition {
        &self.definition
    }

    /// Results recorded by the current (or last) run, in execution order.
    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn last_report(&self) -> Option<&str> {
        self.last_report.as_deref()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn delay_remaining_ms(&self) -> u64 {
        self.delay.remaining_ms()
    }

    pub fn serial_number(&self) -> Option<SerialNumber> {
        self.serial_number
    }

    /// Operator-entered serial number. Cancels any pending auto-increment.
    pub fn set_serial_number(&mut self, serial_number: Option<SerialNumber>) {
        self.serial_number = serial_number;
        self.increment_serial = false;
    }

    pub fn tester_id(&self) -> &str {
        &self.tester_id
    }

    pub fn set_tester_id(&mut self, tester_id: impl Into<String>) {
        self.tester_id = tester_id.into();
    }

    pub fn reading(&self, channel: ChannelId) -> Option<Reading> {
        self.channels
            .iter()
            .find(|c| c.channel_id() == channel)
            .map(TelemetryChannel::read)
    }

    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.scheduler.next_deadline()
    }

    /// Fire every continuation due at or before `now`, in deadline order.
    ///
    /// Work scheduled by a fired continuation is relative to that
    /// continuation's deadline. Only suitable for virtual time, where
    /// handlers take no time at all.
    pub fn run_due(&mut self, now: Duration) {
        while let Some(timer) = self.scheduler.pop_due(now) {
            self.fire(timer);
        }
        self.scheduler.advance_clock(now);
    }

    /// Fire every continuation that was due when the call began, reading
    /// `clock` again before each one so follow-up work is scheduled from the
    /// real time the handler ran at. Hardware round-trips inside a handler
    /// therefore delay later deadlines instead of eating into them.
    ///
    /// Continuations that fall due while this runs wait for the next call,
    /// so the owner gets to handle commands in between.
    pub fn run_due_with(&mut self, mut clock: impl FnMut() -> Duration) {
        let until = clock();
        while let Some(timer) = self.scheduler.pop_due(until) {
            self.scheduler.advance_clock(clock());
            self.fire(timer);
        }
        self.scheduler.advance_clock(clock());
    }

    fn fire(&mut self, timer: Timer) {
        if timer.generation != self.generation {
            log::debug!("Dropping {:?} from retired run {}", timer.wake, timer.generation);
            return;
        }
        match timer.wake {
            Wake::Settle => self.run_steps(),
            Wake::Delay(token) => self.on_delay_tick(token),
            Wake::StepTick => self.on_step_tick(),
        }
    }

    /// Move virtual time forward by `elapsed`, firing what falls due.
    pub fn advance_by(&mut self, elapsed: Duration) {
        let target = self.scheduler.now() + elapsed;
        self.run_due(target);
    }

    pub fn start_test_sequence(&mut self) -> Result<()> {
        if !self.state.can_start() {
            bail!("Cannot start a test while the sequence is {}", self.state);
        }
        self.ensure_ready()?;

        let advance = self.serial_number.is_none()
            || (self.increment_serial && self.state == TestState::Passed);
        if advance {
            let next = SerialNumber::advance(self.serial_number);
            log::info!("Serial number advanced to {next}");
            self.serial_number = Some(next);
            self.emit(CoreToUi::SerialNumberUpdated(next));
        }
        self.increment_serial = false;

        self.generation += 1;
        self.scheduler.clear();
        self.delay.reset();
        self.active = None;
        self.step_index = 0;
        self.step_passes.clear();
        self.results.clear();
        self.last_report = None;

        let ids = self.definition.channel_ids();
        self.instrument.toggle_inputs(&ids, true);
        log::info!(
            "Starting {} of {} for unit {}",
            match self.single_step {
                Some(_) => "single step",
                None => "test sequence",
            },
            self.definition.model,
            self.serial_label()
        );
        self.set_state(TestState::Running);
        self.schedule(self.config.settle, Wake::Settle);
        Ok(())
    }

    /// Run exactly one step, without advancing the serial number afterwards.
    pub fn setup_single_run(&mut self, step_id: StepId) -> Result<()> {
        if !self.state.can_start() {
            bail!("Cannot start a test while the sequence is {}", self.state);
        }
        let index = self
            .definition
            .step_index(step_id)
            .with_context(|| format!("Step {step_id} is not part of the test definition"))?;
        self.single_step = Some(index);
        self.increment_serial = false;
        let started = self.start_test_sequence();
        if started.is_err() {
            self.single_step = None;
        }
        started
    }

    /// Pause a running countdown, or resume a paused one. Ramp and short
    /// cycles keep running; only the countdown and the step loop wait.
    pub fn toggle_test_pause_state(&mut self) -> bool {
        match self.state {
            TestState::Running => {
                self.delay.pause();
                self.set_state(TestState::Paused);
                true
            }
            TestState::Paused => {
                if let Some(token) = self.delay.resume() {
                    self.schedule(Duration::ZERO, Wake::Delay(token));
                }
                self.set_state(TestState::Running);
                true
            }
            _ => false,
        }
    }

    /// Acknowledge a zero-duration step and validate it.
    pub fn continue_sequence(&mut self) -> bool {
        if self.state != TestState::WaitKey {
            return false;
        }
        self.set_state(TestState::Running);
        self.complete_direct_current();
        true
    }

    pub fn cancel_test_sequence(&mut self) -> bool {
        if !matches!(
            self.state,
            TestState::None | TestState::Running | TestState::Paused | TestState::WaitKey
        ) {
            return false;
        }
        log::info!("Test sequence canceled at step {}", self.step_index);
        self.set_state(TestState::Canceled);
        self.generation += 1;
        self.scheduler.clear();
        self.reset_setup();
        true
    }

    /// Read every channel's live voltage and publish the readings.
    pub fn refresh_telemetry(&mut self) {
        for channel in &mut self.channels {
            let Some(voltage) = self.instrument.read_voltage(channel.channel_id()) else {
                continue;
            };
            let reading = channel.set(Some(voltage), None);
            notify(
                &self.events,
                CoreToUi::Telemetry {
                    channel_id: channel.channel_id(),
                    reading,
                },
            );
        }
    }

    /// Return the rig to a safe idle configuration.
    pub fn reset_setup(&mut self) {
        self.instrument.reset();
        let ids = self.definition.channel_ids();
        self.instrument.toggle_inputs(&ids, false);
        self.relay.release_route();
        self.delay.reset();
        self.active = None;
        self.single_step = None;
        self.step_passes.clear();
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.instrument.is_connected() {
            bail!("Cannot start: {} is not connected", GatewayKind::Instrument);
        }
        if !self.relay.is_connected() {
            bail!("Cannot start: {} is not connected", GatewayKind::Relay);
        }
        self.definition
            .validate()
            .context("Cannot start: invalid test definition")
    }

    fn emit(&self, event: CoreToUi) {
        notify(&self.events, event);
    }

    fn set_state(&mut self, state: TestState) {
        if self.state != state {
            log::info!("Test state {} -> {}", self.state, state);
        }
        self.state = state;
        self.emit(CoreToUi::StateChanged(state));
    }

    fn schedule(&mut self, after: Duration, wake: Wake) {
        self.scheduler.schedule(
            after,
            Timer {
                generation: self.generation,
                wake,
            },
        );
    }

    fn serial_label(&self) -> String {
        self.serial_number
            .map(|s| s.to_string())
            .unwrap_or_default()
    }

    fn total_steps(&self) -> usize {
        match self.single_step {
            Some(_) => 1,
            None => self.definition.steps.len(),
        }
    }

    fn current_step(&self) -> Option<Step> {
        let index = match self.single_step {
            Some(target) if self.step_index == 0 => target,
            Some(_) => return None,
            None => self.step_index,
        };
        self.definition.steps.get(index).cloned()
    }

    fn context(&mut self) -> StepContext<'_> {
        StepContext {
            instrument: self.instrument.as_mut(),
            channels: &mut self.channels,
            events: &self.events,
        }
    }

    fn run_steps(&mut self) {
        match self.state {
            TestState::Running => {}
            TestState::Paused => {
                // Hold the step loop until resumed.
                self.schedule(DELAY_TICK, Wake::Settle);
                return;
            }
            state => {
                log::warn!("Ignoring step loop wake while {state}");
                return;
            }
        }

        let Some(step) = self.current_step() else {
            self.finish_run();
            return;
        };

        self.relay
            .select_route(step.input_source, self.definition.input_type);
        log::info!(
            "Step {}/{}: {} ({})",
            self.step_index + 1,
            self.total_steps(),
            step.description,
            step.step_type
        );
        self.emit(CoreToUi::StepChanged {
            description: step.description.clone(),
            duration: Duration::from_millis(step.duration_ms()),
            index: self.step_index,
            total: self.total_steps(),
        });

        let bindings = resolve_bindings(&self.definition, &step);
        for (channel_id, param) in &bindings {
            let (lower, upper) = display_bounds(step.step_type, param);
            self.emit(CoreToUi::ChannelBounds {
                channel_id: *channel_id,
                lower,
                upper,
            });
        }

        match step.step_type {
            StepType::DirectCurrent => {
                let run = DirectCurrentRun::begin(&step, bindings, &mut self.context());
                self.active = Some(StepRun::DirectCurrent(run));
                match step.duration_ms() {
                    0 => self.set_state(TestState::WaitKey),
                    duration => {
                        let token = self.delay.start(duration);
                        self.schedule(Duration::ZERO, Wake::Delay(token));
                    }
                }
            }
            StepType::CurrentLimiting => {
                let (run, progress) = CurrentLimitRun::begin(&step, bindings, &mut self.context());
                self.follow(StepRun::CurrentLimiting(run), progress);
            }
            StepType::AutomaticShort => {
                let (run, progress) = ShortRun::begin(&step, bindings);
                self.follow(StepRun::AutomaticShort(run), progress);
            }
        }
    }

    fn follow(&mut self, run: StepRun, progress: StepProgress) {
        match progress {
            StepProgress::Continue(after) => {
                self.active = Some(run);
                self.schedule(after, Wake::StepTick);
            }
            StepProgress::Finished(result) => self.finish_step(result),
        }
    }

    fn on_step_tick(&mut self) {
        if self.state == TestState::Canceled {
            return;
        }
        let Some(mut run) = self.active.take() else {
            log::warn!("Step tick without an active step");
            return;
        };
        let progress = {
            let mut ctx = self.context();
            match &mut run {
                StepRun::CurrentLimiting(ramp) => ramp.tick(&mut ctx),
                StepRun::AutomaticShort(short) => short.tick(&mut ctx),
                StepRun::DirectCurrent(_) => {
                    log::warn!("Direct current steps are not ticked");
                    self.active = Some(run);
                    return;
                }
            }
        };
        self.follow(run, progress);
    }

    fn on_delay_tick(&mut self, token: TickToken) {
        match self.delay.tick(token) {
            DelayTick::Stale => log::debug!("Dropping stale countdown tick"),
            DelayTick::Remaining(remaining) => {
                self.emit(CoreToUi::DelayRemaining(remaining));
                self.schedule(DELAY_TICK, Wake::Delay(token));
            }
            DelayTick::Completed => {
                if self.state == TestState::Running {
                    self.complete_direct_current();
                }
            }
        }
    }

    fn complete_direct_current(&mut self) {
        match self.active.take() {
            Some(StepRun::DirectCurrent(run)) => {
                let result = run.validate(&mut self.context());
                self.finish_step(result);
            }
            other => {
                log::warn!("No direct current step waiting for validation");
                self.active = other;
            }
        }
    }

    fn finish_step(&mut self, result: StepResult) {
        log::info!(
            "Step {} {} ({}): {}",
            result.step_id,
            result.description,
            result.step_type(),
            if result.passed { "PASS" } else { "FAIL" }
        );
        self.step_passes.push(result.passed);
        self.results.push(result);
        self.step_index += 1;
        self.schedule(self.config.settle, Wake::Settle);
    }

    /// Close the run: verdict, report, alert and teardown.
    ///
    /// A passed full run persists its report under the current serial number
    /// but does not advance it here. The advance happens at the next
    /// [`Sequencer::start_test_sequence`], which is when
    /// `CoreToUi::SerialNumberUpdated` is published, so the report and the
    /// unit on the bench keep the same number until the operator moves on.
    fn finish_run(&mut self) {
        let ids = self.definition.channel_ids();
        self.instrument.toggle_inputs(&ids, false);

        if self.state != TestState::Canceled {
            let verdict = if self.step_passes.iter().all(|&passed| passed) {
                TestState::Passed
            } else {
                TestState::Failed
            };
            self.set_state(verdict);
        }

        let header = ReportHeader {
            group: self.definition.group.clone(),
            model: self.definition.model.clone(),
            customer: self.definition.customer.clone(),
            serial_number: self.serial_label(),
            tester_id: self.tester_id.clone(),
            tested_at: Local::now(),
        };
        let report = render_report(&header, &self.results);
        self.emit(CoreToUi::ResultTextReady(report.clone()));

        if self.state == TestState::Passed && self.single_step.is_none() {
            if let Some(dir) = self.config.reports_dir.clone() {
                match save_report(&dir, &header.serial_number, &report) {
                    Ok(path) => self.emit(CoreToUi::ReportSaved(path)),
                    Err(err) => {
                        log::error!("{err:#}");
                        self.emit(CoreToUi::Error(format!("{err:#}")));
                    }
                }
            }
            self.increment_serial = true;
        }
        self.last_report = Some(report);

        self.refresh_telemetry();
        self.relay.sound_alert();
        self.reset_setup();
    }
}
