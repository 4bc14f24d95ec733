//! The three step algorithms.
//!
//! Each multi-tick algorithm is an explicit state machine: the sequencer calls
//! `tick` whenever the previously requested delay has elapsed and schedules
//! the next call from the returned [`StepProgress`]. Nothing here sleeps or
//! owns a timer, and dropping a run mid-way (cancellation) issues no further
//! commands.

use flume::Sender;
use std::time::Duration;

use super::result::{
    ChannelResults, CurrentLimitOutcome, DirectCurrentOutcome, ShortOutcome, StepResult,
};
use crate::{
    core::{
        bus::CoreToUi,
        definition::{ChannelId, Param, Step, StepId, StepType, TestDefinition},
        telemetry::{Reading, TelemetryChannel},
    },
    protocol::gateway::InstrumentGateway,
};

pub const RAMP_TICK: Duration = Duration::from_millis(100);
pub const RAMP_INCREMENT: f64 = 0.01;
/// Polls at the starting load before a channel that never recovers is given up on.
pub const MAX_RECOVERY_POLLS: u32 = 50;

pub const SHORT_TICK: Duration = Duration::from_millis(500);
pub const MAX_SHORT_CYCLES: u32 = 20;
/// Fraction of `va` below which an output counts as shut down.
pub const SHUTDOWN_RATIO: f64 = 0.2;

pub type Binding = (ChannelId, Param);

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Gauge bounds shown for a channel while a step runs.
pub fn display_bounds(step_type: StepType, param: &Param) -> (f64, f64) {
    match step_type {
        StepType::DirectCurrent => (param.va, param.vb),
        StepType::CurrentLimiting | StepType::AutomaticShort => {
            (round2(param.va * 0.5), round2(param.va * 1.5))
        }
    }
}

/// Resolve a step's channel bindings to their params. Bindings whose param
/// is missing are skipped.
pub fn resolve_bindings(definition: &TestDefinition, step: &Step) -> Vec<Binding> {
    step.channel_params
        .iter()
        .filter_map(|binding| match definition.param(binding.param) {
            Some(param) => Some((binding.channel, param.clone())),
            None => {
                log::warn!(
                    "Step {} channel {}: param {} not found, skipping",
                    step.id,
                    binding.channel,
                    binding.param
                );
                None
            }
        })
        .collect()
}

/// What the sequencer should do after a step function returns.
#[derive(Debug)]
pub enum StepProgress {
    /// Call `tick` again after this delay.
    Continue(Duration),
    Finished(StepResult),
}

/// Hardware and telemetry access handed to a step function for one call.
pub struct StepContext<'a> {
    pub instrument: &'a mut dyn InstrumentGateway,
    pub channels: &'a mut [TelemetryChannel],
    pub events: &'a Sender<CoreToUi>,
}

impl StepContext<'_> {
    fn telemetry(&mut self, channel: ChannelId) -> Option<&mut TelemetryChannel> {
        self.channels
            .iter_mut()
            .find(|telemetry| telemetry.channel_id() == channel)
    }

    fn publish(&self, channel_id: ChannelId, reading: Reading) {
        super::notify(
            self.events,
            CoreToUi::Telemetry {
                channel_id,
                reading,
            },
        );
    }

    /// Command a load level and record it on the channel if the write went out.
    pub fn command_load(&mut self, channel: ChannelId, amps: f64) {
        if !self.instrument.set_current(channel, amps) {
            return;
        }
        if let Some(reading) = self
            .telemetry(channel)
            .map(|telemetry| telemetry.set(None, Some(amps)))
        {
            self.publish(channel, reading);
        }
    }

    pub fn short_mode(&mut self, channel: ChannelId, on: bool) {
        self.instrument.toggle_short_mode(channel, on);
    }

    /// Read the live voltage. A failed read leaves the last known value.
    pub fn measure(&mut self, channel: ChannelId) -> Reading {
        let voltage = self.instrument.read_voltage(channel);
        match self.telemetry(channel) {
            Some(telemetry) => {
                let reading = match voltage {
                    Some(voltage) => telemetry.set(Some(voltage), None),
                    None => telemetry.read(),
                };
                self.publish(channel, reading);
                reading
            }
            None => Reading {
                voltage: voltage.unwrap_or_default(),
                ..Reading::default()
            },
        }
    }
}

/// Fixed load held for the step duration, then checked against `[va, vb]`.
#[derive(Debug)]
pub struct DirectCurrentRun {
    step_id: StepId,
    description: String,
    bindings: Vec<Binding>,
}

impl DirectCurrentRun {
    pub fn begin(step: &Step, bindings: Vec<Binding>, ctx: &mut StepContext<'_>) -> Self {
        for (channel, param) in &bindings {
            ctx.command_load(*channel, param.ia);
        }
        Self {
            step_id: step.id,
            description: step.description.clone(),
            bindings,
        }
    }

    pub fn validate(self, ctx: &mut StepContext<'_>) -> StepResult {
        let outcomes: Vec<_> = self
            .bindings
            .iter()
            .map(|(channel, param)| {
                let reading = ctx.measure(*channel);
                DirectCurrentOutcome {
                    channel_id: *channel,
                    load: param.ia,
                    lower_voltage: param.va,
                    upper_voltage: param.vb,
                    outcome_voltage: reading.voltage,
                    power: reading.power,
                }
            })
            .collect();

        let passed = outcomes
            .iter()
            .all(|o| o.lower_voltage <= o.outcome_voltage && o.outcome_voltage <= o.upper_voltage);
        StepResult {
            step_id: self.step_id,
            description: self.description,
            passed,
            channels: ChannelResults::DirectCurrent(outcomes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RampPhase {
    Ramping,
    Recovering { polls: u32 },
}

/// Raises the load in 0.01 A steps until the output sags below `va` (or the
/// load passes `ib`), one channel at a time.
#[derive(Debug)]
pub struct CurrentLimitRun {
    step_id: StepId,
    description: String,
    bindings: Vec<Binding>,
    index: usize,
    increments: u32,
    phase: RampPhase,
    outcomes: Vec<CurrentLimitOutcome>,
}

impl CurrentLimitRun {
    pub fn begin(
        step: &Step,
        bindings: Vec<Binding>,
        ctx: &mut StepContext<'_>,
    ) -> (Self, StepProgress) {
        let mut run = Self {
            step_id: step.id,
            description: step.description.clone(),
            bindings,
            index: 0,
            increments: 0,
            phase: RampPhase::Ramping,
            outcomes: Vec::new(),
        };
        let progress = run.enter_channel(ctx);
        (run, progress)
    }

    pub fn channel_index(&self) -> usize {
        self.index
    }

    fn load(&self, param: &Param) -> f64 {
        round2(param.ia + f64::from(self.increments) * RAMP_INCREMENT)
    }

    fn enter_channel(&mut self, ctx: &mut StepContext<'_>) -> StepProgress {
        let Some((channel, param)) = self.bindings.get(self.index).cloned() else {
            return StepProgress::Finished(self.result());
        };
        self.increments = 0;
        self.phase = RampPhase::Ramping;
        ctx.command_load(channel, param.ia);
        StepProgress::Continue(RAMP_TICK)
    }

    pub fn tick(&mut self, ctx: &mut StepContext<'_>) -> StepProgress {
        let Some((channel, param)) = self.bindings.get(self.index).cloned() else {
            return StepProgress::Finished(self.result());
        };
        let voltage = ctx.measure(channel).voltage;

        match self.phase {
            RampPhase::Ramping => {
                let load = self.load(&param);
                if voltage >= param.va && load <= param.ib {
                    self.increments += 1;
                    let next = self.load(&param);
                    log::debug!("Channel {channel}: {voltage:.3} V at {load:.2} A, ramping to {next:.2} A");
                    ctx.command_load(channel, next);
                } else {
                    log::info!("Channel {channel}: current limit reached at {load:.2} A ({voltage:.3} V)");
                    self.outcomes.push(CurrentLimitOutcome {
                        channel_id: channel,
                        under_voltage: param.va,
                        load_upper: param.ib,
                        load_lower: param.ia,
                        limit: load,
                    });
                    ctx.command_load(channel, param.ia);
                    self.phase = RampPhase::Recovering { polls: 0 };
                }
                StepProgress::Continue(RAMP_TICK)
            }
            RampPhase::Recovering { polls } => {
                if voltage <= param.va && polls < MAX_RECOVERY_POLLS {
                    self.phase = RampPhase::Recovering { polls: polls + 1 };
                    return StepProgress::Continue(RAMP_TICK);
                }
                if voltage <= param.va {
                    log::warn!("Channel {channel}: output did not recover to {:.3} V", param.va);
                }
                self.index += 1;
                self.enter_channel(ctx)
            }
        }
    }

    fn result(&self) -> StepResult {
        let passed = self
            .outcomes
            .iter()
            .all(|o| o.load_lower < o.limit && o.limit <= o.load_upper);
        StepResult {
            step_id: self.step_id,
            description: self.description.clone(),
            passed,
            channels: ChannelResults::CurrentLimiting(self.outcomes.clone()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ShortProbe {
    short_engaged: bool,
    shutdown: bool,
    recovery: bool,
}

/// Shorts each output and watches it shut down and then recover, for at most
/// [`MAX_SHORT_CYCLES`] cycles per channel.
#[derive(Debug)]
pub struct ShortRun {
    step_id: StepId,
    description: String,
    bindings: Vec<Binding>,
    index: usize,
    cycle: u32,
    probe: ShortProbe,
    outcomes: Vec<ShortOutcome>,
}

impl ShortRun {
    /// The first cycle is due immediately.
    pub fn begin(step: &Step, bindings: Vec<Binding>) -> (Self, StepProgress) {
        let run = Self {
            step_id: step.id,
            description: step.description.clone(),
            bindings,
            index: 0,
            cycle: 0,
            probe: ShortProbe::default(),
            outcomes: Vec::new(),
        };
        let progress = if run.bindings.is_empty() {
            StepProgress::Finished(run.result())
        } else {
            StepProgress::Continue(Duration::ZERO)
        };
        (run, progress)
    }

    pub fn channel_index(&self) -> usize {
        self.index
    }

    pub fn tick(&mut self, ctx: &mut StepContext<'_>) -> StepProgress {
        let Some((channel, param)) = self.bindings.get(self.index).cloned() else {
            return StepProgress::Finished(self.result());
        };
        if self.cycle == 0 {
            ctx.command_load(channel, param.ia);
        }

        let voltage = ctx.measure(channel).voltage;
        let threshold = param.va * SHUTDOWN_RATIO;
        if voltage >= threshold && !self.probe.shutdown && !self.probe.short_engaged {
            ctx.short_mode(channel, true);
            self.probe.short_engaged = true;
        }
        if voltage <= threshold && !self.probe.shutdown {
            self.probe.shutdown = true;
            ctx.short_mode(channel, false);
            self.probe.short_engaged = false;
        }
        if voltage >= param.va && self.probe.shutdown && !self.probe.recovery {
            self.probe.recovery = true;
        }
        log::debug!(
            "Channel {channel} short cycle {}: {voltage:.3} V, shutdown={}, recovery={}",
            self.cycle,
            self.probe.shutdown,
            self.probe.recovery
        );
        self.cycle += 1;

        if !self.probe.recovery && self.cycle < MAX_SHORT_CYCLES {
            return StepProgress::Continue(SHORT_TICK);
        }

        if self.probe.short_engaged {
            ctx.short_mode(channel, false);
        }
        self.outcomes.push(ShortOutcome {
            channel_id: channel,
            voltage_ref: param.va,
            shutdown: self.probe.shutdown,
            recovery: self.probe.recovery,
            load: param.ia,
        });
        ctx.command_load(channel, 0.0);

        self.index += 1;
        self.cycle = 0;
        self.probe = ShortProbe::default();
        if self.index < self.bindings.len() {
            StepProgress::Continue(SHORT_TICK)
        } else {
            StepProgress::Finished(self.result())
        }
    }

    fn result(&self) -> StepResult {
        // Every channel must both shut down and recover.
        let passed = self.outcomes.iter().all(|o| o.shutdown && o.recovery);
        StepResult {
            step_id: self.step_id,
            description: self.description.clone(),
            passed,
            channels: ChannelResults::AutomaticShort(self.outcomes.clone()),
        }
    }
}

/// The algorithm currently driving the hardware.
#[derive(Debug)]
pub enum StepRun {
    DirectCurrent(DirectCurrentRun),
    CurrentLimiting(CurrentLimitRun),
    AutomaticShort(ShortRun),
}
