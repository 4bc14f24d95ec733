use anyhow::{Context, Result};
use flume::Receiver;
use std::{path::PathBuf, time::Duration};

use psu_bench::{
    core::{
        bus::CoreToUi,
        definition::{ChannelBinding, ChannelLabel, InputType, Param, Step, StepType, TestDefinition},
        sequencer::{
            result::ChannelResults, Sequencer, SequencerConfig, TestState, SETTLE_DELAY,
        },
        serial_number::SerialNumber,
    },
    protocol::{
        gateway::{DisconnectedInstrument, DisconnectedRelay},
        simulated::{LoadCommand, SimulatedLoad, SimulatedRelay},
    },
};

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn param(id: u32, va: f64, vb: f64, ia: f64, ib: f64) -> Param {
    Param {
        id,
        tag: format!("p{id}"),
        va,
        vb,
        ia,
        ib,
    }
}

fn step(id: u32, step_type: StepType, duration: f64, bindings: &[(u8, u32)]) -> Step {
    Step {
        id,
        step_type,
        description: format!("{step_type} #{id}"),
        duration,
        input_source: 0,
        channel_params: bindings
            .iter()
            .map(|&(channel, param)| ChannelBinding { channel, param })
            .collect(),
    }
}

fn definition(channels: &[u8], params: Vec<Param>, steps: Vec<Step>) -> TestDefinition {
    TestDefinition {
        group: "Bench".to_string(),
        model: "PSU-12".to_string(),
        customer: "ACME".to_string(),
        input_type: InputType::Dc,
        input_sources: vec![24.0],
        channels: channels
            .iter()
            .map(|&id| ChannelLabel {
                id,
                label: format!("CH{id}"),
            })
            .collect(),
        params,
        steps,
    }
}

/// The single-channel, single-step definition used by most scenarios.
fn nominal(step_type: StepType, duration: f64) -> TestDefinition {
    definition(
        &[1],
        vec![param(1, 10.0, 12.0, 1.0, 2.0)],
        vec![step(1, step_type, duration, &[(1, 1)])],
    )
}

struct Rig {
    sequencer: Sequencer,
    load: SimulatedLoad,
    relay: SimulatedRelay,
    events: Receiver<CoreToUi>,
}

impl Rig {
    fn new(definition: TestDefinition, load: SimulatedLoad) -> Self {
        Self::with_config(definition, load, SequencerConfig::default())
    }

    fn with_config(definition: TestDefinition, load: SimulatedLoad, config: SequencerConfig) -> Self {
        let relay = SimulatedRelay::new();
        let (tx, rx) = flume::unbounded();
        let sequencer = Sequencer::new(
            definition,
            Box::new(load.clone()),
            Box::new(relay.clone()),
            tx,
            config,
        );
        Self {
            sequencer,
            load,
            relay,
            events: rx,
        }
    }

    fn states(&self) -> Vec<TestState> {
        self.events
            .try_iter()
            .filter_map(|event| match event {
                CoreToUi::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    fn run_to_end(&mut self) {
        self.sequencer.advance_by(Duration::from_secs(120));
    }
}

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("psu_bench_{name}_{}", std::process::id()))
}

#[test]
fn direct_current_run_passes_end_to_end() -> Result<()> {
    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 2.0), SimulatedLoad::constant(11.0));
    assert_eq!(rig.sequencer.state(), TestState::None);

    rig.sequencer.start_test_sequence()?;
    assert_eq!(rig.sequencer.state(), TestState::Running);

    rig.sequencer.advance_by(ms(2900));
    assert_eq!(rig.sequencer.state(), TestState::Running);
    rig.sequencer.advance_by(ms(1100));
    assert_eq!(rig.sequencer.state(), TestState::Passed);
    assert_eq!(rig.states(), vec![TestState::Running, TestState::Passed]);

    let results = rig.sequencer.results();
    assert_eq!(results.len(), 1);
    assert!(results[0].passed);
    assert_eq!(results[0].step_type(), StepType::DirectCurrent);
    let ChannelResults::DirectCurrent(channels) = &results[0].channels else {
        panic!("expected direct current outcome");
    };
    assert_eq!(channels[0].outcome_voltage, 11.0);
    assert_eq!(channels[0].power, 11.0);

    let report = rig.sequencer.last_report().context("no report")?;
    assert!(report.contains("[ PASS ]"));
    assert!(report.contains("| Serial No: 00000001"));
    Ok(())
}

#[test]
fn direct_current_band_edges() -> Result<()> {
    for (voltage, expected) in [
        (10.0, TestState::Passed),
        (12.0, TestState::Passed),
        (9.999, TestState::Failed),
        (12.001, TestState::Failed),
    ] {
        let mut rig = Rig::new(
            nominal(StepType::DirectCurrent, 1.0),
            SimulatedLoad::constant(voltage),
        );
        rig.sequencer.start_test_sequence()?;
        rig.run_to_end();
        assert_eq!(rig.sequencer.state(), expected, "voltage {voltage}");
    }
    Ok(())
}

#[test]
fn cancel_only_acts_on_live_states() -> Result<()> {
    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 1.0), SimulatedLoad::constant(11.0));
    rig.sequencer.start_test_sequence()?;
    rig.run_to_end();
    assert_eq!(rig.sequencer.state(), TestState::Passed);
    assert!(!rig.sequencer.cancel_test_sequence());
    assert_eq!(rig.sequencer.state(), TestState::Passed);

    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 1.0), SimulatedLoad::constant(5.0));
    rig.sequencer.start_test_sequence()?;
    rig.run_to_end();
    assert_eq!(rig.sequencer.state(), TestState::Failed);
    assert!(!rig.sequencer.cancel_test_sequence());
    assert_eq!(rig.sequencer.state(), TestState::Failed);

    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 1.0), SimulatedLoad::constant(11.0));
    assert!(rig.sequencer.cancel_test_sequence());
    assert_eq!(rig.sequencer.state(), TestState::Canceled);
    Ok(())
}

#[test]
fn canceled_run_can_be_restarted() -> Result<()> {
    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 1.0), SimulatedLoad::constant(11.0));
    rig.sequencer.start_test_sequence()?;
    rig.sequencer.advance_by(ms(1500));
    assert!(rig.sequencer.cancel_test_sequence());

    rig.sequencer.start_test_sequence()?;
    rig.run_to_end();
    assert_eq!(rig.sequencer.state(), TestState::Passed);
    assert_eq!(rig.sequencer.results().len(), 1);
    Ok(())
}

#[test]
fn current_limit_records_first_collapsed_load() -> Result<()> {
    let load = SimulatedLoad::new(|_, state| if state.load < 1.234 { 12.0 } else { 0.5 });
    let mut rig = Rig::new(nominal(StepType::CurrentLimiting, 0.0), load);
    rig.sequencer.start_test_sequence()?;
    rig.run_to_end();

    let results = rig.sequencer.results();
    let ChannelResults::CurrentLimiting(channels) = &results[0].channels else {
        panic!("expected current limit outcome");
    };
    assert_eq!(channels[0].limit, 1.24);
    assert!(results[0].passed);
    assert_eq!(rig.sequencer.state(), TestState::Passed);
    Ok(())
}

#[test]
fn short_step_fails_unless_every_channel_recovers() -> Result<()> {
    let definition = definition(
        &[1, 2],
        vec![param(1, 10.0, 12.0, 1.0, 2.0)],
        vec![step(1, StepType::AutomaticShort, 0.0, &[(1, 1), (2, 1)])],
    );
    // Channel 2 keeps its output while shorted.
    let load = SimulatedLoad::new(|channel, state| {
        if state.short && channel == 1 {
            0.0
        } else {
            12.0
        }
    });
    let mut rig = Rig::new(definition, load);
    rig.sequencer.start_test_sequence()?;
    rig.run_to_end();

    let results = rig.sequencer.results();
    let ChannelResults::AutomaticShort(channels) = &results[0].channels else {
        panic!("expected short outcome");
    };
    assert!(channels[0].shutdown && channels[0].recovery);
    assert!(!channels[1].shutdown);
    assert!(!results[0].passed);
    assert_eq!(rig.sequencer.state(), TestState::Failed);
    Ok(())
}

#[test]
fn paused_countdown_finishes_its_remainder_after_resume() -> Result<()> {
    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 1.0), SimulatedLoad::constant(11.0));
    rig.sequencer.start_test_sequence()?;
    // Settle, then three countdown ticks.
    rig.sequencer.advance_by(SETTLE_DELAY + ms(250));
    assert_eq!(rig.sequencer.delay_remaining_ms(), 700);

    assert!(rig.sequencer.toggle_test_pause_state());
    rig.sequencer.advance_by(Duration::from_secs(600));
    assert_eq!(rig.sequencer.delay_remaining_ms(), 700);
    assert!(rig.sequencer.results().is_empty());

    assert!(rig.sequencer.toggle_test_pause_state());
    rig.sequencer.advance_by(ms(699));
    assert!(rig.sequencer.results().is_empty());
    rig.sequencer.advance_by(ms(1));
    assert_eq!(rig.sequencer.results().len(), 1);
    Ok(())
}

#[test]
fn cancel_during_ramp_halts_load_commands() -> Result<()> {
    let definition = definition(
        &[1, 2],
        vec![param(1, 10.0, 12.0, 1.0, 2.0)],
        vec![step(1, StepType::CurrentLimiting, 0.0, &[(1, 1), (2, 1)])],
    );
    // Channel 1 folds back almost at once, channel 2 never does.
    let load = SimulatedLoad::new(|channel, state| {
        if channel == 1 && state.load > 1.05 {
            0.0
        } else {
            12.0
        }
    });
    let mut rig = Rig::new(definition, load);
    rig.sequencer.start_test_sequence()?;
    rig.sequencer.advance_by(ms(3000));
    assert!(rig
        .load
        .commands()
        .iter()
        .any(|c| matches!(c, LoadCommand::SetCurrent(2, amps) if *amps > 1.0)));

    assert!(rig.sequencer.cancel_test_sequence());
    rig.load.clear_commands();
    rig.sequencer.advance_by(Duration::from_secs(60));

    assert!(rig.load.commands().is_empty());
    assert!(rig.sequencer.results().is_empty());
    assert_eq!(rig.sequencer.state(), TestState::Canceled);
    Ok(())
}

#[test]
fn single_run_executes_one_step_without_persisting() -> Result<()> {
    let dir = temp_dir("single");
    let definition = definition(
        &[1],
        vec![param(1, 10.0, 12.0, 1.0, 2.0)],
        vec![
            step(1, StepType::DirectCurrent, 5.0, &[(1, 1)]),
            step(2, StepType::DirectCurrent, 1.0, &[(1, 1)]),
        ],
    );
    let mut rig = Rig::with_config(
        definition,
        SimulatedLoad::constant(11.0),
        SequencerConfig {
            reports_dir: Some(dir.clone()),
            ..SequencerConfig::default()
        },
    );
    rig.sequencer.set_serial_number(Some(SerialNumber::new(5)?));
    rig.sequencer.setup_single_run(2)?;
    rig.run_to_end();

    assert_eq!(rig.sequencer.state(), TestState::Passed);
    let ids: Vec<_> = rig.sequencer.results().iter().map(|r| r.step_id).collect();
    assert_eq!(ids, vec![2]);
    assert!(!dir.exists());

    rig.sequencer.start_test_sequence()?;
    assert_eq!(rig.sequencer.serial_number(), Some(SerialNumber::new(5)?));
    Ok(())
}

#[test]
fn unknown_single_step_is_refused() {
    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 1.0), SimulatedLoad::constant(11.0));
    assert!(rig.sequencer.setup_single_run(99).is_err());
    assert_eq!(rig.sequencer.state(), TestState::None);
}

#[test]
fn disconnected_instrument_blocks_start() {
    let load = SimulatedLoad::constant(11.0);
    load.set_connected(false);
    let mut rig = Rig::new(nominal(StepType::DirectCurrent, 1.0), load);

    let err = rig.sequencer.start_test_sequence().err().map(|e| e.to_string());
    assert_eq!(
        err.as_deref(),
        Some("Cannot start: electronic load is not connected")
    );
    assert_eq!(rig.sequencer.state(), TestState::None);
    assert!(rig.relay.commands().is_empty());
}

#[test]
fn invalid_definition_blocks_start() {
    let definition = definition(
        &[1],
        vec![param(1, 10.0, 12.0, 1.0, 2.0)],
        vec![step(1, StepType::DirectCurrent, 1.0, &[(1, 7)])],
    );
    let mut rig = Rig::new(definition, SimulatedLoad::constant(11.0));
    assert!(rig.sequencer.start_test_sequence().is_err());
    assert_eq!(rig.sequencer.state(), TestState::None);
    assert!(rig.load.commands().is_empty());
}

#[test]
fn passed_run_saves_report_and_wraps_serial() -> Result<()> {
    let dir = temp_dir("saved");
    let mut rig = Rig::with_config(
        nominal(StepType::DirectCurrent, 1.0),
        SimulatedLoad::constant(11.0),
        SequencerConfig {
            reports_dir: Some(dir.clone()),
            ..SequencerConfig::default()
        },
    );
    rig.sequencer.set_serial_number(Some(SerialNumber::new(99_999_999)?));
    rig.sequencer.set_tester_id("op7");
    rig.sequencer.start_test_sequence()?;
    rig.run_to_end();

    let events: Vec<_> = rig.events.try_iter().collect();
    let saved: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CoreToUi::ReportSaved(path) => Some(path.clone()),
            _ => None,
        })
        .collect();
    let path = dir.join("99999999.txt");
    assert_eq!(saved, vec![path.clone()]);
    let text = std::fs::read_to_string(&path)?;
    assert!(text.contains("| Tested By: op7"));

    // The verdict keeps the serial; only the next start moves it on.
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoreToUi::SerialNumberUpdated(_))));
    assert_eq!(
        rig.sequencer.serial_number().map(|s| s.to_string()).as_deref(),
        Some("99999999")
    );

    rig.sequencer.start_test_sequence()?;
    assert_eq!(
        rig.sequencer.serial_number().map(|s| s.to_string()).as_deref(),
        Some("00000000")
    );
    let wrapped = CoreToUi::SerialNumberUpdated(SerialNumber::new(0)?);
    assert!(rig.events.try_iter().any(|e| e == wrapped));
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn placeholders_without_hardware_refuse_to_run() {
    let (tx, rx) = flume::unbounded();
    let mut sequencer = Sequencer::new(
        nominal(StepType::DirectCurrent, 1.0),
        Box::new(DisconnectedInstrument),
        Box::new(DisconnectedRelay),
        tx,
        SequencerConfig::default(),
    );
    assert!(sequencer.start_test_sequence().is_err());

    sequencer.refresh_telemetry();
    assert_eq!(sequencer.reading(1).map(|r| r.voltage), Some(0.0));
    assert!(rx.try_iter().all(|e| !matches!(e, CoreToUi::Telemetry { .. })));

    assert!(sequencer.cancel_test_sequence());
    assert_eq!(sequencer.state(), TestState::Canceled);
}
