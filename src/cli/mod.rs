pub mod console;
pub mod input;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::{path::PathBuf, thread};

use crate::{
    core::{
        bus::{Bus, UiToCore},
        config::RigConfig,
        definition::{StepId, TestDefinition},
        runtime::{run_core_thread, CoreRuntimeConfig},
        sequencer::{Sequencer, TestState},
        serial_number::SerialNumber,
    },
    protocol::{
        gateway::{InstrumentGateway, RelayGateway},
        pins::PinBoard,
        scpi::ScpiLoad,
        simulated::{SimulatedLoad, SimulatedRelay},
    },
};

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

pub fn build_command() -> Command {
    Command::new("psu_bench")
        .about("Run a power-supply validation sequence on the bench rig")
        .arg(
            Arg::new("definition")
                .long("definition")
                .short('d')
                .help("Test definition file (.toml or .json)")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .required_unless_present("write-config"),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .short('s')
                .help("Serial number of the unit under test (up to 8 digits)")
                .value_name("N"),
        )
        .arg(
            Arg::new("tester")
                .long("tester")
                .short('t')
                .help("Operator identifier printed on the report")
                .value_name("ID")
                .default_value(""),
        )
        .arg(
            Arg::new("step")
                .long("step")
                .help("Run only the step with this id")
                .value_name("ID")
                .value_parser(clap::value_parser!(StepId)),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .help("Use a simulated load and relay board instead of serial hardware")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Rig configuration file (default: ./psu_bench.toml)")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("write-config")
                .long("write-config")
                .help("Write the effective rig configuration to the config path")
                .action(ArgAction::SetTrue),
        )
}

fn connect_gateways(
    config: &RigConfig,
    definition: &TestDefinition,
    simulate: bool,
) -> (Box<dyn InstrumentGateway>, Box<dyn RelayGateway>) {
    if simulate {
        log::info!("Using simulated electronic load and relay board");
        return (
            Box::new(SimulatedLoad::for_definition(definition)),
            Box::new(SimulatedRelay::new()),
        );
    }
    (
        Box::new(ScpiLoad::connect(&config.instrument)),
        Box::new(PinBoard::connect(&config.relay.serial, config.relay.alert())),
    )
}

/// Run one sequence as described by `matches`. Returns the process exit code.
pub fn run(matches: &ArgMatches) -> Result<i32> {
    let config_path = match matches.get_one::<PathBuf>("config") {
        Some(path) => path.clone(),
        None => RigConfig::default_path()?,
    };
    let config = RigConfig::load(&config_path)?;
    if matches.get_flag("write-config") {
        config.save(&config_path)?;
    }

    let Some(definition_arg) = matches.get_one::<PathBuf>("definition") else {
        return Ok(0);
    };
    let definition = TestDefinition::load(config.definition_path(definition_arg))?;

    let serial_number = matches
        .get_one::<String>("serial")
        .map(|text| text.parse::<SerialNumber>())
        .transpose()
        .context("Invalid --serial")?;
    let tester_id = matches
        .get_one::<String>("tester")
        .cloned()
        .unwrap_or_default();

    let (instrument, relay) = connect_gateways(&config, &definition, matches.get_flag("simulate"));

    let (ui_tx, ui_rx) = flume::unbounded::<UiToCore>();
    let (core_tx, core_rx) = flume::unbounded();
    let sequencer = Sequencer::new(
        definition,
        instrument,
        relay,
        core_tx.clone(),
        config.sequencer_config(),
    );

    let runtime_config = CoreRuntimeConfig {
        poll_interval: config.timing.poll_interval(),
    };
    let poller_tx = ui_tx.clone();
    let core_handle = thread::Builder::new()
        .name("control".to_string())
        .spawn(move || run_core_thread(ui_rx, poller_tx, core_tx, runtime_config, sequencer))
        .context("Failed to spawn control thread")?;

    {
        let tx = ui_tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(UiToCore::Cancel);
            let _ = tx.send(UiToCore::Quit);
        })
        .context("Failed to install Ctrl-C handler")?;
    }
    input::spawn_input_thread(ui_tx.clone())?;

    let start = match matches.get_one::<StepId>("step") {
        Some(&step_id) => UiToCore::StartSingle {
            step_id,
            serial_number,
            tester_id,
        },
        None => UiToCore::Start {
            serial_number,
            tester_id,
        },
    };
    ui_tx.send(start).context("Control thread is not running")?;

    let bus = Bus::new(core_rx, ui_tx);
    let outcome = console::drive(&bus)?;

    match core_handle.join() {
        Ok(result) => result?,
        Err(_) => log::error!("Control thread panicked"),
    }

    Ok(match outcome {
        Some(TestState::Passed) => 0,
        _ => 1,
    })
}
