//! Control thread event loop
//!
//! Owns the [`Sequencer`] and the telemetry poller. Blocks on the command
//! channel until either a command arrives or the sequencer's next timer is
//! due, so every sequencer call happens on this one thread.
use anyhow::{anyhow, Result};
use flume::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use super::{
    bus::{CoreToUi, UiToCore},
    poller::{TelemetryPoller, DEFAULT_POLL_INTERVAL},
    sequencer::{Sequencer, TestState},
};

/// Longest wait between loop iterations when no timer is pending.
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub struct CoreRuntimeConfig {
    /// Interval between telemetry refresh requests
    pub poll_interval: Duration,
}

impl Default for CoreRuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

fn send(core_tx: &Sender<CoreToUi>, event: CoreToUi) -> Result<()> {
    core_tx
        .send(event)
        .map_err(|err| anyhow!("Failed to notify frontend: {err}"))
}

fn refuse(core_tx: &Sender<CoreToUi>, err: anyhow::Error) -> Result<()> {
    log::warn!("{err:#}");
    send(core_tx, CoreToUi::Error(format!("{err:#}")))
}

fn handle_message(
    msg: UiToCore,
    sequencer: &mut Sequencer,
    poller: &mut TelemetryPoller,
    core_tx: &Sender<CoreToUi>,
) -> Result<Flow> {
    match msg {
        UiToCore::Start {
            serial_number,
            tester_id,
        } => {
            if serial_number.is_some() {
                sequencer.set_serial_number(serial_number);
            }
            sequencer.set_tester_id(tester_id);
            if let Err(err) = sequencer.start_test_sequence() {
                refuse(core_tx, err)?;
            }
        }
        UiToCore::StartSingle {
            step_id,
            serial_number,
            tester_id,
        } => {
            if serial_number.is_some() {
                sequencer.set_serial_number(serial_number);
            }
            sequencer.set_tester_id(tester_id);
            if let Err(err) = sequencer.setup_single_run(step_id) {
                refuse(core_tx, err)?;
            }
        }
        UiToCore::TogglePause => {
            if !sequencer.toggle_test_pause_state() {
                log::debug!("Pause ignored while {}", sequencer.state());
            }
        }
        UiToCore::Continue => {
            if !sequencer.continue_sequence() {
                log::debug!("Continue ignored while {}", sequencer.state());
            }
        }
        UiToCore::Cancel => {
            if !sequencer.cancel_test_sequence() {
                log::debug!("Cancel ignored while {}", sequencer.state());
            }
        }
        UiToCore::RefreshTelemetry => {
            sequencer.refresh_telemetry();
            poller.mark_refresh_complete();
        }
        UiToCore::Quit => {
            log::info!("Received quit signal");
            if matches!(
                sequencer.state(),
                TestState::Running | TestState::Paused | TestState::WaitKey
            ) {
                sequencer.cancel_test_sequence();
            }
            poller.stop();
            send(core_tx, CoreToUi::Quit)?;
            return Ok(Flow::Quit);
        }
    }
    Ok(Flow::Continue)
}

/// Run the control loop until `Quit` is received or the frontend goes away.
///
/// `ui_tx` is handed to the telemetry poller so its refresh requests arrive
/// on the same queue as frontend commands.
pub fn run_core_thread(
    ui_rx: Receiver<UiToCore>,
    ui_tx: Sender<UiToCore>,
    core_tx: Sender<CoreToUi>,
    config: CoreRuntimeConfig,
    mut sequencer: Sequencer,
) -> Result<()> {
    let origin = Instant::now();
    let mut poller =
        TelemetryPoller::spawn(config.poll_interval, ui_tx, UiToCore::RefreshTelemetry)?;

    loop {
        sequencer.run_due_with(|| origin.elapsed());

        let timeout = sequencer
            .next_deadline()
            .map(|due| due.saturating_sub(origin.elapsed()))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);

        match ui_rx.recv_timeout(timeout) {
            Ok(msg) => {
                // Bring the sequencer clock up to date before acting on the command.
                sequencer.run_due_with(|| origin.elapsed());
                if let Flow::Quit = handle_message(msg, &mut sequencer, &mut poller, &core_tx)? {
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Command channel closed, stopping control thread");
                sequencer.cancel_test_sequence();
                poller.stop();
                return Ok(());
            }
        }
    }
}
