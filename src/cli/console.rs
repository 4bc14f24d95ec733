use anyhow::{anyhow, Result};

use super::input::HELP;
use crate::core::{
    bus::{Bus, CoreToUi, UiToCore},
    sequencer::TestState,
};

/// One console line for an event, or `None` for events that are only logged.
pub fn describe(event: &CoreToUi) -> Option<String> {
    match event {
        CoreToUi::StateChanged(state) => Some(format!("State: {state}")),
        CoreToUi::SerialNumberUpdated(serial) => Some(format!("Serial number: {serial}")),
        CoreToUi::StepChanged {
            description,
            duration,
            index,
            total,
        } => Some(if duration.is_zero() {
            format!("[{}/{total}] {description} (press c to continue)", index + 1)
        } else {
            format!(
                "[{}/{total}] {description} ({:.1} s)",
                index + 1,
                duration.as_secs_f64()
            )
        }),
        CoreToUi::DelayRemaining(ms) if ms % 1000 == 0 => {
            Some(format!("  {} s remaining", ms / 1000))
        }
        CoreToUi::DelayRemaining(_) => None,
        CoreToUi::ChannelBounds {
            channel_id,
            lower,
            upper,
        } => Some(format!("  Channel {channel_id}: {lower:.2} V .. {upper:.2} V")),
        CoreToUi::Telemetry {
            channel_id,
            reading,
        } => {
            log::debug!(
                "Channel {channel_id}: {:.3} V {:.3} A {:.3} W",
                reading.voltage,
                reading.current,
                reading.power
            );
            None
        }
        CoreToUi::ResultTextReady(text) => Some(text.trim_end().to_string()),
        CoreToUi::ReportSaved(path) => Some(format!("Report saved to {}", path.display())),
        CoreToUi::Error(message) => Some(format!("Error: {message}")),
        CoreToUi::Quit => None,
    }
}

/// Print events until the control thread quits. Asks it to quit once the
/// run has finished or could not start. Returns the final run state.
pub fn drive(bus: &Bus) -> Result<Option<TestState>> {
    println!("{HELP}");
    let mut started = false;
    let mut outcome = None;

    for event in bus.core_rx.iter() {
        if let Some(line) = describe(&event) {
            match event {
                CoreToUi::Error(_) => eprintln!("{line}"),
                _ => println!("{line}"),
            }
        }
        match event {
            CoreToUi::StateChanged(TestState::Running) => started = true,
            CoreToUi::StateChanged(state) if state.is_finished() => {
                outcome = Some(state);
                request_quit(bus)?;
            }
            CoreToUi::Error(_) if !started => request_quit(bus)?,
            CoreToUi::Quit => break,
            _ => {}
        }
    }
    Ok(outcome)
}

fn request_quit(bus: &Bus) -> Result<()> {
    bus.ui_tx
        .send(UiToCore::Quit)
        .map_err(|err| anyhow!("Failed to reach control thread: {err}"))
}
