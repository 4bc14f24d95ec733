use anyhow::{anyhow, Result};
use flume::Sender;
use std::{
    io::{self, BufRead},
    thread,
};

use crate::core::bus::UiToCore;

pub const HELP: &str = "Commands: p = pause/resume, c = continue, x = cancel, q = quit";

/// Map one line of operator input to a command for the control thread.
pub fn map_command(line: &str) -> Option<UiToCore> {
    match line.trim().to_ascii_lowercase().as_str() {
        "p" | "pause" => Some(UiToCore::TogglePause),
        "c" | "continue" => Some(UiToCore::Continue),
        "x" | "cancel" => Some(UiToCore::Cancel),
        "q" | "quit" => Some(UiToCore::Quit),
        _ => None,
    }
}

/// Spawn the stdin reader. It exits on end of input or once the control
/// thread stops accepting commands.
pub fn spawn_input_thread(ui_tx: Sender<UiToCore>) -> Result<()> {
    thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match map_command(&line) {
                    Some(command) => {
                        if ui_tx.send(command).is_err() {
                            break;
                        }
                    }
                    None => println!("{HELP}"),
                }
            }
            log::debug!("Operator input closed");
        })
        .map_err(|err| anyhow!("Failed to spawn input thread: {err}"))?;
    Ok(())
}
