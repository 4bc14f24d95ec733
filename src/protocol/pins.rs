/// Relay board gateway: Arduino-style digital pin commands over serial
///
/// Frames are bare ASCII with no terminator:
/// - `M<mode><pin>` sets the pin mode (`O` output)
/// - `WD<pin>:<0|1>` writes a digital level
/// - `RD<pin>` reads a digital level, answered by a `D<pin>:<0|1>` line
use anyhow::{anyhow, bail, Result};
use std::{thread, time::Duration};

use super::{
    gateway::RelayGateway,
    link::{Link, LineLink, SerialConfig},
};
use crate::core::definition::{InputType, MAX_INPUT_SOURCES};

/// First pin of the AC routes (sources 0..3 map to pins 4, 5, 6).
const AC_BASE_PIN: u8 = 4;
/// First pin of the DC routes (sources 0..3 map to pins 7, 8, 9).
const DC_BASE_PIN: u8 = 7;
pub const BUZZER_PIN: u8 = 10;

pub const DEFAULT_ALERT: Duration = Duration::from_millis(500);

/// Output pin that energises a route, if the route exists.
pub fn route_pin(source: usize, input_type: InputType) -> Option<u8> {
    if source >= MAX_INPUT_SOURCES {
        return None;
    }
    let base = match input_type {
        InputType::Ac => AC_BASE_PIN,
        InputType::Dc => DC_BASE_PIN,
    };
    Some(base + source as u8)
}

fn parse_pin_reply(pin: u8, reply: &str) -> Result<bool> {
    let header = format!("D{pin}:");
    let value = reply
        .trim()
        .strip_prefix(header.as_str())
        .ok_or_else(|| anyhow!("Unexpected reply {reply:?} to pin {pin} read"))?;
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => bail!("Invalid pin level {other:?}"),
    }
}

pub struct PinBoard {
    link: Option<LineLink>,
    active_pin: Option<u8>,
    alert: Duration,
}

impl PinBoard {
    /// Open the configured port. Failures leave the board disconnected.
    pub fn connect(config: &SerialConfig, alert: Duration) -> Self {
        match config.open() {
            Ok(link) => {
                log::info!("Connected to relay board on {}", config.port);
                Self::from_link(link, alert)
            }
            Err(err) => {
                log::warn!("Relay board unavailable: {err:#}");
                Self::disconnected()
            }
        }
    }

    pub fn disconnected() -> Self {
        Self {
            link: None,
            active_pin: None,
            alert: DEFAULT_ALERT,
        }
    }

    pub fn from_link(link: Box<dyn Link>, alert: Duration) -> Self {
        Self {
            link: Some(LineLink::new(link, "")),
            active_pin: None,
            alert,
        }
    }

    pub fn active_pin(&self) -> Option<u8> {
        self.active_pin
    }

    /// Read a digital pin level with the board's `RD` frame. `None` if
    /// disconnected or the reply is garbled. Routing never reads pins back;
    /// this is here for bench diagnostics.
    pub fn read_pin(&mut self, pin: u8) -> Option<bool> {
        let link = self.link.as_mut()?;
        let result = link
            .query(&format!("RD{pin}"))
            .and_then(|reply| parse_pin_reply(pin, &reply));
        match result {
            Ok(level) => Some(level),
            Err(err) => {
                log::warn!("Relay board pin {pin} read failed: {err:#}");
                None
            }
        }
    }

    fn drive(&mut self, pin: u8, high: bool) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            link.send(&format!("MO{pin}"))?;
            link.send(&format!("WD{pin}:{}", u8::from(high)))?;
        }
        Ok(())
    }

    fn switch_to(&mut self, pin: u8) -> Result<()> {
        if let Some(previous) = self.active_pin {
            self.drive(previous, false)?;
        }
        self.drive(pin, true)
    }

    fn pulse_buzzer(&mut self) -> Result<()> {
        self.drive(BUZZER_PIN, true)?;
        thread::sleep(self.alert);
        if let Some(link) = self.link.as_mut() {
            link.send(&format!("WD{BUZZER_PIN}:0"))?;
        }
        Ok(())
    }

    fn absorb(what: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Relay board {what} failed: {err:#}");
                false
            }
        }
    }
}

impl RelayGateway for PinBoard {
    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn select_route(&mut self, source: usize, input_type: InputType) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(pin) = route_pin(source, input_type) else {
            log::warn!("No relay route for {input_type} source {source}");
            return false;
        };
        if self.active_pin == Some(pin) {
            return true;
        }

        let result = self.switch_to(pin);
        let done = Self::absorb("route select", result);
        if done {
            log::info!("Routed {input_type} source {} (pin {pin})", source + 1);
            self.active_pin = Some(pin);
        }
        done
    }

    fn release_route(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(pin) = self.active_pin.take() else {
            return true;
        };
        let result = self.drive(pin, false);
        Self::absorb("route release", result)
    }

    fn sound_alert(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let result = self.pulse_buzzer();
        Self::absorb("alert", result)
    }
}
