/// Electronic load gateway speaking SCPI over a serial link
///
/// The session (link + currently selected channel) lives behind one lock, so a
/// channel select and the command that depends on it are never interleaved
/// with another caller's request on the same line.
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::{sync::Arc, thread, time::Duration};

use super::{
    gateway::InstrumentGateway,
    link::{Link, LineLink, SerialConfig},
};
use crate::core::definition::ChannelId;

pub mod commands {
    pub const INST_ID: &str = "*IDN?";
    pub const SYSTEM_REMOTE: &str = "SYST:REM";
    pub const CLEAR_STATUS: &str = "*CLS";
    pub const RESET: &str = "*RST";
    pub const SELECT_CHANNEL: &str = "CHAN ";
    pub const INPUT_ON: &str = "INP ON";
    pub const INPUT_OFF: &str = "INP OFF";
    pub const SET_CURR: &str = "CURR ";
    pub const SHORT_ON: &str = "INP:SHOR ON";
    pub const SHORT_OFF: &str = "INP:SHOR OFF";
    pub const MEAS_VOLT: &str = "MEAS:VOLT?";
}

/// Time the load needs to apply a new current setpoint.
pub const DEFAULT_APPLY_DELAY: Duration = Duration::from_millis(100);

struct LoadSession {
    link: LineLink,
    active_channel: Option<ChannelId>,
}

impl LoadSession {
    fn select(&mut self, channel: ChannelId) -> Result<()> {
        if self.active_channel == Some(channel) {
            return Ok(());
        }
        self.link
            .send(&format!("{}{channel}", commands::SELECT_CHANNEL))?;
        self.active_channel = Some(channel);
        Ok(())
    }

    fn on_channel(&mut self, channel: ChannelId, command: &str) -> Result<()> {
        self.select(channel)?;
        self.link.send(command)
    }
}

#[derive(Clone)]
pub struct ScpiLoad {
    session: Option<Arc<Mutex<LoadSession>>>,
    identity: String,
    apply_delay: Duration,
}

impl ScpiLoad {
    /// Open the configured port and handshake. Failures leave the gateway
    /// disconnected rather than erroring.
    pub fn connect(config: &SerialConfig) -> Self {
        match config
            .open()
            .and_then(|link| Self::from_link(link, DEFAULT_APPLY_DELAY))
        {
            Ok(load) => load,
            Err(err) => {
                log::warn!("Electronic load unavailable: {err:#}");
                Self::disconnected()
            }
        }
    }

    pub fn disconnected() -> Self {
        Self {
            session: None,
            identity: String::new(),
            apply_delay: DEFAULT_APPLY_DELAY,
        }
    }

    /// Handshake over an already opened link.
    pub fn from_link(link: Box<dyn Link>, apply_delay: Duration) -> Result<Self> {
        let mut link = LineLink::new(link, "\n");
        let identity = link
            .query(commands::INST_ID)
            .context("Electronic load did not identify itself")?;
        if identity.is_empty() {
            return Err(anyhow!("Electronic load returned an empty identity"));
        }
        link.send(commands::SYSTEM_REMOTE)?;
        link.send(commands::CLEAR_STATUS)?;
        log::info!("Connected to electronic load: {identity}");

        Ok(Self {
            session: Some(Arc::new(Mutex::new(LoadSession {
                link,
                active_channel: None,
            }))),
            identity,
            apply_delay,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn with_session<T>(
        &self,
        what: &str,
        op: impl FnOnce(&mut LoadSession) -> Result<T>,
    ) -> Option<T> {
        let session = self.session.as_ref()?;
        let mut guard = session.lock();
        match op(&mut guard) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("Electronic load {what} failed: {err:#}");
                None
            }
        }
    }
}

impl InstrumentGateway for ScpiLoad {
    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn select_channel(&mut self, channel: ChannelId) -> bool {
        self.with_session("channel select", |s| s.select(channel))
            .is_some()
    }

    fn set_current(&mut self, channel: ChannelId, amps: f64) -> bool {
        let done = self
            .with_session("set current", |s| {
                s.on_channel(channel, &format!("{}{amps:.3}", commands::SET_CURR))
            })
            .is_some();
        if done && !self.apply_delay.is_zero() {
            thread::sleep(self.apply_delay);
        }
        done
    }

    fn toggle_inputs(&mut self, channels: &[ChannelId], on: bool) -> bool {
        let command = if on {
            commands::INPUT_ON
        } else {
            commands::INPUT_OFF
        };
        self.with_session("input toggle", |s| {
            for &channel in channels {
                s.on_channel(channel, command)?;
            }
            Ok(())
        })
        .is_some()
    }

    fn toggle_short_mode(&mut self, channel: ChannelId, on: bool) -> bool {
        let command = if on {
            commands::SHORT_ON
        } else {
            commands::SHORT_OFF
        };
        self.with_session("short toggle", |s| s.on_channel(channel, command))
            .is_some()
    }

    fn read_voltage(&mut self, channel: ChannelId) -> Option<f64> {
        self.with_session("voltage read", |s| {
            s.select(channel)?;
            let reply = s.link.query(commands::MEAS_VOLT)?;
            reply
                .parse::<f64>()
                .with_context(|| format!("Unparsable voltage reply {reply:?}"))
        })
    }

    fn reset(&mut self) -> bool {
        self.with_session("reset", |s| {
            s.link.send(commands::RESET)?;
            s.active_channel = None;
            Ok(())
        })
        .is_some()
    }
}
