use serde::{Deserialize, Serialize};

use super::definition::ChannelId;

/// Snapshot of a channel's last-known electrical values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Last-known telemetry for one physical load channel.
///
/// Voltage is written by the telemetry refresh path, current by the sequencer
/// when it commands a load level. Power is always derived from the two.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryChannel {
    channel_id: ChannelId,
    voltage: f64,
    current: f64,
    power: f64,
}

impl TelemetryChannel {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Update whichever values are provided (`None` keeps the previous one)
    /// and recompute power.
    pub fn set(&mut self, voltage: Option<f64>, current: Option<f64>) -> Reading {
        if let Some(voltage) = voltage {
            self.voltage = voltage;
        }
        if let Some(current) = current {
            self.current = current;
        }
        self.power = self.voltage * self.current;
        self.read()
    }

    pub fn read(&self) -> Reading {
        Reading {
            voltage: self.voltage,
            current: self.current,
            power: self.power,
        }
    }
}
