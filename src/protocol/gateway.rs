/// Hardware gateway traits - the only way the sequencer touches the rig
///
/// Gateways absorb transport failures at their own boundary: a lost
/// connection or a garbled reply is logged by the implementation and surfaces
/// to the caller as a sentinel (`false` / `None`), never as a panic or error.
use strum::{AsRefStr, Display};

use crate::core::definition::{ChannelId, InputType};

/// Electronic load with independently switchable channels.
pub trait InstrumentGateway: Send {
    /// Whether the instrument answered when the link was opened.
    fn is_connected(&self) -> bool;

    /// Make `channel` the target of subsequent channel commands.
    fn select_channel(&mut self, channel: ChannelId) -> bool;

    /// Command a constant-current load level on `channel`.
    fn set_current(&mut self, channel: ChannelId, amps: f64) -> bool;

    /// Switch the inputs of every listed channel on or off.
    fn toggle_inputs(&mut self, channels: &[ChannelId], on: bool) -> bool;

    /// Engage or release short-circuit mode on `channel`.
    fn toggle_short_mode(&mut self, channel: ChannelId, on: bool) -> bool;

    /// Measure the voltage present on `channel`.
    fn read_voltage(&mut self, channel: ChannelId) -> Option<f64>;

    /// Return the instrument to its power-on state.
    fn reset(&mut self) -> bool;
}

/// Relay board routing input sources to the unit under test.
pub trait RelayGateway: Send {
    fn is_connected(&self) -> bool;

    /// Route input source `source` (0-based) of the given type. Selecting the
    /// route that is already active does nothing.
    fn select_route(&mut self, source: usize, input_type: InputType) -> bool;

    /// Drop whatever route is active.
    fn release_route(&mut self) -> bool;

    /// Pulse the operator alert buzzer.
    fn sound_alert(&mut self) -> bool;
}

/// Which side of the rig a gateway drives, used in log and refusal messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum GatewayKind {
    #[strum(serialize = "electronic load")]
    Instrument,
    #[strum(serialize = "relay board")]
    Relay,
}

/// Instrument placeholder used when no load is attached.
pub struct DisconnectedInstrument;

impl InstrumentGateway for DisconnectedInstrument {
    fn is_connected(&self) -> bool {
        false
    }

    fn select_channel(&mut self, _: ChannelId) -> bool {
        false
    }

    fn set_current(&mut self, _: ChannelId, _: f64) -> bool {
        false
    }

    fn toggle_inputs(&mut self, _: &[ChannelId], _: bool) -> bool {
        false
    }

    fn toggle_short_mode(&mut self, _: ChannelId, _: bool) -> bool {
        false
    }

    fn read_voltage(&mut self, _: ChannelId) -> Option<f64> {
        None
    }

    fn reset(&mut self) -> bool {
        false
    }
}

/// Relay placeholder used when no board is attached.
pub struct DisconnectedRelay;

impl RelayGateway for DisconnectedRelay {
    fn is_connected(&self) -> bool {
        false
    }

    fn select_route(&mut self, _: usize, _: InputType) -> bool {
        false
    }

    fn release_route(&mut self) -> bool {
        false
    }

    fn sound_alert(&mut self) -> bool {
        false
    }
}
