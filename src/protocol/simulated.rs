//! In-process stand-ins for the electronic load and relay board.
//!
//! Both record every command they receive and share their state through a
//! cloneable handle, so a test (or the `--simulate` frontend) keeps one clone
//! for inspection while the sequencer owns the other.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use super::gateway::{InstrumentGateway, RelayGateway};
use crate::core::definition::{ChannelId, InputType, TestDefinition};

#[derive(Debug, Clone, PartialEq)]
pub enum LoadCommand {
    SelectChannel(ChannelId),
    SetCurrent(ChannelId, f64),
    Inputs(Vec<ChannelId>, bool),
    Short(ChannelId, bool),
    ReadVoltage(ChannelId),
    Reset,
}

/// Most recent load commands kept for inspection. The poller reads every
/// channel many times a second, so older entries are dropped.
pub const COMMAND_HISTORY: usize = 4096;

/// Electrical state of one simulated channel, as commanded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelState {
    pub load: f64,
    pub input_on: bool,
    pub short: bool,
}

/// Voltage the unit under test presents on a channel in a given state.
pub type VoltageModel = Box<dyn FnMut(ChannelId, &ChannelState) -> f64 + Send>;

struct LoadState {
    connected: bool,
    channels: HashMap<ChannelId, ChannelState>,
    commands: VecDeque<LoadCommand>,
    model: VoltageModel,
}

#[derive(Clone)]
pub struct SimulatedLoad {
    state: Arc<Mutex<LoadState>>,
}

impl SimulatedLoad {
    pub fn new(model: impl FnMut(ChannelId, &ChannelState) -> f64 + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoadState {
                connected: true,
                channels: HashMap::new(),
                commands: VecDeque::new(),
                model: Box::new(model),
            })),
        }
    }

    /// Every channel always reads `voltage`.
    pub fn constant(voltage: f64) -> Self {
        Self::new(move |_, _| voltage)
    }

    /// A supply that holds `nominal` volts, collapses to zero while shorted,
    /// and folds back to zero when loaded beyond `current_limit`.
    pub fn power_supply(nominal: f64, current_limit: f64) -> Self {
        Self::new(move |_, state| {
            if state.short || state.load > current_limit + 1e-9 {
                0.0
            } else {
                nominal
            }
        })
    }

    /// A healthy unit for `definition`: each channel sits mid-band of the
    /// first param bound to it and folds back halfway between `ia` and `ib`.
    pub fn for_definition(definition: &TestDefinition) -> Self {
        let mut rails: HashMap<ChannelId, (f64, f64)> = HashMap::new();
        for step in &definition.steps {
            for binding in &step.channel_params {
                if let Some(param) = definition.param(binding.param) {
                    rails.entry(binding.channel).or_insert((
                        (param.va + param.vb) / 2.0,
                        (param.ia + param.ib) / 2.0,
                    ));
                }
            }
        }
        Self::new(move |channel, state| match rails.get(&channel) {
            Some(&(nominal, limit)) if !state.short && state.load <= limit => nominal,
            _ => 0.0,
        })
    }

    pub fn set_model(&self, model: impl FnMut(ChannelId, &ChannelState) -> f64 + Send + 'static) {
        self.state.lock().model = Box::new(model);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Recorded commands, oldest first, up to [`COMMAND_HISTORY`].
    pub fn commands(&self) -> Vec<LoadCommand> {
        self.state.lock().commands.iter().cloned().collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn channel(&self, channel: ChannelId) -> ChannelState {
        self.state
            .lock()
            .channels
            .get(&channel)
            .copied()
            .unwrap_or_default()
    }

    fn apply(&self, command: LoadCommand) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }
        match &command {
            LoadCommand::SetCurrent(channel, amps) => {
                state.channels.entry(*channel).or_default().load = *amps;
            }
            LoadCommand::Inputs(channels, on) => {
                for channel in channels {
                    state.channels.entry(*channel).or_default().input_on = *on;
                }
            }
            LoadCommand::Short(channel, on) => {
                state.channels.entry(*channel).or_default().short = *on;
            }
            LoadCommand::Reset => {
                for channel in state.channels.values_mut() {
                    *channel = ChannelState::default();
                }
            }
            LoadCommand::SelectChannel(_) | LoadCommand::ReadVoltage(_) => {}
        }
        if state.commands.len() == COMMAND_HISTORY {
            state.commands.pop_front();
        }
        state.commands.push_back(command);
        true
    }
}

impl InstrumentGateway for SimulatedLoad {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn select_channel(&mut self, channel: ChannelId) -> bool {
        self.apply(LoadCommand::SelectChannel(channel))
    }

    fn set_current(&mut self, channel: ChannelId, amps: f64) -> bool {
        self.apply(LoadCommand::SetCurrent(channel, amps))
    }

    fn toggle_inputs(&mut self, channels: &[ChannelId], on: bool) -> bool {
        self.apply(LoadCommand::Inputs(channels.to_vec(), on))
    }

    fn toggle_short_mode(&mut self, channel: ChannelId, on: bool) -> bool {
        self.apply(LoadCommand::Short(channel, on))
    }

    fn read_voltage(&mut self, channel: ChannelId) -> Option<f64> {
        if !self.apply(LoadCommand::ReadVoltage(channel)) {
            return None;
        }
        let mut state = self.state.lock();
        let snapshot = state.channels.get(&channel).copied().unwrap_or_default();
        Some((state.model)(channel, &snapshot))
    }

    fn reset(&mut self) -> bool {
        self.apply(LoadCommand::Reset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayCommand {
    SelectRoute(usize, InputType),
    Release,
    Alert,
}

#[derive(Default)]
struct RelayState {
    connected: bool,
    active: Option<(usize, InputType)>,
    commands: Vec<RelayCommand>,
}

#[derive(Clone)]
pub struct SimulatedRelay {
    state: Arc<Mutex<RelayState>>,
}

impl Default for SimulatedRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                connected: true,
                ..RelayState::default()
            })),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn active_route(&self) -> Option<(usize, InputType)> {
        self.state.lock().active
    }

    pub fn commands(&self) -> Vec<RelayCommand> {
        self.state.lock().commands.clone()
    }
}

impl RelayGateway for SimulatedRelay {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn select_route(&mut self, source: usize, input_type: InputType) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }
        if state.active != Some((source, input_type)) {
            state.active = Some((source, input_type));
            state
                .commands
                .push(RelayCommand::SelectRoute(source, input_type));
        }
        true
    }

    fn release_route(&mut self) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }
        state.active = None;
        state.commands.push(RelayCommand::Release);
        true
    }

    fn sound_alert(&mut self) -> bool {
        let mut state = self.state.lock();
        if !state.connected {
            return false;
        }
        state.commands.push(RelayCommand::Alert);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_supply_model_collapses_when_shorted_or_overloaded() {
        let load = SimulatedLoad::power_supply(12.0, 1.5);
        let mut gateway = load.clone();

        gateway.set_current(1, 1.5);
        assert_eq!(gateway.read_voltage(1), Some(12.0));
        gateway.set_current(1, 1.51);
        assert_eq!(gateway.read_voltage(1), Some(0.0));
        gateway.set_current(1, 1.0);
        gateway.toggle_short_mode(1, true);
        assert_eq!(gateway.read_voltage(1), Some(0.0));
        gateway.reset();
        assert_eq!(load.channel(1), ChannelState::default());
        assert_eq!(gateway.read_voltage(1), Some(12.0));
    }

    #[test]
    fn definition_twin_sits_mid_band() -> anyhow::Result<()> {
        let definition = TestDefinition::from_toml(
            r#"
            input_type = "DC"
            input_sources = [24.0]
            channels = [{ id = 2 }]
            params = [{ id = 1, va = 10.0, vb = 12.0, ia = 1.0, ib = 2.0 }]

            [[steps]]
            id = 1
            step_type = 2
            channel_params = [{ channel = 2, param = 1 }]
            "#,
        )?;
        let mut load = SimulatedLoad::for_definition(&definition);
        load.set_current(2, 1.5);
        assert_eq!(load.read_voltage(2), Some(11.0));
        load.set_current(2, 1.51);
        assert_eq!(load.read_voltage(2), Some(0.0));
        assert_eq!(load.read_voltage(9), Some(0.0));
        Ok(())
    }

    #[test]
    fn disconnected_load_records_nothing() {
        let load = SimulatedLoad::constant(5.0);
        load.set_connected(false);
        let mut gateway = load.clone();
        assert!(!gateway.set_current(1, 1.0));
        assert_eq!(gateway.read_voltage(1), None);
        assert!(load.commands().is_empty());
    }

    #[test]
    fn command_history_keeps_the_most_recent() {
        let load = SimulatedLoad::constant(5.0);
        let mut gateway = load.clone();
        gateway.set_current(1, 1.0);
        for _ in 0..COMMAND_HISTORY {
            gateway.read_voltage(1);
        }
        gateway.set_current(1, 2.0);

        let commands = load.commands();
        assert_eq!(commands.len(), COMMAND_HISTORY);
        assert_eq!(commands[0], LoadCommand::ReadVoltage(1));
        assert_eq!(commands.last(), Some(&LoadCommand::SetCurrent(1, 2.0)));
    }

    #[test]
    fn relay_records_only_route_changes() {
        let relay = SimulatedRelay::new();
        let mut gateway = relay.clone();
        gateway.select_route(0, InputType::Ac);
        gateway.select_route(0, InputType::Ac);
        gateway.select_route(1, InputType::Ac);
        gateway.release_route();
        assert_eq!(
            relay.commands(),
            vec![
                RelayCommand::SelectRoute(0, InputType::Ac),
                RelayCommand::SelectRoute(1, InputType::Ac),
                RelayCommand::Release,
            ]
        );
        assert_eq!(relay.active_route(), None);
    }
}
