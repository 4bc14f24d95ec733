use serde::{Deserialize, Serialize};

use crate::core::definition::{ChannelId, StepId, StepType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectCurrentOutcome {
    pub channel_id: ChannelId,
    pub load: f64,
    pub lower_voltage: f64,
    pub upper_voltage: f64,
    pub outcome_voltage: f64,
    pub power: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentLimitOutcome {
    pub channel_id: ChannelId,
    pub under_voltage: f64,
    pub load_upper: f64,
    pub load_lower: f64,
    /// Load at which the output dropped below `under_voltage`.
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortOutcome {
    pub channel_id: ChannelId,
    pub voltage_ref: f64,
    pub shutdown: bool,
    pub recovery: bool,
    pub load: f64,
}

/// Per-channel records of one step, shaped by the step's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "channels", rename_all = "snake_case")]
pub enum ChannelResults {
    DirectCurrent(Vec<DirectCurrentOutcome>),
    CurrentLimiting(Vec<CurrentLimitOutcome>),
    AutomaticShort(Vec<ShortOutcome>),
}

impl ChannelResults {
    pub fn step_type(&self) -> StepType {
        match self {
            ChannelResults::DirectCurrent(_) => StepType::DirectCurrent,
            ChannelResults::CurrentLimiting(_) => StepType::CurrentLimiting,
            ChannelResults::AutomaticShort(_) => StepType::AutomaticShort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub description: String,
    pub passed: bool,
    pub channels: ChannelResults,
}

impl StepResult {
    pub fn step_type(&self) -> StepType {
        self.channels.step_type()
    }
}
