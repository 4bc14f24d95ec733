//! Test definition model: the immutable description of one product's test
//! sequence, loaded once before a run.

use anyhow::{anyhow, bail, Context, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fs, path::Path};

pub type ChannelId = u8;
pub type ParamId = u32;
pub type StepId = u32;

/// Most input sources a rig can route to.
pub const MAX_INPUT_SOURCES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum InputType {
    #[serde(rename = "AC", alias = "CA")]
    #[strum(serialize = "AC")]
    Ac,
    #[serde(rename = "DC", alias = "CC")]
    #[strum(serialize = "DC")]
    Dc,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    TryFromPrimitive,
    IntoPrimitive,
    strum::Display,
)]
#[repr(u8)]
#[serde(try_from = "u8", into = "u8")]
pub enum StepType {
    #[strum(serialize = "Direct Current")]
    DirectCurrent = 1,
    #[strum(serialize = "Current Limiting")]
    CurrentLimiting = 2,
    #[strum(serialize = "Automatic Short")]
    AutomaticShort = 3,
}

/// Tolerance / setpoint profile shared by steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub id: ParamId,
    #[serde(default)]
    pub tag: String,
    /// Lower voltage bound.
    pub va: f64,
    /// Upper voltage bound.
    pub vb: f64,
    /// Lower (starting) current.
    pub ia: f64,
    /// Upper current bound.
    pub ib: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLabel {
    pub id: ChannelId,
    #[serde(default)]
    pub label: String,
}

/// One participating channel of a step and the profile it is judged by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel: ChannelId,
    pub param: ParamId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub step_type: StepType,
    #[serde(default)]
    pub description: String,
    /// Seconds; 0 waits for a manual continue.
    #[serde(default)]
    pub duration: f64,
    /// Index into [`TestDefinition::input_sources`].
    #[serde(default)]
    pub input_source: usize,
    #[serde(default)]
    pub channel_params: Vec<ChannelBinding>,
}

impl Step {
    pub fn duration_ms(&self) -> u64 {
        (self.duration.max(0.0) * 1000.0).round() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub customer: String,
    pub input_type: InputType,
    #[serde(default)]
    pub input_sources: Vec<f64>,
    /// Ordered as laid out on the rig.
    #[serde(default)]
    pub channels: Vec<ChannelLabel>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl TestDefinition {
    /// Load a definition from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read test definition {}", path.display()))?;
        let definition = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&text)?,
            Some("toml") => Self::from_toml(&text)?,
            other => bail!(
                "Unsupported test definition format {:?} for {}",
                other.unwrap_or(""),
                path.display()
            ),
        };
        log::info!(
            "Loaded test definition {} / {} ({} steps, {} channels)",
            definition.group,
            definition.model,
            definition.steps.len(),
            definition.channels.len()
        );
        Ok(definition)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse JSON test definition")
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse TOML test definition")
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|channel| channel.id).collect()
    }

    pub fn param(&self, id: ParamId) -> Option<&Param> {
        self.params.iter().find(|param| param.id == id)
    }

    pub fn step_index(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|step| step.id == id)
    }

    /// Check every cross reference a run relies on.
    pub fn validate(&self) -> Result<()> {
        if self.input_sources.len() > MAX_INPUT_SOURCES {
            bail!(
                "At most {MAX_INPUT_SOURCES} input sources are supported, found {}",
                self.input_sources.len()
            );
        }

        let mut channels = HashSet::new();
        for channel in &self.channels {
            if !channels.insert(channel.id) {
                bail!("Channel {} is declared twice", channel.id);
            }
        }
        let mut params = HashSet::new();
        for param in &self.params {
            if !params.insert(param.id) {
                bail!("Param {} is declared twice", param.id);
            }
        }

        let mut steps = HashSet::new();
        for step in &self.steps {
            if !steps.insert(step.id) {
                bail!("Step {} is declared twice", step.id);
            }
            if step.input_source >= self.input_sources.len() {
                return Err(anyhow!(
                    "Step {} uses input source {} but only {} are defined",
                    step.id,
                    step.input_source,
                    self.input_sources.len()
                ));
            }
            for binding in &step.channel_params {
                if !channels.contains(&binding.channel) {
                    bail!(
                        "Step {} references unknown channel {}",
                        step.id,
                        binding.channel
                    );
                }
                if !params.contains(&binding.param) {
                    bail!("Step {} references unknown param {}", step.id, binding.param);
                }
            }
        }
        Ok(())
    }
}
