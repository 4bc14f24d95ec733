use flume::{Receiver, Sender};
use std::{path::PathBuf, time::Duration};

use super::{
    definition::{ChannelId, StepId},
    sequencer::TestState,
    serial_number::SerialNumber,
    telemetry::Reading,
};

/// Messages sent from the frontend to the control thread.
#[derive(Debug, Clone, PartialEq)]
pub enum UiToCore {
    /// Start a full run. `None` keeps the current serial number.
    Start {
        serial_number: Option<SerialNumber>,
        tester_id: String,
    },
    /// Run exactly one step of the loaded definition.
    StartSingle {
        step_id: StepId,
        serial_number: Option<SerialNumber>,
        tester_id: String,
    },
    /// Pause a running countdown, or resume a paused one.
    TogglePause,
    /// Acknowledge a step waiting for the operator.
    Continue,
    Cancel,
    /// Read every channel's voltage. Sent by the telemetry poller.
    RefreshTelemetry,
    /// Graceful shutdown request.
    Quit,
}

/// Messages sent from the control thread back to the frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreToUi {
    StateChanged(TestState),
    SerialNumberUpdated(SerialNumber),
    StepChanged {
        description: String,
        duration: Duration,
        index: usize,
        total: usize,
    },
    /// Milliseconds left on the step countdown.
    DelayRemaining(u64),
    ResultTextReady(String),
    ChannelBounds {
        channel_id: ChannelId,
        lower: f64,
        upper: f64,
    },
    Telemetry {
        channel_id: ChannelId,
        reading: Reading,
    },
    ReportSaved(PathBuf),
    /// A request was refused or a background operation failed.
    Error(String),
    /// Control thread is shutting down.
    Quit,
}

/// Frontend-side ends of the two channels.
#[derive(Debug, Clone)]
pub struct Bus {
    pub core_rx: Receiver<CoreToUi>,
    pub ui_tx: Sender<UiToCore>,
}

impl Bus {
    pub fn new(core_rx: Receiver<CoreToUi>, ui_tx: Sender<UiToCore>) -> Self {
        Self { core_rx, ui_tx }
    }
}
