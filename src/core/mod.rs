/// Rig-independent test logic
///
/// Everything here runs on the control thread except the telemetry poller,
/// which only posts refresh requests onto the command bus. Frontends talk to
/// the control thread exclusively through [`bus`].
pub mod bus;
pub mod config;
pub mod definition;
pub mod delay;
pub mod poller;
pub mod report;
pub mod runtime;
pub mod scheduler;
pub mod sequencer;
pub mod serial_number;
pub mod telemetry;

// Re-export commonly used types
pub use bus::{Bus, CoreToUi, UiToCore};
pub use config::RigConfig;
pub use definition::TestDefinition;
pub use runtime::{run_core_thread, CoreRuntimeConfig};
pub use sequencer::{Sequencer, SequencerConfig, TestState};
pub use serial_number::SerialNumber;
