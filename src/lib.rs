//! psu_bench - bench power-supply validation rig controller
//!
//! Drives an electronic load (SCPI over serial) and a relay board (digital
//! pin commands over serial) through a scripted sequence of direct-current,
//! current-limiting and short-circuit steps, judges every channel against its
//! tolerance band and renders a pass/fail report.
//!
//! The [`core`] module holds the sequencer and its runtime, [`protocol`] the
//! hardware gateways (real and simulated). The console frontend used by the
//! `psu_bench` binary lives in a hidden module.

#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod protocol;
