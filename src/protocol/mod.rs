pub mod gateway;
pub mod link;
pub mod pins;
pub mod scpi;
pub mod simulated;

pub use gateway::{InstrumentGateway, RelayGateway};
