pub mod constants;
pub use constants::*;

pub mod tracing_telemetry;

pub mod version;
