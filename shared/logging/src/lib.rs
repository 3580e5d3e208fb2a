mod gate;
mod logging;

pub use gate::{gate_filter, OutputGate};
pub use logging::{logging, LogOutput, LoggingBuilder};
