/// Global `tracing` subscriber with console and rotating file output.
pub mod tracing_setup;

pub use tracing_setup::{init_tracing, LoggingError};
