pub mod commands;
pub mod port;
pub mod reader;

pub use commands::{RadioParams, ABORT_COMMAND};
pub use port::{MemoryPort, MemoryPortHandle, RadioPort, SerialDevice};
pub use reader::SerialLinkReader;
