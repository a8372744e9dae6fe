//! Generic administrative processes.

pub mod process;

pub use process::{GenericProcess, ProcessState, process_graph};
