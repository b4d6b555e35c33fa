//! Command Executor Module
//!
//! Runs external filesystem tools as argument vectors, captures their output
//! and classifies failures. Long-running tools are launched as supervised
//! processes owned by the maintenance orchestrators.

pub mod command;
pub mod process;

pub use command::*;
pub use process::*;
