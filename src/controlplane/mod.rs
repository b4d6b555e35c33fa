//! Control Plane Module
//!
//! The orchestrator facade that owns the managers, the maintenance dispatch
//! table and the background task constructors.

pub mod orchestrator;

pub use orchestrator::*;
