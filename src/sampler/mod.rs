//! Sampler Module
//!
//! Periodic, append-only collection of pool, share and host usage.

pub mod host;
pub mod usage;

pub use host::*;
pub use usage::*;
