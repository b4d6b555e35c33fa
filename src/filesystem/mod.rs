//! Filesystem Tool Module
//!
//! Argument-vector builders for the btrfs toolchain and parsers for the
//! reports it prints.

pub mod btrfs;
pub mod report;

pub use btrfs::*;
pub use report::*;
