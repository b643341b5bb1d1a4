//! Retro Test Harness - Session simulation and scenario validation
//!
//! This crate provides:
//! - A virtual-clock simulator driving moderators and contributors over
//!   the in-process network
//! - End-to-end session scenarios

pub mod integration;
pub mod simulator;

pub use integration::*;
pub use simulator::*;
