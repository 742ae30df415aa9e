//! # Module: tuning
//!
//! Feedback-driven power-level selection.
//!
//! ## Sub-modules
//! - [`controller`]: per-device hysteretic level state machine

pub mod controller;

pub use controller::{
    decide, ControllerConfig, DeviceTuning, DriveControl, IdleCounters, LevelChange, LevelTables,
    LoadStats, SampleVector,
};
