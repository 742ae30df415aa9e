//! # Module: exec
//!
//! External command execution for the tuning engine.
//!
//! ## Sub-modules
//! - [`command`]: runs an argv and classifies the outcome
//! - [`breaker`]: per-category consecutive-failure circuit breaker
//! - [`hdparm`]: power-management command lines built on both

pub mod breaker;
pub mod command;
pub mod hdparm;

pub use breaker::{CircuitBreaker, CommandCategory, CounterState, DEFAULT_ERROR_THRESHOLD};
pub use command::{CommandExecutor, CommandOutcome, ScriptedExecutor, SystemExecutor};
pub use hdparm::{ApmSupport, Hdparm};
