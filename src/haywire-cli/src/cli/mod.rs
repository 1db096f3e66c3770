//! CLI argument definitions for haywire
//!
//! This module contains all clap-derived structs and enums for CLI parsing.

mod agent;
mod companion;
mod core;
mod monitor;

pub use agent::AgentCommand;
pub use companion::CompanionCommand;
pub use core::{parse_u64, Cli, Commands, Via};
pub use monitor::MonitorCommand;
