//! Command handlers for the haywire CLI
//!
//! Each subcommand group has its own module with handler functions.

pub mod agent;
pub mod beacon;
pub mod companion;
pub mod memory;
pub mod monitor;
