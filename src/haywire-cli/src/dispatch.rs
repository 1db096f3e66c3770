//! Command dispatch functions
//!
//! Nested subcommand groups are dispatched here to keep `main` flat.

use anyhow::Result;

use crate::cli::*;
use crate::commands;
use crate::context::Context;

/// Dispatch guest agent subcommands
pub fn dispatch_agent(ctx: &Context, command: AgentCommand) -> Result<()> {
    match command {
        AgentCommand::Ping => commands::agent::ping(ctx),
        AgentCommand::Ps { limit, apps } => commands::agent::ps(ctx, limit, apps),
        AgentCommand::Maps { pid } => commands::agent::maps(ctx, pid),
        AgentCommand::Pagemap { pid, va, pages } => commands::agent::pagemap(ctx, pid, va, pages),
    }
}

/// Dispatch companion lifecycle subcommands
pub fn dispatch_companion(ctx: &Context, path: &str, command: CompanionCommand) -> Result<()> {
    match command {
        CompanionCommand::Start { target } => commands::companion::start(ctx, path, target),
        CompanionCommand::Status => commands::companion::status(ctx, path),
        CompanionCommand::Stop { pid } => commands::companion::stop(ctx, path, pid),
        CompanionCommand::Oneshot { request } => commands::companion::oneshot(ctx, path, request),
    }
}

/// Dispatch hypervisor monitor subcommands
pub fn dispatch_monitor(ctx: &Context, command: MonitorCommand) -> Result<()> {
    match command {
        MonitorCommand::Mtree { raw } => commands::monitor::mtree(ctx, raw),
        MonitorCommand::Pmemsave { gpa, size, output } => {
            commands::monitor::pmemsave(ctx, gpa, size, &output)
        }
    }
}
