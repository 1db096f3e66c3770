mod cli;
mod commands;
mod context;
mod dispatch;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::*;
use context::Context;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let ctx = Context::from_cli(&cli);

    match cli.command {
        Commands::Discover => commands::beacon::discover(&ctx)?,

        Commands::Pids { generations } => commands::beacon::pids(&ctx, generations)?,

        Commands::Ps { json } => commands::beacon::ps(&ctx, json)?,

        Commands::Sections { pid, json } => commands::beacon::sections(&ctx, pid, json)?,

        Commands::Ptes { pid, camera, limit } => {
            commands::beacon::ptes(&ctx, camera, pid, limit)?;
        }

        Commands::Focus {
            pid,
            camera,
            no_wait,
        } => commands::beacon::focus(&ctx, camera, pid, !no_wait)?,

        Commands::Translate { pid, va, via } => commands::memory::translate(&ctx, pid, va, via)?,

        Commands::Read { address, size } => commands::memory::read(&ctx, address, size)?,

        Commands::Crunch {
            pid,
            offset,
            size,
            via,
        } => commands::memory::crunch(&ctx, pid, offset, size, via)?,

        Commands::Flat { pid, via } => commands::memory::flat(&ctx, pid, via)?,

        Commands::Watch { interval, count } => commands::beacon::watch(&ctx, interval, count)?,

        Commands::Agent { command } => dispatch::dispatch_agent(&ctx, command)?,

        Commands::Companion { path, command } => {
            dispatch::dispatch_companion(&ctx, &path, command)?;
        }

        Commands::Monitor { command } => dispatch::dispatch_monitor(&ctx, command)?,
    }

    Ok(())
}
