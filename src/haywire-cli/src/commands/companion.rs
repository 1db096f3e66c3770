//! Companion lifecycle commands, driven through the guest agent

use anyhow::{Context as _, Result};
use haywire::CompanionLauncher;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::context::Context;

/// Request ids default to the current time so repeated single-shot runs
/// publish distinct sessions
fn default_request_id() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}

pub fn start(ctx: &Context, path: &str, target: Option<u32>) -> Result<()> {
    let agent = ctx.agent()?;
    let launcher = CompanionLauncher::with_path(&agent.handle, path);
    let pid = launcher.start(target).context("Failed to start companion")?;
    println!("Companion running in guest as PID {}", pid);
    if let Some(target) = target {
        println!("Camera 1 targets PID {}", target);
    }
    Ok(())
}

pub fn status(ctx: &Context, path: &str) -> Result<()> {
    let agent = ctx.agent()?;
    let reader = ctx.reader_unchecked()?;
    let launcher = CompanionLauncher::with_path(&agent.handle, path);
    let status = launcher.status(&reader)?;

    if status.is_running() {
        let pids: Vec<String> = status.pids.iter().map(u32::to_string).collect();
        println!("Companion running: PID {}", pids.join(", "));
    } else {
        println!("Companion not running");
    }
    match status.session_id {
        Some(session) if status.is_publishing() => {
            println!("Publishing session {:#x}", session);
        }
        Some(session) => println!("Backend holds session {:#x} (single-shot or stale)", session),
        None => println!("No discovery page in guest memory"),
    }
    Ok(())
}

pub fn stop(ctx: &Context, path: &str, pid: Option<u32>) -> Result<()> {
    let agent = ctx.agent()?;
    CompanionLauncher::with_path(&agent.handle, path).stop(pid)?;
    match pid {
        Some(pid) => println!("Stopped companion PID {}", pid),
        None => println!("Stopped all companions"),
    }
    Ok(())
}

pub fn oneshot(ctx: &Context, path: &str, request: Option<u32>) -> Result<()> {
    let agent = ctx.agent()?;
    let reader = ctx.reader_unchecked()?;
    let launcher = CompanionLauncher::with_path(&agent.handle, path);
    let request = request.unwrap_or_else(default_request_id);

    let found = launcher
        .ensure_discovery(&reader, request)
        .context("Single-shot companion did not publish")?;
    println!(
        "Discovery at file offset {:#x}, session {:#x}",
        found.offset,
        found.session_id()
    );
    println!(
        "{} PIDs published, {} processes detailed",
        reader.get_pid_list().len(),
        reader.get_all_process_info().len()
    );
    Ok(())
}
