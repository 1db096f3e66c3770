//! haywire-companion: publishes process, section and page-table state into
//! beacon pages for the host to read out of guest RAM.

mod arena;
mod keeper;
mod procfs;
mod publisher;

use anyhow::{Context, Result};
use arena::Arena;
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use procfs::ProcFs;
use publisher::Publisher;
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CYCLE_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Parser)]
#[command(name = "haywire-companion")]
#[command(about = "Publish guest process state for haywire", long_about = None)]
struct Cli {
    /// Run one cycle into shared memory, then exit
    #[arg(long)]
    once: bool,

    /// Session id to publish instead of this process's PID (hex with 0x)
    #[arg(long, value_parser = parse_u32)]
    request: Option<u32>,

    /// Initial camera 1 target
    #[arg(long, env = "HAYWIRE_TARGET_PID")]
    target: Option<u32>,

    /// Stop after this many cycles (continuous mode)
    #[arg(long)]
    cycles: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid id {s:?}: {e}"))
}

extern "C" fn on_signal(_: c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {:?} handler", signal))?;
    }
    Ok(())
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn run_once(cli: &Cli) -> Result<()> {
    let session = cli.request.unwrap_or_else(std::process::id);
    let arena = Arena::shared(session, now_secs())?;
    let mut publisher = Publisher::new(arena, ProcFs::default());
    if let Some(pid) = cli.target {
        publisher.set_initial_target(pid);
    }

    let stats = publisher.cycle();
    publisher.arena().flush()?;
    info!(
        "Single cycle complete: session {:#x}, {} processes",
        session, stats.pids
    );

    let arena = publisher.into_arena();
    if arena.created() {
        let keeper = keeper::spawn(arena)?;
        info!("Keeper started as PID {}", keeper);
    }
    Ok(())
}

fn run_continuous(cli: &Cli) -> Result<()> {
    install_signal_handlers()?;
    let session = std::process::id();
    let arena = Arena::anonymous(session, now_secs())?;
    let mut publisher = Publisher::new(arena, ProcFs::default());
    publisher.set_initial_target(cli.target.unwrap_or(1));
    info!("Companion publishing as session {:#x}", session);

    let mut completed = 0u64;
    while RUNNING.load(Ordering::SeqCst) {
        let stats = publisher.cycle();
        completed += 1;
        debug!("Cycle {}: {:?}", completed, stats);
        if cli.cycles.is_some_and(|n| completed >= n) {
            break;
        }

        let mut waited = Duration::ZERO;
        while waited < CYCLE_INTERVAL && RUNNING.load(Ordering::SeqCst) {
            thread::sleep(SHUTDOWN_POLL);
            waited += SHUTDOWN_POLL;
        }
    }
    info!("Shutting down after {} cycles", completed);
    Ok(())
}

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

    if cli.once {
        run_once(&cli)
    } else {
        run_continuous(&cli)
    }
}
