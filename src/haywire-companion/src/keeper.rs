//! Keeper process for single-shot mode.
//!
//! The first single-shot invocation forks a detached child that holds the
//! shared-memory mapping so the guest kernel never reclaims its pages.

use crate::arena::Arena;
use anyhow::{Context, Result};
use nix::unistd::{close, fork, setsid, ForkResult, Pid};
use std::thread;
use std::time::Duration;

const KEEPER_NAP: Duration = Duration::from_secs(86_400);

/// Fork the keeper. Returns its PID in the parent; never returns in the
/// child.
pub fn spawn(arena: Arena) -> Result<Pid> {
    // SAFETY: the companion is single-threaded, and the child only calls
    // async-signal-safe functions before parking.
    match unsafe { fork() }.context("Failed to fork keeper")? {
        // Unmapping here leaves the object and the child's mapping intact
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let _ = setsid();
            for fd in 0..3 {
                let _ = close(fd);
            }
            let _arena = arena;
            loop {
                thread::sleep(KEEPER_NAP);
            }
        }
    }
}
