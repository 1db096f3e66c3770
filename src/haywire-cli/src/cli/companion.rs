//! Companion lifecycle CLI definitions

use clap::Subcommand;

#[derive(Subcommand)]
pub enum CompanionCommand {
    /// Start the continuous companion in the guest
    Start {
        /// Initial camera 1 target
        #[arg(short, long)]
        target: Option<u32>,
    },

    /// Show running companions and the published session
    Status,

    /// Stop the companion
    Stop {
        /// Guest PID to stop (all companions if omitted)
        pid: Option<u32>,
    },

    /// Run one single-shot cycle and wait for its discovery page
    Oneshot {
        /// Session id to request (defaults to the current time)
        #[arg(long)]
        request: Option<u32>,
    },
}
