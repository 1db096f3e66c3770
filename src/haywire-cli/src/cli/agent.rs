//! Guest-agent command CLI definitions

use super::core::parse_u64;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Check that the guest agent answers
    Ping,

    /// List guest processes by memory use
    Ps {
        /// Maximum number of processes to show
        #[arg(short, long, default_value = "30")]
        limit: usize,

        /// Only show user applications
        #[arg(long)]
        apps: bool,
    },

    /// Show a process's memory map
    Maps {
        /// Guest process ID
        pid: u32,
    },

    /// Decode pagemap entries for a virtual range
    Pagemap {
        /// Guest process ID
        pid: u32,

        /// Start virtual address (hex with 0x)
        #[arg(value_parser = parse_u64)]
        va: u64,

        /// Number of pages
        #[arg(short, long, default_value = "16")]
        pages: u64,
    },
}
