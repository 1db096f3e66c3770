//! Hypervisor monitor command CLI definitions

use super::core::parse_u64;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum MonitorCommand {
    /// Show the guest RAM ranges from `info mtree -f`
    Mtree {
        /// Print the raw monitor output as well
        #[arg(long)]
        raw: bool,
    },

    /// Dump guest physical memory to a file on the host
    Pmemsave {
        /// Guest physical address (hex with 0x)
        #[arg(value_parser = parse_u64)]
        gpa: u64,

        /// Bytes to dump
        #[arg(value_parser = parse_u64)]
        size: u64,

        /// Output path (as seen by the hypervisor)
        output: String,
    },
}
