//! Core CLI definitions

use clap::{Parser, Subcommand};
use haywire::agent::DEFAULT_AGENT_SOCKET;
use std::path::PathBuf;

use super::agent::AgentCommand;
use super::companion::CompanionCommand;
use super::monitor::MonitorCommand;

/// Parse a hex (0x-prefixed) or decimal number
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

/// Where virtual-to-physical translations come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Via {
    /// PTEs streamed by the companion's camera
    #[default]
    Beacon,
    /// Pagemap reads through the guest agent
    Agent,
}

#[derive(Parser)]
#[command(name = "haywire")]
#[command(about = "Live memory introspection for QEMU guests", long_about = None)]
pub struct Cli {
    /// Guest RAM file (auto-detected when omitted)
    #[arg(long, env = "HAYWIRE_MEMORY", global = true)]
    pub memory: Option<PathBuf>,

    /// Guest agent socket
    #[arg(long, env = "HAYWIRE_QGA_SOCKET", default_value = DEFAULT_AGENT_SOCKET, global = true)]
    pub agent: PathBuf,

    /// Guest physical address of the first byte of the RAM file
    #[arg(long, env = "HAYWIRE_RAM_BASE", default_value = "0", value_parser = parse_u64, global = true)]
    pub ram_base: u64,

    /// QMP monitor address (host:port)
    #[arg(long, env = "HAYWIRE_QMP", global = true)]
    pub qmp: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Locate the companion's discovery page and show category health
    #[command(visible_alias = "d")]
    Discover,

    /// Print the newest published PID list
    Pids {
        /// Show every generation found instead
        #[arg(long)]
        generations: bool,
    },

    /// List processes detailed by the companion
    Ps {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a process's sections
    Sections {
        /// Guest process ID
        pid: u32,

        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the PTEs a camera captured for a process
    Ptes {
        /// Guest process ID
        pid: u32,

        /// Camera (1 or 2)
        #[arg(short, long, default_value = "1")]
        camera: u8,

        /// Maximum entries to print
        #[arg(short, long, default_value = "64")]
        limit: usize,
    },

    /// Point a camera at a process
    Focus {
        /// Guest process ID
        pid: u32,

        /// Camera (1 or 2)
        #[arg(short, long, default_value = "1")]
        camera: u8,

        /// Return without waiting for the companion to adopt it
        #[arg(long)]
        no_wait: bool,
    },

    /// Translate a virtual address
    #[command(visible_alias = "t")]
    Translate {
        /// Guest process ID
        pid: u32,

        /// Virtual address (hex with 0x)
        #[arg(value_parser = parse_u64)]
        va: u64,

        /// Translation source
        #[arg(long, value_enum, default_value_t)]
        via: Via,
    },

    /// Hex dump guest physical memory
    #[command(visible_alias = "r")]
    Read {
        /// Guest physical address (hex with 0x)
        #[arg(value_parser = parse_u64)]
        address: u64,

        /// Bytes to read
        #[arg(short, long, default_value = "256", value_parser = parse_u64)]
        size: u64,
    },

    /// Hex dump a process's flattened address space
    Crunch {
        /// Guest process ID
        pid: u32,

        /// Flat offset (hex with 0x)
        #[arg(short, long, default_value = "0", value_parser = parse_u64)]
        offset: u64,

        /// Bytes to read
        #[arg(short, long, default_value = "256", value_parser = parse_u64)]
        size: u64,

        /// Translation source
        #[arg(long, value_enum, default_value_t)]
        via: Via,
    },

    /// Show a process's flat layout, navigation hints and compression
    Flat {
        /// Guest process ID
        pid: u32,

        /// Where the memory map comes from
        #[arg(long, value_enum, default_value_t)]
        via: Via,
    },

    /// Refresh in the background and print beacon status
    #[command(visible_alias = "w")]
    Watch {
        /// Seconds between status lines
        #[arg(short, long, default_value = "2")]
        interval: u64,

        /// Stop after this many lines
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },

    /// Guest agent operations
    #[command(visible_alias = "a")]
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Companion lifecycle through the guest agent
    #[command(visible_alias = "c")]
    Companion {
        /// Companion binary inside the guest
        #[arg(long, default_value = haywire::reader::DEFAULT_COMPANION_PATH, global = true)]
        path: String,

        #[command(subcommand)]
        command: CompanionCommand,
    },

    /// Hypervisor monitor queries
    #[command(visible_alias = "m")]
    Monitor {
        #[command(subcommand)]
        command: MonitorCommand,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("0x4000_0000").unwrap(), 0x4000_0000);
        assert_eq!(parse_u64("0X10").unwrap(), 16);
        assert_eq!(parse_u64("4096").unwrap(), 4096);
        assert!(parse_u64("0xnope").is_err());
        assert!(parse_u64("").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "haywire",
            "crunch",
            "42",
            "--size",
            "0x20",
            "--memory",
            "/dev/shm/vm-mem",
            "--ram-base",
            "0x40000000",
            "--via",
            "agent",
        ]);
        assert_eq!(cli.memory, Some(PathBuf::from("/dev/shm/vm-mem")));
        assert_eq!(cli.ram_base, 0x4000_0000);
        match cli.command {
            Commands::Crunch {
                pid,
                offset,
                size,
                via,
            } => {
                assert_eq!((pid, offset, size), (42, 0, 0x20));
                assert_eq!(via, Via::Agent);
            }
            _ => panic!("expected crunch"),
        }
    }

    #[test]
    fn test_nested_subcommands() {
        let cli = Cli::parse_from(["haywire", "agent", "pagemap", "7", "0x400000", "-p", "4"]);
        assert!(matches!(
            cli.command,
            Commands::Agent {
                command: AgentCommand::Pagemap {
                    pid: 7,
                    va: 0x40_0000,
                    pages: 4
                }
            }
        ));

        let cli = Cli::parse_from(["haywire", "companion", "stop", "12"]);
        assert!(matches!(
            cli.command,
            Commands::Companion {
                command: CompanionCommand::Stop { pid: Some(12) },
                ..
            }
        ));
    }
}
