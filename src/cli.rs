use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// streamscope: reconstruct TCP/UDP flows from packet captures
#[derive(Parser, Debug)]
#[command(name = "streamscope", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// BPF filter expression (e.g., "tcp port 80", "host 192.168.1.1")
    #[arg(short, long, global = true, env = "BPF")]
    pub filter: Option<String>,

    /// Flag regular expression; matching flows are tagged flag-in / flag-out
    #[arg(long, global = true, env = "FLAG_REGEX")]
    pub flag_regex: Option<String>,

    /// Drop TCP segments that violate connection state expectations
    #[arg(long, global = true)]
    pub strict: bool,

    /// Directory for flow files
    #[arg(long, global = true)]
    pub flow_dir: Option<PathBuf>,

    /// Directory for the processed-file ledger and flow summaries
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List available network interfaces and exit
    #[arg(short, long)]
    pub list_interfaces: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process capture files and exit
    Offline {
        /// pcap / pcapng files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Process capture files as they appear in a directory
    Watch {
        /// Directory to watch (defaults to [watch] dir)
        dir: Option<PathBuf>,

        /// Number of file workers (0 = half the cores, at most 8)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Capture from interfaces in rounds
    Live {
        /// Interface to capture on; all interfaces when omitted
        #[arg(short, long)]
        interface: Option<String>,

        /// Round length in seconds
        #[arg(short, long)]
        round_secs: Option<u64>,

        /// Snapshot length (max bytes per packet to capture)
        #[arg(short, long)]
        snaplen: Option<i32>,

        /// Capture without promiscuous mode
        #[arg(long)]
        no_promiscuous: bool,

        /// Move finished round files into this directory
        #[arg(long)]
        spool_dir: Option<PathBuf>,
    },
}
