//! CLI definitions for timekeepd.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "timekeepd",
    version,
    about = "User-space time-synchronisation daemon\n\nDisciplines the system clock against remote time sources and local reference clocks.",
    long_about = None
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground (or detached, under a service manager)
    Run {
        /// Path to the daemon's TOML configuration file
        #[clap(long, short, default_value = "/etc/timekeepd/timekeepd.toml")]
        config: PathBuf,

        /// Stay attached to the controlling terminal instead of detaching
        #[clap(long)]
        foreground: bool,
    },

    /// Generate and append a fresh symmetric authentication key to a keyfile
    Keygen {
        /// Keyfile to append the new key to (created with 0600 permissions if absent)
        #[clap(long)]
        keyfile: PathBuf,

        /// Key identifier to assign (must not already exist in the keyfile)
        #[clap(long)]
        id: u32,

        /// Secret length in bits: 128 (MD5-sized) or 160 (SHA1-sized)
        #[clap(long, default_value = "160")]
        bits: u32,
    },

    /// Manage the systemd service
    Service {
        #[clap(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
pub enum ServiceAction {
    /// Install and start the systemd unit
    Install {
        /// Config path baked into the unit's ExecStart
        #[clap(long, short, default_value = "/etc/timekeepd/timekeepd.toml")]
        config: PathBuf,
    },
    /// Stop and remove the systemd unit
    Uninstall,
}
