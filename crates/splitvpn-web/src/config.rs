//! CLI surface (spec §6 "CLI").

use std::path::PathBuf;

use clap::Parser;

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "split-vpn-webui", version = CURRENT_VERSION)]
pub struct Cli {
    /// Bind address. When loopback, the server resolves the LAN IPv4 and
    /// rebinds to it (spec §6).
    #[arg(long, default_value = "127.0.0.1:8091")]
    pub addr: String,

    #[arg(long, default_value = "/data/split-vpn-webui")]
    pub data_dir: PathBuf,

    /// Override the SQLite database path (defaults to `<data-dir>/stats.db`).
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Stats collector poll interval, seconds.
    #[arg(long, default_value_t = 2)]
    pub poll: u64,

    /// Stats collector rolling history length.
    #[arg(long, default_value_t = 120)]
    pub history: usize,

    /// Latency prober interval, seconds.
    #[arg(long = "latency-interval", default_value_t = 30)]
    pub latency_interval: u64,

    /// Drive unit lifecycle through systemd instead of the no-op controller.
    #[arg(long)]
    pub systemd: bool,

    /// Print the version and exit.
    #[arg(long)]
    pub version: bool,

    /// Print the version as JSON and exit.
    #[arg(long = "version-json")]
    pub version_json: bool,

    /// Internal re-exec entrypoint used by the updater after staging a new
    /// binary (spec §6); not meant to be invoked directly by operators.
    #[arg(long = "self-update-run", hide = true)]
    pub self_update_run: bool,
}
