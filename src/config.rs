//! Configuration for the depot servers.
//!
//! CLI arguments take precedence over environment variables, which take
//! precedence over the defaults.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub(crate) const DEFAULT_TCP_BIND: &str = "0.0.0.0:8000";
pub(crate) const DEFAULT_HTTP_BIND: &str = "0.0.0.0:5000";
pub(crate) const DEFAULT_HISTORY_CAP: usize = 1000;
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub(crate) const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 600;

/// File depot server: line-oriented TCP transfer protocol plus an HTTP API
/// over one shared catalog.
#[derive(Parser, Debug)]
#[command(name = "depot", version, about)]
pub struct Cli {
    /// Transfer protocol bind address [env: DEPOT_TCP_BIND] [default: 0.0.0.0:8000]
    #[arg(long)]
    pub tcp_bind: Option<String>,

    /// HTTP API bind address [env: DEPOT_HTTP_BIND] [default: 0.0.0.0:5000]
    #[arg(long)]
    pub http_bind: Option<String>,

    /// Data directory holding uploads/ and the persisted catalog and
    /// statistics [env: DEPOT_HOME] [default: .]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Connection-history records retained in the statistics
    /// [env: DEPOT_HISTORY_CAP] [default: 1000]
    #[arg(long)]
    pub history_cap: Option<usize>,

    /// Seconds a session may idle between commands [env: DEPOT_IDLE_TIMEOUT]
    /// [default: 300]
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Seconds a transfer may stall awaiting bytes
    /// [env: DEPOT_TRANSFER_TIMEOUT] [default: 600]
    #[arg(long)]
    pub transfer_timeout_secs: Option<u64>,
}

pub struct Config {
    pub tcp_bind: String,
    pub http_bind: String,
    pub data_dir: PathBuf,
    pub history_cap: usize,
    pub idle_timeout: Duration,
    pub transfer_timeout: Duration,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let tcp_bind = cli
            .tcp_bind
            .or_else(|| env_string("DEPOT_TCP_BIND"))
            .unwrap_or_else(|| DEFAULT_TCP_BIND.to_string());

        let http_bind = cli
            .http_bind
            .or_else(|| env_string("DEPOT_HTTP_BIND"))
            .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());

        let data_dir = cli
            .data_dir
            .or_else(|| env_string("DEPOT_HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let history_cap = cli
            .history_cap
            .or_else(|| env_parsed("DEPOT_HISTORY_CAP"))
            .unwrap_or(DEFAULT_HISTORY_CAP);

        let idle_timeout = cli
            .idle_timeout_secs
            .or_else(|| env_parsed("DEPOT_IDLE_TIMEOUT"))
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

        let transfer_timeout = cli
            .transfer_timeout_secs
            .or_else(|| env_parsed("DEPOT_TRANSFER_TIMEOUT"))
            .unwrap_or(DEFAULT_TRANSFER_TIMEOUT_SECS);

        Self {
            tcp_bind,
            http_bind,
            data_dir,
            history_cap,
            idle_timeout: Duration::from_secs(idle_timeout),
            transfer_timeout: Duration::from_secs(transfer_timeout),
        }
    }

    /// The flat directory holding uploaded files.
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// The persisted catalog index.
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("file_info.json")
    }

    /// The persisted statistics snapshot.
    pub fn stats_path(&self) -> PathBuf {
        self.data_dir.join("network_stats.json")
    }
}
