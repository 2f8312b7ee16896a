use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ringwall_common::MAX_PKT_BURST;

use crate::error::{Error, Result};

/// Daemon settings, loadable from CLI or YAML file.
///
/// Topology (ports, lcores) lives in the JSON files under `config_dir`; this
/// struct only carries process-level knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding `interface.json`, `worker.json` and `acl.json`.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Number of packet buffers in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bytes per packet buffer (headroom included).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Capacity of every ring queue. Must be a power of two.
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,

    /// Receive/transmit burst size.
    #[serde(default = "default_burst")]
    pub burst: usize,

    /// Poll interval of the retirement wait, in milliseconds.
    #[serde(default = "default_quiesce_poll_ms")]
    pub quiesce_poll_ms: u64,

    /// Management loop tick, in milliseconds.
    #[serde(default = "default_mgmt_tick_ms")]
    pub mgmt_tick_ms: u64,

    /// Put every port in promiscuous mode.
    #[serde(default = "default_true")]
    pub promiscuous: bool,

    /// Pin each lcore thread to the CPU of the same number.
    #[serde(default = "default_true")]
    pub pin_cores: bool,

    /// Control API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Line shell port (None = shell disabled).
    #[serde(default)]
    pub shell_port: Option<u16>,

    /// List of CIDRs allowed to access the control API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/opt/firewall/config")
}

fn default_pool_size() -> usize {
    81920
}

fn default_buffer_size() -> usize {
    128 + 2048
}

fn default_ring_size() -> usize {
    1024
}

fn default_burst() -> usize {
    MAX_PKT_BURST
}

fn default_quiesce_poll_ms() -> u64 {
    50
}

fn default_mgmt_tick_ms() -> u64 {
    10
}

fn default_api_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            pool_size: default_pool_size(),
            buffer_size: default_buffer_size(),
            ring_size: default_ring_size(),
            burst: default_burst(),
            quiesce_poll_ms: default_quiesce_poll_ms(),
            mgmt_tick_ms: default_mgmt_tick_ms(),
            promiscuous: true,
            pin_cores: true,
            api_port: default_api_port(),
            shell_port: None,
            allowed_ips: Vec::new(),
            quiet: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ref dir) = cli.config_dir {
            self.config_dir = dir.clone();
        }
        if let Some(pool_size) = cli.pool_size {
            self.pool_size = pool_size;
        }
        if let Some(ring_size) = cli.ring_size {
            self.ring_size = ring_size;
        }
        if let Some(burst) = cli.burst {
            self.burst = burst;
        }
        if let Some(ms) = cli.quiesce_poll_ms {
            self.quiesce_poll_ms = ms;
        }
        if cli.no_promiscuous {
            self.promiscuous = false;
        }
        if cli.no_pin {
            self.pin_cores = false;
        }
        if cli.api_port != 3000 {
            self.api_port = cli.api_port;
        }
        if cli.shell_port.is_some() {
            self.shell_port = cli.shell_port;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    /// Reject values the dataplane cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be non-zero".into()));
        }
        if !self.ring_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "ring_size {} is not a power of two",
                self.ring_size
            )));
        }
        if self.burst == 0 || self.burst > MAX_PKT_BURST {
            return Err(Error::Config(format!(
                "burst must be within 1..={}, got {}",
                MAX_PKT_BURST, self.burst
            )));
        }
        if self.quiesce_poll_ms == 0 || self.mgmt_tick_ms == 0 {
            return Err(Error::Config("poll intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn quiesce_poll(&self) -> Duration {
        Duration::from_millis(self.quiesce_poll_ms)
    }

    pub fn mgmt_tick(&self) -> Duration {
        Duration::from_millis(self.mgmt_tick_ms)
    }
}

use clap::Parser;

/// ringwall: pinned-core user-space firewall dataplane
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to YAML settings file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Directory holding interface.json, worker.json and acl.json.
    #[arg(short = 'd', long)]
    pub config_dir: Option<PathBuf>,

    /// Number of packet buffers in the pool.
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Ring queue capacity (power of two).
    #[arg(long)]
    pub ring_size: Option<usize>,

    /// Receive/transmit burst size.
    #[arg(long)]
    pub burst: Option<usize>,

    /// Retirement wait poll interval in milliseconds.
    #[arg(long)]
    pub quiesce_poll_ms: Option<u64>,

    /// Leave ports out of promiscuous mode.
    #[arg(long)]
    pub no_promiscuous: bool,

    /// Do not pin lcore threads to CPUs.
    #[arg(long)]
    pub no_pin: bool,

    /// Port to serve the control API on.
    #[arg(short, long, default_value_t = 3000)]
    pub api_port: u16,

    /// Port for the line shell.
    #[arg(long)]
    pub shell_port: Option<u16>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to access the control API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
