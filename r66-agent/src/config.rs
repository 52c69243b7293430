//! CLI configuration for `r66-agent`.
//!
//! Example:
//!   r66-agent --host-id hosta --base-dir /srv/r66 --rules rules.json \
//!             --write-global-limit 1048576 --submit default=report.csv

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, ValueEnum};

// ---

use r66_engine::{EngineSettings, PathsConfig};
use r66_shaper::ShaperConfig;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "r66-agent", about = "R66 transfer daemon")]
pub struct Config {
    // ---
    /// Identity of this host in transfer keys.
    #[arg(long, env = "R66_HOST_ID", default_value = "hosta")]
    pub host_id: String,

    /// Home directory; `in`, `out`, `work` and `arch` live under it.
    ///
    /// Created automatically if it does not exist.
    #[arg(long, default_value = "/tmp/r66")]
    pub base_dir: PathBuf,

    /// JSON file holding an array of rules. Without it a single empty
    /// rule named `default` is loaded.
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Where transfer records live.
    #[arg(long, value_enum, default_value_t = StoreMode::Memory)]
    pub store: StoreMode,

    /// Peer the loopback transport delivers to, under `<base-dir>/<peer-id>/in`.
    #[arg(long, default_value = "hostb")]
    pub peer_id: String,

    /// Transfers to request at startup, as `RULE=FILE`. Repeatable.
    #[arg(long, value_name = "RULE=FILE")]
    pub submit: Vec<SubmitArg>,

    // --- shaping
    /// Global write limit in bytes/s; 0 is unlimited.
    #[arg(long, default_value_t = 0)]
    pub write_global_limit: i64,

    #[arg(long, default_value_t = 0)]
    pub read_global_limit: i64,

    #[arg(long, default_value_t = 0)]
    pub write_channel_limit: i64,

    #[arg(long, default_value_t = 0)]
    pub read_channel_limit: i64,

    /// Accounting period in ms; 0 disables periodic accounting.
    #[arg(long, default_value_t = 1_000)]
    pub check_interval_ms: u64,

    #[arg(long, default_value_t = 15_000)]
    pub max_time_to_wait_ms: u64,

    /// Bytes queued across all channels before writers are told to back off.
    #[arg(long, default_value_t = 400 * 1024 * 1024)]
    pub max_global_write_size: u64,

    /// Fairness tolerance between channels, at most 0.4.
    #[arg(long, default_value_t = 0.1)]
    pub max_deviation: f64,

    // --- scheduling
    #[arg(long, default_value_t = 20)]
    pub max_workers: usize,

    #[arg(long, default_value_t = 5_000)]
    pub commander_delay_ms: u64,

    #[arg(long, default_value_t = 100)]
    pub submit_spacing_ms: u64,

    /// Instances sharing the store; above 1 the monitor lock is used.
    #[arg(long, default_value_t = 1)]
    pub monitor_instances: u32,

    #[arg(long, default_value_t = r66_domain::DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Seconds running transfers get to finish on shutdown.
    #[arg(long, default_value_t = 30)]
    pub drain_timeout_secs: u64,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    // ---
    /// In-process row store. Lost on exit; archive markers are not written.
    Memory,
    /// No store: JSON markers under `arch` and an in-memory queue.
    None,
}

// ---

/// `RULE=FILE` from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitArg {
    pub rule: String,
    pub file: String,
}

impl FromStr for SubmitArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.split_once('=') {
            Some((rule, file)) if !rule.trim().is_empty() && !file.trim().is_empty() => Ok(Self {
                rule: rule.trim().to_string(),
                file: file.trim().to_string(),
            }),
            _ => Err(format!("expected RULE=FILE, got {s:?}")),
        }
    }
}

// ---

impl Config {
    // ---
    pub fn paths(&self) -> PathsConfig {
        PathsConfig::under(&self.base_dir)
    }

    /// Receiving directory of the loopback peer.
    pub fn peer_in_dir(&self) -> PathBuf {
        self.base_dir.join(&self.peer_id).join("in")
    }

    // ---

    pub fn shaper(&self) -> ShaperConfig {
        // ---
        ShaperConfig {
            write_global_limit: self.write_global_limit,
            read_global_limit: self.read_global_limit,
            write_channel_limit: self.write_channel_limit,
            read_channel_limit: self.read_channel_limit,
            check_interval_ms: self.check_interval_ms,
            max_time_to_wait_ms: self.max_time_to_wait_ms,
            max_global_write_size: self.max_global_write_size,
            max_deviation: self.max_deviation,
            ..Default::default()
        }
    }

    // ---

    pub fn engine(&self) -> EngineSettings {
        // ---
        EngineSettings {
            commander_delay_ms: self.commander_delay_ms,
            max_workers: self.max_workers,
            submit_spacing_ms: self.submit_spacing_ms,
            monitor_instances: self.monitor_instances,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn submit_arg_needs_both_halves() {
        // ---
        let arg: SubmitArg = "default=data/a.csv".parse().unwrap();
        assert_eq!(arg.rule, "default");
        assert_eq!(arg.file, "data/a.csv");
        assert!("default".parse::<SubmitArg>().is_err(), "missing '=' rejected");
        assert!("=a.csv".parse::<SubmitArg>().is_err(), "empty rule rejected");
    }

    #[test]
    fn flags_reach_shaper_and_engine_settings() {
        // ---
        let cfg = Config::parse_from([
            "r66-agent",
            "--write-global-limit",
            "2048",
            "--max-workers",
            "8",
            "--store",
            "none",
            "--submit",
            "default=a.bin",
        ]);
        assert_eq!(cfg.shaper().write_global_limit, 2048);
        assert_eq!(cfg.engine().max_workers, 8);
        assert_eq!(cfg.engine().reserved_workers, 5, "headroom keeps its default");
        assert_eq!(cfg.store, StoreMode::None);
        assert_eq!(cfg.submit.len(), 1);
    }
}
