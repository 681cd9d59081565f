//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::Parser;
use herd::cluster::options::DEFAULT_LISTEN;
use herd::cluster::{ClusterOptions, DistributionMode};
use herd::logging::{LogConfig, LogFormat};
use tracing::Level;

/// Run an HTTP service as a supervised pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run as a multi-process cluster instead of a single process.
    #[arg(long, env = "HERD_CLUSTER")]
    pub cluster: bool,

    /// Number of worker processes (0 or negative for one per CPU, capped at the CPU count).
    #[arg(
        short,
        long,
        env = "HERD_WORKERS",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    pub workers: i64,

    /// Public listen address, e.g. ":8080" or "127.0.0.1:3000".
    #[arg(short, long, env = "HERD_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// How connections are spread across workers (auto, kernel, proxy).
    #[arg(long, env = "HERD_DISTRIBUTION", default_value_t = DistributionMode::Auto)]
    pub distribution: DistributionMode,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            enabled: self.cluster,
            worker_count: self.workers,
            listen_address: self.listen.clone(),
            distribution: self.distribution,
        }
    }

    /// Logging configuration: environment first, then explicit flags on top.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::new().with_env_overrides();
        if self.quiet {
            config = config.with_level(Level::ERROR);
        } else if self.verbose == 1 {
            config = config.with_level(Level::DEBUG);
        } else if self.verbose > 1 {
            config = config.with_level(Level::TRACE);
        }
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        config
    }
}
