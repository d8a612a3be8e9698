use std::time::Duration;

use clap::{Args, ValueEnum};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Flags for `secret-syncopier run`. Each falls back to an environment variable.
#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Seconds between garbage-collection sweeps.
    #[arg(long, env = "SYNCOPIER_GC_INTERVAL_SECS", default_value_t = 300)]
    pub gc_interval_secs: u64,

    /// Number of concurrent reconciliation workers.
    #[arg(long, env = "SYNCOPIER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Declarations that may wait for a worker before watchers block.
    #[arg(long, env = "SYNCOPIER_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Reconnect attempts per watch before the process gives up.
    #[arg(long, env = "SYNCOPIER_WATCH_RETRIES", default_value_t = 8)]
    pub watch_retries: usize,

    #[arg(long, env = "RUST_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub gc_interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub watch_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(300),
            workers: 4,
            queue_capacity: 1024,
            watch_retries: 8,
        }
    }
}

impl From<&RunArgs> for Config {
    fn from(args: &RunArgs) -> Self {
        Self {
            gc_interval: Duration::from_secs(args.gc_interval_secs.max(1)),
            workers: args.workers.max(1),
            queue_capacity: args.queue_capacity.max(1),
            watch_retries: args.watch_retries,
        }
    }
}
