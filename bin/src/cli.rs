//! Parse from either cli or env var

/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "tether-worker";
/// default log level. Can use this argument or TETHER_LOG env var
pub const DEFAULT_TETHER_LOG: &str = "info";
/// default id this process campaigns with
pub const DEFAULT_TETHER_ID: &str = "tether_id";
/// log as "json", "pretty" or "standard" (unstructured)
pub const DEFAULT_LOG_FORMAT: &str = "standard";
/// default seconds between runs of the locked job
pub const DEFAULT_LOCK_INTERVAL: u64 = 10;

use std::{path::PathBuf, time::Duration};

pub use clap::Parser;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "tether", bin_name = "tether", about, long_about = None)]
/// parses from cli & environment var. tether will load `.env` in the same dir as the binary as well
pub struct Config {
    /// path to the coordination config; built-in defaults are used when unset
    #[clap(short, long, value_parser, env)]
    pub config_path: Option<PathBuf>,
    /// Worker thread name
    #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
    pub thread_name: String,
    /// number of worker threads, defaults to the number of cpus
    #[clap(long, env, value_parser)]
    pub threads: Option<usize>,
    /// ID of this instance, used as the candidate value in elections
    #[clap(long, env, value_parser, default_value = DEFAULT_TETHER_ID)]
    pub tether_id: String,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env, value_parser, default_value = DEFAULT_TETHER_LOG)]
    pub tether_log: String,
    /// log output format: standard, json or pretty
    #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
    pub log_format: String,
    /// election to campaign in for as long as the process runs
    #[clap(long, env, value_parser)]
    pub election: Option<String>,
    /// lock key to take periodically, logging while held
    #[clap(long, env, value_parser)]
    pub lock_key: Option<String>,
    /// seconds between runs of the locked job
    #[clap(long, env, value_parser, default_value_t = DEFAULT_LOCK_INTERVAL)]
    pub lock_interval: u64,
}

impl Config {
    /// interval between runs of the locked job, at least one second
    pub fn lock_interval(&self) -> Duration {
        Duration::from_secs(self.lock_interval.max(1))
    }
}
