use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Connection and timeout settings shared by every command.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Postgres connection string for the result service
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Read results from a JSON snapshot; takes precedence over the database
    #[arg(long, global = true)]
    pub snapshot: Option<PathBuf>,

    /// Abandon a fetch after this many seconds
    #[arg(long, env = "DRILLDOWN_FETCH_TIMEOUT_SECS", default_value_t = 10, global = true)]
    pub fetch_timeout_secs: u64,

    #[arg(long, default_value_t = 5, global = true)]
    pub max_connections: u32,
}

impl Config {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}
