use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use figment::{
    providers::{Env, Format as _, Toml},
    Figment,
};
use fs_err as fs;
use serde::Deserialize;

use crate::BoxError;

/// Minimum error backoff. Cycles that failed with a transient cause must not
/// hammer the database, so shorter configured values are raised to this.
const MIN_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string for the master/detail store.
    pub database_url: String,

    /// Connection pool size for the store.
    pub pool_size: u32,

    /// Business center code → priority. Applied externally when masters are
    /// seeded; the claim ordering trusts the priority stored on the row and
    /// never re-reads this map.
    pub business_center_priorities: BTreeMap<String, i32>,

    /// Cursor fetch hint: rows fetched per database round-trip while
    /// streaming detail rows.
    pub batch_size: usize,

    /// Age after which a PROCESSING master's lock is considered abandoned
    /// and the row becomes claimable again.
    pub lock_timeout: Duration,

    /// Idle sleep between polls when no work is available.
    pub poll_interval: Duration,

    /// Sleep after a cycle fails with a transient cause.
    pub error_backoff: Duration,

    /// Maximum number of masters processed concurrently by this process.
    pub max_concurrent_masters: usize,

    /// Directory the output files are written to.
    pub output_directory: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub database_url: String,
    #[serde(default = "defaults::pool_size")]
    pub pool_size: u32,
    #[serde(default)]
    pub business_center_priorities: BTreeMap<String, i32>,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    #[serde(default = "defaults::poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "defaults::error_backoff_seconds")]
    pub error_backoff_seconds: u64,
    #[serde(default = "defaults::max_concurrent_masters")]
    pub max_concurrent_masters: usize,
    #[serde(default = "defaults::output_directory")]
    pub output_directory: PathBuf,
}

mod defaults {
    use std::path::PathBuf;

    pub fn pool_size() -> u32 {
        10
    }
    pub fn batch_size() -> usize {
        1000
    }
    pub fn lock_timeout_seconds() -> u64 {
        300
    }
    pub fn poll_interval_seconds() -> u64 {
        5
    }
    pub fn error_backoff_seconds() -> u64 {
        5
    }
    pub fn max_concurrent_masters() -> usize {
        10
    }
    pub fn output_directory() -> PathBuf {
        PathBuf::from("./output")
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// `env_override` allows env vars prefixed with `SPOOL_CONFIG_` to
    /// override config values.
    pub fn load(file: impl Into<PathBuf>, env_override: bool) -> Result<Self, BoxError> {
        let config_path: PathBuf = fs::canonicalize(file.into())?;
        let contents = fs::read_to_string(&config_path)?;

        let config_file: ConfigFile = {
            let mut config_builder = Figment::new().merge(Toml::string(&contents));
            if env_override {
                config_builder = config_builder.merge(Env::prefixed("SPOOL_CONFIG_"));
            }
            config_builder.extract()?
        };

        // Resolve the output directory relative to the directory of the
        // config file.
        let base = config_path.parent();
        Self::from_file(config_file, base)
    }

    fn from_file(file: ConfigFile, base: Option<&std::path::Path>) -> Result<Self, BoxError> {
        if file.batch_size == 0 {
            return Err("batch_size must be a positive integer".into());
        }
        if file.lock_timeout_seconds == 0 {
            return Err("lock_timeout_seconds must be a positive integer".into());
        }
        if file.poll_interval_seconds == 0 {
            return Err("poll_interval_seconds must be a positive integer".into());
        }
        if file.max_concurrent_masters == 0 {
            return Err("max_concurrent_masters must be a positive integer".into());
        }
        if file.pool_size == 0 {
            return Err("pool_size must be a positive integer".into());
        }

        let output_directory = match base {
            Some(base) if file.output_directory.is_relative() => {
                base.join(&file.output_directory)
            }
            _ => file.output_directory,
        };

        Ok(Self {
            database_url: file.database_url,
            pool_size: file.pool_size,
            business_center_priorities: file.business_center_priorities,
            batch_size: file.batch_size,
            lock_timeout: Duration::from_secs(file.lock_timeout_seconds),
            poll_interval: Duration::from_secs(file.poll_interval_seconds),
            error_backoff: Duration::from_secs(file.error_backoff_seconds).max(MIN_ERROR_BACKOFF),
            max_concurrent_masters: file.max_concurrent_masters,
            output_directory,
        })
    }
}
