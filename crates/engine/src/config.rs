use std::{fs, path::Path, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaChangeError};

/// Tunables of a schema change.
///
/// Can be loaded from TOML, where durations are written in
/// [`humantime`] notation, e.g. `report-interval = "5s"`. Missing fields take
/// their default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Options {
    /// Log bytes schema change transactions may generate per second, across
    /// all workers. Zero disables throttling.
    ///
    /// Default: 160MiB
    pub log_bytes_per_second: u64,
    /// Ceiling for the number of concurrently active converter threads.
    ///
    /// Default: 16
    pub max_threads: usize,
    /// Shrink the thread ceiling on deadlocks and grow it again when lock
    /// contention is low. If disabled, a converter that hits a deadlock
    /// sleeps for a random interval instead.
    ///
    /// Default: true
    pub adaptive_threads: bool,
    /// Retries per row before a non-live conversion gives up.
    ///
    /// Default: 500
    pub max_retries: u64,
    /// Persist the stripe watermark every this many converted rows.
    ///
    /// Default: 10
    pub save_every_n: u64,
    /// Persist the logical redo position every this many replayed
    /// transactions.
    ///
    /// Default: 10
    pub redo_save_lsn_every_n: u64,
    /// Converted rows between replication waits in live mode.
    ///
    /// Default: 1
    pub records_per_trans: u64,
    /// Interval of periodic progress reports.
    ///
    /// Default: 5s
    #[serde(with = "humantime_duration")]
    pub report_interval: Duration,
    /// Longest time the logical redo blocks waiting for a commit notice.
    ///
    /// Default: 500ms
    #[serde(with = "humantime_duration")]
    pub redo_wait_timeout: Duration,
    /// Interval at which lock statistics are sampled to adjust the thread
    /// ceiling.
    ///
    /// Default: 1s
    #[serde(with = "humantime_duration")]
    pub lock_check_interval: Duration,
    /// Lock waits per sample interval below which the thread ceiling grows.
    ///
    /// Default: 10
    pub lockwait_grow_threshold: u64,
    /// Free disk space in percent below which the operation aborts, unless
    /// forced.
    ///
    /// Default: 5.0
    pub min_disk_headroom_pct: f64,
    /// Longest wait for replicas to acknowledge a commit.
    ///
    /// Default: 10s
    #[serde(with = "humantime_duration")]
    pub replication_wait: Duration,
    /// Delay added per lagging replica after each live commit.
    ///
    /// Default: 100ms
    #[serde(with = "humantime_duration")]
    pub incoherent_delay_step: Duration,
    /// Attempts to read the log records of a transaction that was just
    /// announced as committed.
    ///
    /// Default: 500
    pub find_txn_retries: u32,
    /// Default: 10ms
    #[serde(with = "humantime_duration")]
    pub find_txn_interval: Duration,
    /// Default: 10ms
    #[serde(with = "humantime_duration")]
    pub retry_sleep_min: Duration,
    /// Default: 510ms
    #[serde(with = "humantime_duration")]
    pub retry_sleep_max: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Options {
    const DEFAULT: Self = Self {
        log_bytes_per_second: 160 * 1024 * 1024,
        max_threads: 16,
        adaptive_threads: true,
        max_retries: 500,
        save_every_n: 10,
        redo_save_lsn_every_n: 10,
        records_per_trans: 1,
        report_interval: Duration::from_secs(5),
        redo_wait_timeout: Duration::from_millis(500),
        lock_check_interval: Duration::from_secs(1),
        lockwait_grow_threshold: 10,
        min_disk_headroom_pct: 5.0,
        replication_wait: Duration::from_secs(10),
        incoherent_delay_step: Duration::from_millis(100),
        find_txn_retries: 500,
        find_txn_interval: Duration::from_millis(10),
        retry_sleep_min: Duration::from_millis(10),
        retry_sleep_max: Duration::from_millis(510),
    };

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let opts: Self = toml::from_str(s).map_err(|e| SchemaChangeError::Config(e.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path).map_err(SchemaChangeError::ConfigIo)?;
        Self::from_toml_str(&s)
    }

    /// A random pause before retrying after a lock conflict.
    pub fn retry_sleep(&self) -> Duration {
        let min = self.retry_sleep_min.as_millis() as u64;
        let max = self.retry_sleep_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max.max(min)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(SchemaChangeError::Config("max-threads must be at least 1".into()));
        }
        if self.retry_sleep_min > self.retry_sleep_max {
            return Err(SchemaChangeError::Config(
                "retry-sleep-min must not exceed retry-sleep-max".into(),
            ));
        }
        if self.save_every_n == 0 || self.redo_save_lsn_every_n == 0 || self.records_per_trans == 0 {
            return Err(SchemaChangeError::Config(
                "save-every-n, redo-save-lsn-every-n and records-per-trans must be positive".into(),
            ));
        }
        Ok(())
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
