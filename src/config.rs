use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{error::SmallError, types::SmallResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Durability {
    /// Commit writes the log buffers and fsyncs the file.
    Sync,
    /// Commit writes the log buffers to the OS but doesn't fsync.
    WriteNoSync,
    /// Commit leaves the entry in the log buffer.
    NoSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DeadlockDetection {
    /// A waiter gives up when its lock timeout expires.
    Timeout,
    /// Every wait checks the waits-for graph, a requester closing a
    /// cycle is the victim.
    WaitsForGraph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LockingMode {
    Enabled,
    /// Every lock request is granted immediately. Only safe with a
    /// single writer.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

impl IsolationLevel {
    /// The isolation level selected by cargo features.
    ///
    /// `serializable` maps to `RepeatableRead` since there is no range
    /// locking on the record path.
    pub fn from_features() -> Self {
        if cfg!(feature = "serializable") || cfg!(feature = "repeatable_read") {
            return IsolationLevel::RepeatableRead;
        }
        if cfg!(feature = "read_uncommitted") {
            return IsolationLevel::ReadUncommitted;
        }
        return IsolationLevel::ReadCommitted;
    }
}

/// Settings of an environment.
///
/// Every field has a default, so a TOML file only has to mention the
/// values it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub home: PathBuf,
    pub log_file_max: u64,
    pub log_buffer_size: usize,
    pub log_num_buffers: usize,
    pub durability: Durability,
    pub lock_timeout_ms: u64,
    pub deadlock_detection: DeadlockDetection,
    pub locking: LockingMode,
    pub isolation: IsolationLevel,
    pub n_lock_tables: usize,
    pub bin_max_entries: usize,
    pub in_max_entries: usize,
    pub bin_delta_percent: usize,
    pub bin_max_deltas: usize,

    /// Watchdog for tree latches. Latches are held for a few
    /// instructions and never across I/O, so a wait this long means a
    /// latch leaked or the latch order is broken, and the waiter
    /// panics. A latch wait can't be cancelled otherwise. 0 disables
    /// the watchdog.
    pub latch_timeout_ms: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("data"),
            log_file_max: 10 * 1024 * 1024,
            log_buffer_size: 64 * 1024,
            log_num_buffers: 3,
            durability: Durability::Sync,
            lock_timeout_ms: 500,
            deadlock_detection: DeadlockDetection::Timeout,
            locking: LockingMode::Enabled,
            isolation: IsolationLevel::from_features(),
            n_lock_tables: 7,
            bin_max_entries: 128,
            in_max_entries: 128,
            bin_delta_percent: 25,
            bin_max_deltas: 10,
            latch_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl EnvConfig {
    pub fn new<P: AsRef<Path>>(home: P) -> Self {
        Self {
            home: home.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load the config from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> SmallResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| SmallError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: EnvConfig = toml::from_str(&text)
            .map_err(|e| SmallError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SmallResult {
        if self.n_lock_tables == 0 {
            return Err(SmallError::Config("n_lock_tables must be positive".to_string()));
        }
        if self.log_num_buffers == 0 {
            return Err(SmallError::Config("log_num_buffers must be positive".to_string()));
        }
        if self.bin_max_entries < 4 || self.in_max_entries < 4 {
            return Err(SmallError::Config(
                "node capacity must be at least 4".to_string(),
            ));
        }
        // the file header and one maximal buffer must fit in a file
        if self.log_file_max < 1024 {
            return Err(SmallError::Config(format!(
                "log_file_max too small: {}",
                self.log_file_max
            )));
        }
        if self.bin_delta_percent > 100 {
            return Err(SmallError::Config(format!(
                "bin_delta_percent out of range: {}",
                self.bin_delta_percent
            )));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// `None` when the latch watchdog is off.
    pub fn latch_timeout(&self) -> Option<Duration> {
        match self.latch_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn with_log_file_max(mut self, v: u64) -> Self {
        self.log_file_max = v;
        self
    }

    pub fn with_log_buffer_size(mut self, v: usize) -> Self {
        self.log_buffer_size = v;
        self
    }

    pub fn with_durability(mut self, v: Durability) -> Self {
        self.durability = v;
        self
    }

    pub fn with_lock_timeout_ms(mut self, v: u64) -> Self {
        self.lock_timeout_ms = v;
        self
    }

    pub fn with_deadlock_detection(mut self, v: DeadlockDetection) -> Self {
        self.deadlock_detection = v;
        self
    }

    pub fn with_locking(mut self, v: LockingMode) -> Self {
        self.locking = v;
        self
    }

    pub fn with_isolation(mut self, v: IsolationLevel) -> Self {
        self.isolation = v;
        self
    }

    pub fn with_bin_max_entries(mut self, v: usize) -> Self {
        self.bin_max_entries = v;
        self
    }

    pub fn with_in_max_entries(mut self, v: usize) -> Self {
        self.in_max_entries = v;
        self
    }

    pub fn with_bin_delta_percent(mut self, v: usize) -> Self {
        self.bin_delta_percent = v;
        self
    }

    pub fn with_latch_timeout_ms(mut self, v: u64) -> Self {
        self.latch_timeout_ms = v;
        self
    }

    pub fn with_bin_max_deltas(mut self, v: usize) -> Self {
        self.bin_max_deltas = v;
        self
    }
}
