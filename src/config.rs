use std::{ffi::OsString, path::PathBuf, time::Duration};

use clap::Parser;

use crate::spawner::WorkerKind;

pub const DEFAULT_SHM_NAME: &str = "shared_counter";
pub const DEFAULT_LOCK_PATH: &str = "global_lock.tmp";
pub const DEFAULT_LOG_PATH: &str = "program.log";

#[derive(Debug, Parser)]
#[command(
    name = "shared_counter",
    version,
    about = "Counter shared by a master process and the workers it spawns"
)]
pub struct Cli {
    /// Run one worker routine and exit
    #[arg(long = "child", value_enum, value_name = "MODE")]
    pub child: Option<WorkerKind>,

    /// Name of the shared memory segment
    #[arg(long, env = "SHARED_COUNTER_SHM", default_value = DEFAULT_SHM_NAME)]
    pub shm_name: String,

    /// File used for the cross-process lock
    #[arg(long, env = "SHARED_COUNTER_LOCK", default_value = DEFAULT_LOCK_PATH)]
    pub lock_path: PathBuf,

    /// File every process appends its log records to
    #[arg(long, env = "SHARED_COUNTER_LOG", default_value = DEFAULT_LOG_PATH)]
    pub log_path: PathBuf,

    #[arg(long, default_value_t = 300, value_name = "MS")]
    pub tick_ms: u64,

    #[arg(long, default_value_t = 1000, value_name = "MS")]
    pub status_ms: u64,

    #[arg(long, default_value_t = 3000, value_name = "MS")]
    pub spawn_ms: u64,

    #[arg(long, default_value_t = 20, value_name = "MS")]
    pub poll_ms: u64,

    /// How long copy2 holds its doubled value
    #[arg(long, default_value_t = 2000, value_name = "MS")]
    pub copy2_hold_ms: u64,

    /// Diagnostics filter for stderr, falls back to RUST_LOG
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn config(&self) -> Config {
        Config {
            shm_name: self.shm_name.clone(),
            lock_path: self.lock_path.clone(),
            log_path: self.log_path.clone(),
            timings: Timings {
                tick: Duration::from_millis(self.tick_ms),
                status: Duration::from_millis(self.status_ms),
                spawn_gate: Duration::from_millis(self.spawn_ms),
                poll: Duration::from_millis(self.poll_ms),
                copy2_hold: Duration::from_millis(self.copy2_hold_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub tick: Duration,
    pub status: Duration,
    pub spawn_gate: Duration,
    pub poll: Duration,
    pub copy2_hold: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(300),
            status: Duration::from_secs(1),
            spawn_gate: Duration::from_secs(3),
            poll: Duration::from_millis(20),
            copy2_hold: Duration::from_secs(2),
        }
    }
}

/// Everything a process needs to find the shared resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub shm_name: String,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
    pub timings: Timings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_name: DEFAULT_SHM_NAME.to_string(),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Arguments forwarded to every worker so it attaches to the same segment,
    /// lock and log as the master.
    pub fn worker_args(&self) -> Vec<OsString> {
        vec![
            "--shm-name".into(),
            self.shm_name.clone().into(),
            "--lock-path".into(),
            self.lock_path.clone().into(),
            "--log-path".into(),
            self.log_path.clone().into(),
            "--copy2-hold-ms".into(),
            self.timings.copy2_hold.as_millis().to_string().into(),
        ]
    }
}
