use std::{
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
};

use tracing::{debug, warn};

use crate::error::SpawnError;

/// The two worker routines a master can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum WorkerKind {
    #[value(name = "1", alias = "copy1")]
    Copy1,
    #[value(name = "2", alias = "copy2")]
    Copy2,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 2] = [WorkerKind::Copy1, WorkerKind::Copy2];

    /// Tag used in log records.
    pub fn tag(self) -> &'static str {
        match self {
            WorkerKind::Copy1 => "COPY1",
            WorkerKind::Copy2 => "COPY2",
        }
    }

    /// Value passed after `--child` on the worker's command line.
    pub fn arg(self) -> &'static str {
        match self {
            WorkerKind::Copy1 => "1",
            WorkerKind::Copy2 => "2",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Copy1 => f.write_str("copy1"),
            WorkerKind::Copy2 => f.write_str("copy2"),
        }
    }
}

/// A worker that exited and has been reaped.
#[derive(Debug, Clone, Copy)]
pub struct Reaped {
    pub kind: WorkerKind,
    pub pid: u32,
    pub status: ExitStatus,
}

/// Extension point for how the master starts workers.
pub trait Launcher {
    /// Starts a worker and returns its pid without waiting for it.
    fn launch(&mut self, kind: WorkerKind) -> Result<u32, SpawnError>;

    /// Collects workers that have exited since the last call. Never blocks.
    fn reap(&mut self) -> Vec<Reaped> {
        Vec::new()
    }
}

/// A launched worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    kind: WorkerKind,
    child: Child,
}

impl WorkerProcess {
    /// Runs `executable --child <kind> <extra_args...>` and returns immediately.
    pub fn spawn(
        executable: &Path,
        kind: WorkerKind,
        extra_args: &[OsString],
    ) -> Result<Self, SpawnError> {
        let child = Command::new(executable)
            .arg("--child")
            .arg(kind.arg())
            .args(extra_args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SpawnError::Launch {
                kind,
                path: executable.to_path_buf(),
                source,
            })?;
        debug!(%kind, pid = child.id(), "launched worker");
        Ok(Self { kind, child })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// `Ok(None)` while the worker is still running.
    pub fn try_reap(&mut self) -> Result<Option<ExitStatus>, SpawnError> {
        self.child.try_wait().map_err(|source| self.wait_error(source))
    }

    /// Blocks until the worker exits and returns its status.
    pub fn wait(mut self) -> Result<ExitStatus, SpawnError> {
        self.child.wait().map_err(|source| self.wait_error(source))
    }

    fn wait_error(&self, source: io::Error) -> SpawnError {
        SpawnError::Wait {
            pid: self.child.id(),
            source,
        }
    }
}

/// Launches workers from the running executable and keeps their handles so
/// they can be reaped.
pub struct ProcessSpawner {
    executable: PathBuf,
    extra_args: Vec<OsString>,
    running: Vec<WorkerProcess>,
}

impl ProcessSpawner {
    pub fn new(executable: impl Into<PathBuf>, extra_args: Vec<OsString>) -> Self {
        Self {
            executable: executable.into(),
            extra_args,
            running: Vec::new(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }
}

impl Launcher for ProcessSpawner {
    fn launch(&mut self, kind: WorkerKind) -> Result<u32, SpawnError> {
        let worker = WorkerProcess::spawn(&self.executable, kind, &self.extra_args)?;
        let pid = worker.pid();
        self.running.push(worker);
        Ok(pid)
    }

    fn reap(&mut self) -> Vec<Reaped> {
        let mut reaped = Vec::new();
        self.running.retain_mut(|worker| match worker.try_reap() {
            Ok(Some(status)) => {
                reaped.push(Reaped {
                    kind: worker.kind(),
                    pid: worker.pid(),
                    status,
                });
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "dropping worker that cannot be waited on");
                false
            }
        });
        reaped
    }
}
