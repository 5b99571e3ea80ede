use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use crate::{error::LogError, lock::FileLock};

/// Local wall-clock time as `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

/// Append-only text log shared by every process. One record per line.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `line` and a newline while holding `lock`, so records from
    /// concurrent writers never interleave.
    pub fn append(&self, lock: &mut FileLock, line: &str) -> Result<(), LogError> {
        let _held = lock.acquire()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| LogError::Open {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| LogError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
