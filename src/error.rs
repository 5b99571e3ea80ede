use std::{io, path::PathBuf};

use crate::spawner::WorkerKind;

/// The lock object could not be created or locked. Callers skip the critical
/// section and carry on.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("cannot open lock file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("flock on {path} failed: {source}")]
    Lock { path: PathBuf, source: io::Error },
}

/// Fatal for the process attempting the attach.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid segment name {0:?}")]
    InvalidName(String),
    #[error("segment {0} does not exist")]
    Missing(String),
    #[error("segment {name} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        actual: u64,
        expected: usize,
    },
    #[error("shared memory operation on {name} failed: {source}")]
    Io { name: String, source: io::Error },
    #[error("lock unavailable while attaching: {0}")]
    Lock(#[from] LockError),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to launch {kind} from {path}: {source}")]
    Launch {
        kind: WorkerKind,
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to wait for worker {pid}: {source}")]
    Wait { pid: u32, source: io::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("cannot open log file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot write log file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("{0:?} is not an integer")]
    NotAnInteger(String),
}
