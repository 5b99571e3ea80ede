//! The short-lived routines a master launches in separate processes.
//!
//! Each routine marks its kind busy, applies its arithmetic to the counter one
//! critical section at a time, logs start and end, and clears its busy flag.
//! Lock failures skip the affected step but never stop the routine before the
//! flag is cleared.

use std::{process, thread, time::Duration};

use tracing::warn;

use crate::{log_sink::timestamp, shared_state::Session, spawner::WorkerKind};

enum Step {
    Apply(fn(i64) -> i64),
    Hold(Duration),
}

fn plan(kind: WorkerKind, hold: Duration) -> Vec<Step> {
    match kind {
        WorkerKind::Copy1 => vec![Step::Apply(|c: i64| c.wrapping_add(10))],
        // Each multiply/divide is atomic on its own; the pair is not.
        WorkerKind::Copy2 => vec![
            Step::Apply(|c: i64| c.wrapping_mul(2)),
            Step::Hold(hold),
            Step::Apply(|c: i64| c / 2),
        ],
    }
}

/// What a finished routine observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub kind: WorkerKind,
    pub skipped_steps: usize,
    pub final_counter: Option<i64>,
    pub flag_cleared: bool,
}

impl WorkerReport {
    /// Non-zero only when the busy flag could not be cleared, which tells the
    /// reaping master to clear it instead.
    pub fn exit_code(&self) -> u8 {
        match self.flag_cleared {
            true => 0,
            false => 1,
        }
    }
}

/// Runs the routine for `kind` on an attached session.
pub fn run(session: &mut Session, kind: WorkerKind, hold: Duration) -> WorkerReport {
    let pid = process::id();
    let tag = kind.tag();

    if let Err(e) = session.with_state(|state| state.set_busy(kind, true)) {
        warn!(%kind, error = %e, "could not mark worker busy");
    }
    session.log(&format!("[{tag}] Start, PID={pid}, time={}", timestamp()));

    let mut skipped_steps = 0;
    for step in plan(kind, hold) {
        match step {
            Step::Apply(op) => {
                if let Err(e) = session.with_state(|state| state.update(op)) {
                    warn!(%kind, error = %e, "skipping counter update");
                    skipped_steps += 1;
                }
            }
            Step::Hold(duration) => thread::sleep(duration),
        }
    }

    let final_counter = match session.with_state(|state| state.counter()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(%kind, error = %e, "could not read final counter");
            None
        }
    };
    let counter = final_counter.map_or_else(|| "unavailable".to_string(), |v| v.to_string());
    session.log(&format!(
        "[{tag}] End,   PID={pid}, time={}, counter={counter}",
        timestamp()
    ));

    let flag_cleared = match session.with_state(|state| state.set_busy(kind, false)) {
        Ok(()) => true,
        Err(e) => {
            warn!(%kind, error = %e, "could not clear busy flag");
            false
        }
    };

    WorkerReport {
        kind,
        skipped_steps,
        final_counter,
        flag_cleared,
    }
}
