//! The long-lived control loop of a top-level instance.
//!
//! A single thread polls three timers. The tick runs in every instance; the
//! status report and the spawn gate only run in the master. Operator input is
//! handled by a second thread with its own [`Session`] handle.

use std::{
    io::{self, BufRead},
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, info, warn};

use crate::{
    config::Timings,
    input,
    log_sink::timestamp,
    shared_state::{Role, Session},
    spawner::{Launcher, Reaped, WorkerKind},
};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT and SIGTERM into a cooperative stop so the initializer still
/// gets to destroy the segment.
pub fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// A periodic action's schedule.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period: Duration,
    last: Instant,
}

impl Interval {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self { period, last: now }
    }

    /// True once per elapsed period; resets the schedule to `now` when it fires.
    pub fn fire(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) < self.period {
            return false;
        }
        self.last = now;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// A worker of some kind was still flagged busy, or the flags could not be read.
    Skipped,
    /// Both kinds were launched; `failed` lists the launches that did not start.
    Launched { failed: Vec<WorkerKind> },
}

pub struct ControlLoop<L> {
    session: Session,
    launcher: L,
    tick: Interval,
    status: Interval,
    gate: Interval,
    poll: Duration,
}

impl<L: Launcher> ControlLoop<L> {
    pub fn new(session: Session, launcher: L, timings: &Timings, now: Instant) -> Self {
        Self {
            session,
            launcher,
            tick: Interval::new(timings.tick, now),
            status: Interval::new(timings.status, now),
            gate: Interval::new(timings.spawn_gate, now),
            poll: timings.poll,
        }
    }

    pub fn is_master(&self) -> bool {
        self.session.role() == Role::Master
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn into_parts(self) -> (Session, L) {
        (self.session, self.launcher)
    }

    /// Runs every action whose timer has elapsed at `now`.
    pub fn poll(&mut self, now: Instant) {
        if self.tick.fire(now) {
            self.tick();
        }
        if !self.is_master() {
            return;
        }
        if self.status.fire(now) {
            self.report_status();
        }
        if self.gate.fire(now) {
            self.spawn_gate();
        }
    }

    /// Polls until `stop` is set or a termination signal arrives.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) && !interrupted() {
            self.poll(Instant::now());
            thread::sleep(self.poll);
        }
    }

    /// Adds one to the counter. Returns the new value, or `None` when the lock
    /// was unavailable and the tick was skipped.
    pub fn tick(&mut self) -> Option<i64> {
        match self.session.with_state(|state| state.update(|c| c.wrapping_add(1))) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "tick skipped");
                None
            }
        }
    }

    pub fn report_status(&mut self) {
        let counter = match self.session.with_state(|state| state.counter()) {
            Ok(counter) => counter,
            Err(e) => {
                warn!(error = %e, "status report skipped");
                return;
            }
        };
        self.session.log(&format!(
            "[MASTER] {}, PID={}, counter={counter}",
            timestamp(),
            process::id()
        ));
    }

    /// Launches one worker of each kind unless either kind is still busy.
    ///
    /// Both flags are checked and claimed in the same critical section, so a
    /// second gate can never see them free before the new workers start.
    pub fn spawn_gate(&mut self) -> GateOutcome {
        self.reap_workers();

        let claimed = self.session.with_state(|state| {
            if state.any_busy() {
                return false;
            }
            for kind in WorkerKind::ALL {
                state.set_busy(kind, true);
            }
            true
        });
        let claimed = claimed.unwrap_or_else(|e| {
            warn!(error = %e, "busy flags unreadable, treating workers as busy");
            false
        });
        if !claimed {
            self.session.log(&format!(
                "[MASTER] {} Previous workers still running, spawn skipped.",
                timestamp()
            ));
            return GateOutcome::Skipped;
        }

        let mut failed = Vec::new();
        for kind in WorkerKind::ALL {
            match self.launcher.launch(kind) {
                Ok(pid) => debug!(%kind, pid, "worker launched"),
                Err(e) => {
                    warn!(%kind, error = %e, "worker launch failed");
                    failed.push(kind);
                }
            }
        }
        if !failed.is_empty() {
            self.release_flags(&failed);
        }

        let record = match failed.as_slice() {
            [] => "[MASTER] Spawned copies #1 and #2.".to_string(),
            kinds => format!(
                "[MASTER] Failed to spawn copies #1/#2! ({})",
                kinds
                    .iter()
                    .map(|kind| kind.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        self.session.log(&record);
        GateOutcome::Launched { failed }
    }

    /// Collects exited workers. One that failed may not have cleared its own
    /// busy flag, so the master clears it.
    pub fn reap_workers(&mut self) -> Vec<Reaped> {
        let reaped = self.launcher.reap();
        let abnormal: Vec<WorkerKind> = reaped
            .iter()
            .filter(|worker| !worker.status.success())
            .map(|worker| worker.kind)
            .collect();
        for worker in &reaped {
            match worker.status.success() {
                true => debug!(kind = %worker.kind, pid = worker.pid, "worker reaped"),
                false => self.session.log(&format!(
                    "[MASTER] {} Worker {} (PID={}) exited abnormally: {}",
                    timestamp(),
                    worker.kind.tag(),
                    worker.pid,
                    worker.status
                )),
            }
        }
        if !abnormal.is_empty() {
            self.release_flags(&abnormal);
        }
        reaped
    }

    fn release_flags(&mut self, kinds: &[WorkerKind]) {
        let cleared = self.session.with_state(|state| {
            for &kind in kinds {
                state.set_busy(kind, false);
            }
        });
        if let Err(e) = cleared {
            warn!(error = %e, ?kinds, "busy flags left set");
        }
    }
}

/// Runs a top-level instance until the operator quits, input ends or a
/// termination signal arrives, then shuts down and, for the master, destroys
/// the segment.
pub fn run<L, R>(
    mut session: Session,
    launcher: L,
    timings: &Timings,
    reader: R,
    stop: Arc<AtomicBool>,
) -> Result<()>
where
    L: Launcher,
    R: BufRead + Send + 'static,
{
    let role = session.role();
    session.log(&format!(
        "[MAIN] Start: PID={}, time={} ({role})",
        process::id(),
        timestamp()
    ));
    info!(%role, segment = session.segment_name(), "instance started");

    let spawned = {
        let mut handle = session.handle();
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("input".into())
            .spawn(move || input::run(&mut handle, reader, io::stdout(), &stop))
    };
    let input_thread = match spawned {
        Ok(thread) => thread,
        Err(e) => {
            session.close()?;
            return Err(e).context("failed to start input thread");
        }
    };

    let mut control = ControlLoop::new(session, launcher, timings, Instant::now());
    control.run(&stop);
    stop.store(true, Ordering::SeqCst);

    if interrupted() && !input_thread.is_finished() {
        debug!("input thread still blocked on read, leaving it detached");
    } else if input_thread.join().is_err() {
        warn!("input thread panicked");
    }

    control.reap_workers();
    let (mut session, launcher) = control.into_parts();
    drop(launcher);
    session.log(&format!(
        "[MAIN] End: PID={}, time={} ({role})",
        process::id(),
        timestamp()
    ));
    session.close().context("failed to release shared segment")?;
    info!(%role, "instance stopped");
    Ok(())
}
