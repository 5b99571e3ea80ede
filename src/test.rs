use crate::{
    config::{Config, Timings},
    error::{LockError, LogError, ParseError, SegmentError},
    input::{self, Command, parse_line},
    lock::FileLock,
    log_sink::LogSink,
    master::{ControlLoop, GateOutcome, Interval},
    shared_state::{Role, Session, SharedState},
    spawner::{Launcher, Reaped, WorkerKind},
    unlink_if_exists, worker,
};

use std::{
    fs,
    io::Cursor,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::{Arc, Barrier, atomic::AtomicBool},
    thread,
    time::{Duration, Instant},
};

use tempfile::TempDir;

macro_rules! function {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        name.strip_suffix("::f").unwrap()
    }};
}

macro_rules! maybe_cleanup {
    () => {
        let _guard = CleanupGuard::new(function!());
    };
}

fn config_for(name: &str, dir: &TempDir) -> Config {
    Config {
        shm_name: name.to_string(),
        lock_path: dir.path().join("global.lock"),
        log_path: dir.path().join("program.log"),
        timings: Timings {
            copy2_hold: Duration::from_millis(50),
            ..Timings::default()
        },
    }
}

fn read_log(config: &Config) -> String {
    fs::read_to_string(&config.log_path).unwrap_or_default()
}

#[derive(Default)]
struct FakeLauncher {
    launched: Vec<WorkerKind>,
    fail: Option<WorkerKind>,
    exits: Vec<Reaped>,
}

impl Launcher for FakeLauncher {
    fn launch(&mut self, kind: WorkerKind) -> Result<u32, crate::error::SpawnError> {
        self.launched.push(kind);
        match self.fail {
            Some(failing) if failing == kind => Err(crate::error::SpawnError::Launch {
                kind,
                path: "/nonexistent".into(),
                source: std::io::ErrorKind::NotFound.into(),
            }),
            _ => Ok(1000 + self.launched.len() as u32),
        }
    }

    fn reap(&mut self) -> Vec<Reaped> {
        std::mem::take(&mut self.exits)
    }
}

#[test]
fn test_first_attacher_initializes() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);

    let mut master = Session::start(&config).unwrap();
    assert_eq!(master.role(), Role::Master);
    assert!(master.is_initializer());
    {
        let state = master.lock().unwrap();
        assert_eq!(*state, SharedState::INITIAL);
    }
    master.with_state(|s| s.set_counter(41)).unwrap();

    let mut slave = Session::start(&config).unwrap();
    assert_eq!(slave.role(), Role::Slave);
    assert!(!slave.is_initializer());
    assert_eq!(slave.with_state(|s| s.counter()).unwrap(), 41);

    slave.close().unwrap();
    master.close().unwrap();
}

#[test]
fn test_single_initializer_under_race() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = Arc::new(config_for(function!(), &dir));
    let num_attachers = 8;
    let barrier = Arc::new(Barrier::new(num_attachers));

    let handles: Vec<_> = (0..num_attachers)
        .map(|_| {
            let config = config.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut session = Session::start(&config).unwrap();
                let seen = session.with_state(|s| *s).unwrap();
                (session, seen)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let initializers = results.iter().filter(|(s, _)| s.is_initializer()).count();
    assert_eq!(initializers, 1);
    for (_, seen) in &results {
        assert_eq!(*seen, SharedState::INITIAL);
    }

    let (masters, slaves): (Vec<_>, Vec<_>) = results
        .into_iter()
        .map(|(s, _)| s)
        .partition(|s| s.is_initializer());
    for slave in slaves {
        slave.close().unwrap();
    }
    for master in masters {
        master.close().unwrap();
    }
}

#[test]
fn test_worker_join_requires_existing_segment() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);

    match Session::join(&config, WorkerKind::Copy1) {
        Err(SegmentError::Missing(name)) => assert_eq!(name, function!()),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("worker must not create the segment"),
    }
}

#[test]
fn test_invalid_segment_name() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for("bad/name", &dir);
    assert!(matches!(
        Session::start(&config),
        Err(SegmentError::InvalidName(_))
    ));
    config.shm_name = String::new();
    assert!(matches!(
        Session::start(&config),
        Err(SegmentError::InvalidName(_))
    ));
}

#[test]
fn test_only_initializer_destroys() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);

    let mut master = Session::start(&config).unwrap();
    master.with_state(|s| s.set_counter(7)).unwrap();

    let slave = Session::start(&config).unwrap();
    slave.close().unwrap();

    // The segment outlived the slave and still carries the master's value.
    let mut late = Session::join(&config, WorkerKind::Copy1).unwrap();
    assert_eq!(late.with_state(|s| s.counter()).unwrap(), 7);
    late.close().unwrap();

    master.close().unwrap();
    assert!(matches!(
        Session::join(&config, WorkerKind::Copy1),
        Err(SegmentError::Missing(_))
    ));
    assert!(!unlink_if_exists(function!()).unwrap());
}

#[test]
fn test_lock_excludes_other_handles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("excl.lock");
    let mut first = FileLock::new(&path);
    let mut second = FileLock::new(&path);

    let guard = first.acquire().unwrap();
    assert!(second.try_acquire().unwrap().is_none());
    drop(guard);
    assert!(!first.is_held());

    let guard = second.try_acquire().unwrap();
    assert!(guard.is_some());
}

#[test]
fn test_blocking_acquire_waits_for_release() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("block.lock");
    let mut holder = FileLock::open(&path).unwrap();
    let guard = holder.acquire().unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let waiter_path = path.clone();
    let handle = thread::spawn(move || {
        let mut waiter = FileLock::new(waiter_path);
        tx.send("waiting").unwrap();
        let _held = waiter.acquire().unwrap();
        tx.send("acquired").unwrap();
    });

    assert_eq!(rx.recv().unwrap(), "waiting");
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());

    drop(guard);
    assert_eq!(rx.recv().unwrap(), "acquired");
    handle.join().unwrap();
}

#[test]
fn test_release_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut lock = FileLock::new(dir.path().join("idle.lock"));
    lock.release();
    lock.release();
    assert!(!lock.is_held());
    assert!(!dir.path().join("idle.lock").exists());

    {
        let _held = lock.acquire().unwrap();
    }
    lock.release();
    assert!(!lock.is_held());
}

#[test]
fn test_lock_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("no-such-dir").join("x.lock");
    assert!(matches!(
        FileLock::open(&missing),
        Err(LockError::Open { .. })
    ));

    let mut lazy = FileLock::new(&missing);
    assert!(lazy.acquire().is_err());
    assert!(!lazy.is_held());
}

#[test]
fn test_no_lost_updates_across_handles() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let mut session = Session::start(&config).unwrap();

    let num_threads = 4;
    let increments_per_thread = 100;
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let mut handle = session.handle();
            thread::spawn(move || {
                for _ in 0..increments_per_thread {
                    let mut state = handle.lock().unwrap();
                    let old = state.counter();
                    thread::yield_now();
                    state.set_counter(old + 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let final_value = session.with_state(|s| s.counter()).unwrap();
    assert_eq!(final_value, num_threads * increments_per_thread);
    session.close().unwrap();
}

#[test]
fn test_copy1_clears_busy_flag_and_logs() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let mut master = Session::start(&config).unwrap();

    let mut worker_session = Session::join(&config, WorkerKind::Copy1).unwrap();
    assert_eq!(worker_session.role(), Role::Worker(WorkerKind::Copy1));
    let report = worker::run(&mut worker_session, WorkerKind::Copy1, Duration::ZERO);
    worker_session.close().unwrap();

    assert_eq!(report.final_counter, Some(10));
    assert_eq!(report.skipped_steps, 0);
    assert!(report.flag_cleared);
    assert_eq!(report.exit_code(), 0);

    let state = master.with_state(|s| *s).unwrap();
    assert_eq!(state.counter(), 10);
    assert!(!state.any_busy());

    let log = read_log(&config);
    assert!(log.contains("[COPY1] Start, PID="));
    assert!(log.contains("[COPY1] End,   PID="));
    assert!(log.contains("counter=10"));
    master.close().unwrap();
}

#[test]
fn test_copy2_is_net_noop() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let mut master = Session::start(&config).unwrap();
    master.with_state(|s| s.set_counter(21)).unwrap();

    let mut worker_session = Session::join(&config, WorkerKind::Copy2).unwrap();
    let report = worker::run(&mut worker_session, WorkerKind::Copy2, Duration::from_millis(10));
    worker_session.close().unwrap();

    assert_eq!(report.final_counter, Some(21));
    assert!(!master.with_state(|s| s.is_busy(WorkerKind::Copy2)).unwrap());
    master.close().unwrap();
}

#[test]
fn test_workers_serialize_inside_hold_window() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let mut master = Session::start(&config).unwrap();
    master.with_state(|s| s.set_counter(4)).unwrap();

    let copy2 = {
        let config = config.clone();
        thread::spawn(move || {
            let mut session = Session::join(&config, WorkerKind::Copy2).unwrap();
            let report = worker::run(&mut session, WorkerKind::Copy2, Duration::from_millis(300));
            session.close().unwrap();
            report
        })
    };

    // Wait until copy2 published its doubled value, then land copy1 in its hold window.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = master.with_state(|s| *s).unwrap();
        if state.is_busy(WorkerKind::Copy2) && state.counter() == 8 {
            break;
        }
        assert!(Instant::now() < deadline, "copy2 never doubled the counter");
        thread::sleep(Duration::from_millis(5));
    }
    let mut copy1 = Session::join(&config, WorkerKind::Copy1).unwrap();
    let report1 = worker::run(&mut copy1, WorkerKind::Copy1, Duration::ZERO);
    copy1.close().unwrap();
    assert_eq!(report1.final_counter, Some(18));

    let report2 = copy2.join().unwrap();
    // ((4 * 2) + 10) / 2: every step applied once, in lock order.
    assert_eq!(report2.final_counter, Some(9));
    let state = master.with_state(|s| *s).unwrap();
    assert_eq!(state.counter(), 9);
    assert!(!state.any_busy());
    master.close().unwrap();
}

#[test]
fn test_spawn_gate_launches_both_when_idle() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let session = Session::start(&config).unwrap();
    let mut control = ControlLoop::new(
        session,
        FakeLauncher::default(),
        &config.timings,
        Instant::now(),
    );

    assert_eq!(
        control.spawn_gate(),
        GateOutcome::Launched { failed: vec![] }
    );
    assert_eq!(
        control.launcher().launched,
        vec![WorkerKind::Copy1, WorkerKind::Copy2]
    );
    let state = control.session_mut().with_state(|s| *s).unwrap();
    assert!(state.is_busy(WorkerKind::Copy1));
    assert!(state.is_busy(WorkerKind::Copy2));

    // Flags are claimed by the gate itself, so an immediate retrigger skips.
    assert_eq!(control.spawn_gate(), GateOutcome::Skipped);
    assert_eq!(control.launcher().launched.len(), 2);

    assert!(read_log(&config).contains("[MASTER] Spawned copies #1 and #2."));
    let (session, _) = control.into_parts();
    session.close().unwrap();
}

#[test]
fn test_spawn_gate_skips_when_any_busy() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let mut session = Session::start(&config).unwrap();
    session
        .with_state(|s| s.set_busy(WorkerKind::Copy2, true))
        .unwrap();
    let mut control = ControlLoop::new(
        session,
        FakeLauncher::default(),
        &config.timings,
        Instant::now(),
    );

    assert_eq!(control.spawn_gate(), GateOutcome::Skipped);
    assert!(control.launcher().launched.is_empty());
    let state = control.session_mut().with_state(|s| *s).unwrap();
    assert!(!state.is_busy(WorkerKind::Copy1));
    assert!(read_log(&config).contains("spawn skipped"));

    let (session, _) = control.into_parts();
    session.close().unwrap();
}

#[test]
fn test_failed_launch_releases_its_flag() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let session = Session::start(&config).unwrap();
    let launcher = FakeLauncher {
        fail: Some(WorkerKind::Copy2),
        ..FakeLauncher::default()
    };
    let mut control = ControlLoop::new(session, launcher, &config.timings, Instant::now());

    assert_eq!(
        control.spawn_gate(),
        GateOutcome::Launched {
            failed: vec![WorkerKind::Copy2]
        }
    );
    assert_eq!(control.launcher().launched.len(), 2);
    let state = control.session_mut().with_state(|s| *s).unwrap();
    assert!(state.is_busy(WorkerKind::Copy1));
    assert!(!state.is_busy(WorkerKind::Copy2));
    assert!(read_log(&config).contains("Failed to spawn copies #1/#2! (copy2)"));

    let (session, _) = control.into_parts();
    session.close().unwrap();
}

#[test]
fn test_reaping_crashed_worker_clears_flag() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let mut session = Session::start(&config).unwrap();
    session
        .with_state(|s| {
            s.set_busy(WorkerKind::Copy1, true);
            s.set_busy(WorkerKind::Copy2, true);
        })
        .unwrap();
    let launcher = FakeLauncher {
        exits: vec![
            Reaped {
                kind: WorkerKind::Copy1,
                pid: 4242,
                status: ExitStatus::from_raw(1 << 8),
            },
            Reaped {
                kind: WorkerKind::Copy2,
                pid: 4243,
                status: ExitStatus::from_raw(0),
            },
        ],
        ..FakeLauncher::default()
    };
    let mut control = ControlLoop::new(session, launcher, &config.timings, Instant::now());

    let reaped = control.reap_workers();
    assert_eq!(reaped.len(), 2);
    let state = control.session_mut().with_state(|s| *s).unwrap();
    // Only the abnormal exit is cleaned up by the master.
    assert!(!state.is_busy(WorkerKind::Copy1));
    assert!(state.is_busy(WorkerKind::Copy2));
    assert!(read_log(&config).contains("Worker COPY1 (PID=4242) exited abnormally"));

    let (session, _) = control.into_parts();
    session.close().unwrap();
}

#[test]
fn test_tick_progress() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let session = Session::start(&config).unwrap();
    let timings = Timings {
        status: Duration::from_secs(3600),
        spawn_gate: Duration::from_secs(3600),
        ..config.timings
    };
    let t0 = Instant::now();
    let mut control = ControlLoop::new(session, FakeLauncher::default(), &timings, t0);

    control.poll(t0 + Duration::from_millis(100));
    assert_eq!(control.session_mut().with_state(|s| s.counter()).unwrap(), 0);

    let ticks = 5;
    for i in 1..=ticks {
        control.poll(t0 + Duration::from_millis(300 * i));
        // A poll between ticks must not fire again.
        control.poll(t0 + Duration::from_millis(300 * i + 150));
    }
    assert_eq!(
        control.session_mut().with_state(|s| s.counter()).unwrap(),
        ticks as i64
    );
    assert!(control.launcher().launched.is_empty());

    let (session, _) = control.into_parts();
    session.close().unwrap();
}

#[test]
fn test_slave_only_ticks() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let master = Session::start(&config).unwrap();
    let slave = Session::start(&config).unwrap();
    let t0 = Instant::now();
    let mut control = ControlLoop::new(slave, FakeLauncher::default(), &config.timings, t0);
    assert!(!control.is_master());

    control.poll(t0 + Duration::from_secs(4));
    assert_eq!(control.session_mut().with_state(|s| s.counter()).unwrap(), 1);
    assert!(control.launcher().launched.is_empty());
    assert!(!read_log(&config).contains("[MASTER]"));

    let (slave, _) = control.into_parts();
    slave.close().unwrap();
    master.close().unwrap();
}

#[test]
fn test_master_status_and_gate_fire_on_schedule() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let session = Session::start(&config).unwrap();
    let t0 = Instant::now();
    let mut control = ControlLoop::new(session, FakeLauncher::default(), &config.timings, t0);

    control.poll(t0 + Duration::from_millis(1000));
    assert!(read_log(&config).contains("[MASTER] "));
    assert!(control.launcher().launched.is_empty());

    control.poll(t0 + Duration::from_millis(3000));
    assert_eq!(control.launcher().launched.len(), 2);

    let (session, _) = control.into_parts();
    session.close().unwrap();
}

#[test]
fn test_interval_fires_once_per_period() {
    let t0 = Instant::now();
    let mut interval = Interval::new(Duration::from_millis(300), t0);
    assert!(!interval.fire(t0));
    assert!(!interval.fire(t0 + Duration::from_millis(299)));
    assert!(interval.fire(t0 + Duration::from_millis(300)));
    assert!(!interval.fire(t0 + Duration::from_millis(500)));
    assert!(interval.fire(t0 + Duration::from_millis(650)));
}

#[test]
fn test_parse_line() {
    assert_eq!(parse_line("42\n"), Ok(Command::Set(42)));
    assert_eq!(parse_line("  -7 "), Ok(Command::Set(-7)));
    assert_eq!(parse_line("q"), Ok(Command::Quit));
    assert_eq!(parse_line("Q\r\n"), Ok(Command::Quit));
    assert_eq!(parse_line("\n"), Err(ParseError::Empty));
    assert_eq!(
        parse_line("12abc"),
        Err(ParseError::NotAnInteger("12abc".to_string()))
    );
    assert!(matches!(
        parse_line("99999999999999999999"),
        Err(ParseError::NotAnInteger(_))
    ));
}

#[test]
fn test_input_sets_counter_and_quits() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let mut session = Session::start(&config).unwrap();
    let mut handle = session.handle();
    let stop = AtomicBool::new(false);
    let mut out = Vec::new();

    input::run(
        &mut handle,
        Cursor::new("42\nnope\nq\n100\n"),
        &mut out,
        &stop,
    );

    assert!(stop.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(session.with_state(|s| s.counter()).unwrap(), 42);
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("Invalid input: \"nope\" is not an integer"));
    assert!(read_log(&config).contains("[USER] Counter set to 42"));
    assert!(!read_log(&config).contains("Counter set to 100"));

    drop(handle);
    session.close().unwrap();
}

#[test]
fn test_input_end_of_stream_stops() {
    maybe_cleanup!();
    let dir = TempDir::new().unwrap();
    let config = config_for(function!(), &dir);
    let session = Session::start(&config).unwrap();
    let mut handle = session.handle();
    let stop = AtomicBool::new(false);

    input::run(&mut handle, Cursor::new("5"), std::io::sink(), &stop);

    assert!(stop.load(std::sync::atomic::Ordering::SeqCst));
    drop(handle);
    let mut session = session;
    assert_eq!(session.with_state(|s| s.counter()).unwrap(), 5);
    session.close().unwrap();
}

#[test]
fn test_log_sink_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let sink = LogSink::new(dir.path());
    let mut lock = FileLock::new(dir.path().join("log.lock"));
    assert!(matches!(
        sink.append(&mut lock, "dropped"),
        Err(LogError::Open { .. })
    ));
    assert!(!lock.is_held());

    let sink = LogSink::new(dir.path().join("ok.log"));
    sink.append(&mut lock, "first").unwrap();
    sink.append(&mut lock, "second").unwrap();
    assert_eq!(
        fs::read_to_string(sink.path()).unwrap(),
        "first\nsecond\n"
    );
}

#[test]
fn test_worker_args_forward_shared_resources() {
    let config = Config::default();
    let args: Vec<String> = config
        .worker_args()
        .into_iter()
        .map(|a| a.into_string().unwrap())
        .collect();
    assert_eq!(
        args,
        [
            "--shm-name",
            "shared_counter",
            "--lock-path",
            "global_lock.tmp",
            "--log-path",
            "program.log",
            "--copy2-hold-ms",
            "2000",
        ]
    );
}

struct CleanupGuard {
    name: &'static str,
}

impl CleanupGuard {
    fn new(name: &'static str) -> Self {
        let _ = unlink_if_exists(name);
        Self { name }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let _ = unlink_if_exists(self.name);
    }
}
