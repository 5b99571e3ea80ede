use std::{
    env,
    io::{self, BufReader},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result};
use clap::Parser;
use shared_counter::{
    Session, WorkerKind, config::Cli, master, spawner::ProcessSpawner, worker,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let result = match cli.child {
        Some(kind) => run_worker(&cli, kind),
        None => run_instance(&cli),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_worker(cli: &Cli, kind: WorkerKind) -> Result<ExitCode> {
    let config = cli.config();
    let mut session = Session::join(&config, kind)
        .with_context(|| format!("{kind} cannot attach to segment {}", config.shm_name))?;
    let report = worker::run(&mut session, kind, config.timings.copy2_hold);
    session.close().context("failed to detach from segment")?;
    Ok(ExitCode::from(report.exit_code()))
}

fn run_instance(cli: &Cli) -> Result<ExitCode> {
    let config = cli.config();
    let session = Session::start(&config)
        .with_context(|| format!("cannot attach to segment {}", config.shm_name))?;
    if let Err(e) = master::install_signal_handlers() {
        warn!(error = %e, "signal handlers not installed, Ctrl-C will skip cleanup");
    }

    let launcher = ProcessSpawner::new(executable_path(), config.worker_args());
    let stop = Arc::new(AtomicBool::new(false));
    master::run(
        session,
        launcher,
        &config.timings,
        BufReader::new(io::stdin()),
        stop,
    )?;
    Ok(ExitCode::SUCCESS)
}

fn executable_path() -> PathBuf {
    env::current_exe().unwrap_or_else(|e| {
        warn!(error = %e, "cannot resolve executable path, using argv[0]");
        env::args_os()
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("shared_counter"))
    })
}
