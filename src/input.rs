use std::{
    io::{BufRead, Write},
    process,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::{debug, warn};

use crate::{error::ParseError, log_sink::timestamp, shared_state::Session};

const PROMPT: &str = "Enter an integer (or q to quit): ";

/// One operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Set(i64),
    Quit,
}

pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    match line {
        "" => Err(ParseError::Empty),
        "q" | "Q" => Ok(Command::Quit),
        _ => line
            .parse::<i64>()
            .map(Command::Set)
            .map_err(|_| ParseError::NotAnInteger(line.to_string())),
    }
}

/// Reads operator lines until quit, end of input or `stop`. Always leaves
/// `stop` set when it returns.
pub fn run<R: BufRead, W: Write>(session: &mut Session, mut input: R, mut out: W, stop: &AtomicBool) {
    let mut line = String::new();
    while !stop.load(Ordering::SeqCst) {
        let _ = write!(out, "{PROMPT}");
        let _ = out.flush();

        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => {
                debug!("input closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to read input");
                break;
            }
        }

        match parse_line(&line) {
            Ok(Command::Quit) => break,
            Ok(Command::Set(value)) => set_counter(session, value),
            Err(e) => {
                let _ = writeln!(out, "Invalid input: {e}");
            }
        }
    }
    stop.store(true, Ordering::SeqCst);
}

fn set_counter(session: &mut Session, value: i64) {
    if let Err(e) = session.with_state(|state| state.set_counter(value)) {
        warn!(error = %e, value, "counter not updated");
        return;
    }
    session.log(&format!(
        "[USER] Counter set to {value}, PID={}, time={}",
        process::id(),
        timestamp()
    ));
}
