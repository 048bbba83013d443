// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Post-mortem dump reader. Takes the path of a binary dump artifact as
//! argv[1] (or a single line on stdin), waits briefly for the incident
//! directory to materialize, renders the text report, and deletes the
//! processed binary. Exit codes are a contract with the collector.

use npud_crashdump::dump::report::render_report;
use npud_crashdump::shared::constants::{
    EXIT_BAD_ARGS, EXIT_DIR_TIMEOUT, EXIT_DUMP_FAILED, EXIT_LOG_INIT, EXIT_OK, READER_DIR_WAIT,
};
use npud_common::timeout::TimeoutManager;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn init_logging() -> Result<(), ()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| ())
}

fn dump_path_from_invocation() -> Option<PathBuf> {
    if let Some(arg) = std::env::args().nth(1) {
        if !arg.is_empty() {
            return Some(PathBuf::from(arg));
        }
    }
    // The collector may hand the path over stdin instead of argv when it
    // execs us from a constrained context.
    let stdin = std::io::stdin();
    let mut line = String::new();
    match stdin.lock().read_line(&mut line) {
        Ok(n) if n > 0 => {
            let trimmed = line.trim();
            (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
        }
        _ => None,
    }
}

/// The crashing process may still be flushing the artifact when we start;
/// poll for the incident directory within a bounded window.
fn wait_for_incident_dir(dump_path: &Path, timeout: Duration) -> bool {
    let Some(dir) = dump_path.parent() else {
        return false;
    };
    let timeout_manager = TimeoutManager::new(timeout);
    loop {
        if dir.is_dir() {
            return true;
        }
        if timeout_manager.expired() {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn main() {
    if init_logging().is_err() {
        std::process::exit(EXIT_LOG_INIT);
    }
    let Some(dump_path) = dump_path_from_invocation() else {
        tracing::error!("no dump path on argv or stdin");
        std::process::exit(EXIT_BAD_ARGS);
    };
    if !wait_for_incident_dir(&dump_path, READER_DIR_WAIT) {
        tracing::error!(path = %dump_path.display(), "incident directory never appeared");
        std::process::exit(EXIT_DIR_TIMEOUT);
    }
    match render_report(&dump_path) {
        Ok(report) => {
            tracing::info!(report = %report.display(), "report written");
            std::process::exit(EXIT_OK);
        }
        Err(e) => {
            tracing::error!(path = %dump_path.display(), error = %e, "dump processing failed");
            std::process::exit(EXIT_DUMP_FAILED);
        }
    }
}
