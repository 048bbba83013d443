// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Crash-side runtime: handler registration, the signal router, the
//! spawned collector process and its thread controller. Everything that
//! can allocate or fail loudly happens in [`init`]; the crash path only
//! consumes what was staged here.

mod crash_handler;
mod dumper_manager;
mod frame_walker;
mod signal_handler_manager;
mod thread_control;

pub use crash_handler::{begin_hard_exit, enabled, register_crash_callback};
pub use thread_control::ThreadControlError;

use crate::recorder::paths::resolve_diag_root;
use crate::shared::configuration::CrashdumpConfiguration;
use anyhow::Context;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering::SeqCst};

static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);
static CONFIG: AtomicPtr<CrashdumpConfiguration> = AtomicPtr::new(ptr::null_mut());

/// Initializes crash handling: resolves and creates the diagnostics root,
/// stages the crash context inputs, allocates the collector stack, installs
/// the signal handlers, and enables the router. Everything allocation-heavy
/// happens here so the crash path never has to.
pub fn init(config: CrashdumpConfiguration) -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "crash handling already initialized"
    );
    let outcome = init_inner(config);
    if outcome.is_err() {
        INIT_STARTED.store(false, SeqCst);
    } else {
        INIT_FINISHED.store(true, SeqCst);
    }
    outcome
}

fn init_inner(config: CrashdumpConfiguration) -> anyhow::Result<()> {
    let root = resolve_diag_root();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating diagnostics root {}", root.display()))?;
    let root_str = root
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("diagnostics root is not valid UTF-8"))?;

    crash_handler::stage(root_str, config.event_name())?;
    dumper_manager::init_spawner(config.reader_binary(), config.timeout())?;
    signal_handler_manager::register(&config, crash_handler::handle_signal)
        .context("installing crash signal handlers")?;
    crash_handler::enable();

    let old = CONFIG.swap(Box::into_raw(Box::new(config)), SeqCst);
    if !old.is_null() {
        // SAFETY: the pointer came from Box::into_raw in a prior init.
        drop(unsafe { Box::from_raw(old) });
    }
    tracing::info!(root = root_str, "crash handling enabled");
    Ok(())
}

/// Disables the router and restores the displaced signal dispositions. The
/// collector stack and alternate signal stack stay mapped; only handler
/// state is undone, so [`init`] may be called again.
pub fn shutdown() -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_FINISHED.load(SeqCst),
        "crash handling is not initialized"
    );
    crash_handler::disable();
    signal_handler_manager::restore()?;
    INIT_FINISHED.store(false, SeqCst);
    INIT_STARTED.store(false, SeqCst);
    tracing::info!("crash handling disabled");
    Ok(())
}

/// The configuration passed to the most recent successful [`init`].
pub fn configuration() -> Option<CrashdumpConfiguration> {
    let config = CONFIG.load(SeqCst);
    if config.is_null() {
        return None;
    }
    // SAFETY: the pointer is only ever replaced, never freed, while set.
    Some(unsafe { (*config).clone() })
}

/// Queues the diagnostic signal at this process with the given dump mode.
pub fn request_dump(mode: crate::shared::configuration::DumpMode) -> anyhow::Result<()> {
    let value = libc::sigval {
        sival_ptr: mode as i32 as usize as *mut libc::c_void,
    };
    // SAFETY: sigqueue with our own pid and a plain integer payload.
    let rc = unsafe {
        libc::sigqueue(
            libc::getpid(),
            crate::shared::constants::diagnostic_signum(),
            value,
        )
    };
    anyhow::ensure!(rc == 0, "sigqueue failed: {}", nix::errno::Errno::last());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_before_init_is_rejected() {
        // Either no init happened yet, or a sibling test finished one; the
        // guard only fires in the former case.
        if !INIT_FINISHED.load(SeqCst) {
            assert!(shutdown().is_err());
        }
    }

    #[test]
    fn configuration_absent_until_init() {
        if CONFIG.load(SeqCst).is_null() {
            assert!(configuration().is_none());
        }
    }
}
