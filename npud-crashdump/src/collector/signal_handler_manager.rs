// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Installs the crash handler for the configured signal set, remembers the
//! actions it displaced so they can be chained or restored, and manages the
//! alternate signal stack used to survive stack-overflow faults.

use crate::shared::configuration::CrashdumpConfiguration;
use anyhow::Context;
use libc::{c_int, c_void, siginfo_t};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};

/// Indexed by signal number; SIGRTMAX on Linux is 64.
const SIGNAL_SLOTS: usize = 65;

struct SavedActions {
    actions: [Option<libc::sigaction>; SIGNAL_SLOTS],
}

/// Swapped in exactly once at registration; the handler only ever loads it.
static SAVED: AtomicPtr<SavedActions> = AtomicPtr::new(ptr::null_mut());

pub(crate) type HandlerFn = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// Creates and installs an alternate signal stack with a guard page below
/// it. The mapping is intentionally never unmapped: the kernel may deliver
/// a signal on it at any point for the rest of the process lifetime.
pub(crate) fn create_alt_stack() -> anyhow::Result<()> {
    let page = page_size::get();
    let size = libc::SIGSTKSZ.max(64 * 1024).div_ceil(page) * page;
    // SAFETY: anonymous private mapping with no address hint.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size + page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    anyhow::ensure!(base != libc::MAP_FAILED, "failed to map alternate stack");
    // SAFETY: base spans size + page bytes; the first page becomes the guard.
    let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
    anyhow::ensure!(rc == 0, "failed to protect alternate stack guard page");
    let stack = libc::stack_t {
        // SAFETY: the usable region starts one page past the mapping base.
        ss_sp: unsafe { base.add(page) },
        ss_flags: 0,
        ss_size: size,
    };
    // SAFETY: stack describes a live mapping.
    let rc = unsafe { libc::sigaltstack(&stack, ptr::null_mut()) };
    anyhow::ensure!(rc == 0, "sigaltstack failed");
    Ok(())
}

/// Installs `handler` for every configured signal, remembering the actions
/// it displaces. Fails if handlers are already registered.
pub(crate) fn register(config: &CrashdumpConfiguration, handler: HandlerFn) -> anyhow::Result<()> {
    anyhow::ensure!(
        SAVED.load(SeqCst).is_null(),
        "signal handlers already registered"
    );
    if config.create_alt_stack() {
        create_alt_stack().context("creating the alternate signal stack")?;
    }

    const NONE: Option<libc::sigaction> = None;
    let mut saved = Box::new(SavedActions {
        actions: [NONE; SIGNAL_SLOTS],
    });

    let mut flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    if config.use_alt_stack() {
        flags |= libc::SA_ONSTACK;
    }
    for &signum in config.signals() {
        // SAFETY: sigaction with a zeroed mask and a valid handler pointer.
        let old = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = flags;
            libc::sigemptyset(&mut action.sa_mask);
            let mut old: libc::sigaction = std::mem::zeroed();
            let rc = libc::sigaction(signum, &action, &mut old);
            anyhow::ensure!(rc == 0, "sigaction({signum}) failed");
            old
        };
        saved.actions[signum as usize] = Some(old);
    }

    SAVED.store(Box::into_raw(saved), SeqCst);
    Ok(())
}

/// Restores every displaced action and forgets the table.
pub(crate) fn restore() -> anyhow::Result<()> {
    let saved = SAVED.swap(ptr::null_mut(), SeqCst);
    anyhow::ensure!(!saved.is_null(), "signal handlers were not registered");
    // SAFETY: the pointer came from Box::into_raw in register and is
    // reclaimed exactly once.
    let saved = unsafe { Box::from_raw(saved) };
    for (signum, action) in saved.actions.iter().enumerate() {
        if let Some(action) = action {
            // SAFETY: restoring a previously returned action.
            let rc = unsafe { libc::sigaction(signum as c_int, action, ptr::null_mut()) };
            anyhow::ensure!(rc == 0, "restoring sigaction({signum}) failed");
        }
    }
    Ok(())
}

/// The action displaced for `signum`, if handlers are registered.
/// Signal-safe: one atomic load and a table read.
pub(crate) fn displaced_action(signum: c_int) -> Option<libc::sigaction> {
    let saved = SAVED.load(SeqCst);
    if saved.is_null() || !(0..SIGNAL_SLOTS as c_int).contains(&signum) {
        return None;
    }
    // SAFETY: the table is written once before the store and never mutated.
    unsafe { (*saved).actions[signum as usize] }
}

/// Hands the signal to the action that was installed before ours. Returns
/// false if that action was the default or ignore disposition, in which
/// case the caller decides how to terminate.
///
/// # Safety
/// Must be called from a signal handler with the original `info` and `uc`.
pub(crate) unsafe fn chain_displaced(
    signum: c_int,
    info: *mut siginfo_t,
    uc: *mut c_void,
) -> bool {
    let Some(action) = displaced_action(signum) else {
        return false;
    };
    match action.sa_sigaction {
        libc::SIG_DFL | libc::SIG_IGN | libc::SIG_ERR => false,
        handler if action.sa_flags & libc::SA_SIGINFO != 0 => {
            let f: HandlerFn = unsafe { std::mem::transmute(handler) };
            f(signum, info, uc);
            true
        }
        handler => {
            let f: extern "C" fn(c_int) = unsafe { std::mem::transmute(handler) };
            f(signum);
            true
        }
    }
}

/// Reinstalls the default disposition and re-raises so the OS performs its
/// normal termination (and core dump, if configured) for `signum`.
pub(crate) fn restore_default_and_raise(signum: c_int) -> ! {
    // SAFETY: installing SIG_DFL and unblocking one signal.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, ptr::null_mut());

        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, signum);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &mask, ptr::null_mut());

        libc::raise(signum);
        // raise should not return; if it does, nothing is recoverable.
        libc::_exit(128 + signum);
    }
}
