// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use crate::timeout::TimeoutManager;
use libc::{c_int, c_void, _exit, EXIT_FAILURE};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ptr;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to allocate process stack (errno {0})")]
    StackAllocation(i32),
    #[error("Failed to protect stack guard page (errno {0})")]
    GuardPage(i32),
    #[error("clone failed (errno {0})")]
    CloneFailed(i32),
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum WaitError {
    #[error("Timeout waiting for child process to exit")]
    Timeout,
    #[error("Error waiting for child process to exit: {0}")]
    WaitFailed(#[from] nix::Error),
}

/// How a supervised child process ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Exited(0))
    }
}

/// A fixed-size stack for a cloned child process, `mmap`ed once with a guard
/// page below it and intentionally never unmapped. The crash path must not
/// allocate, so this is created at init time and reused for every spawn.
pub struct StackArena {
    base: *mut c_void,
    size: usize,
}

// The arena is only handed to one child at a time; the caller serializes use.
unsafe impl Send for StackArena {}
unsafe impl Sync for StackArena {}

impl StackArena {
    pub fn new(size: usize) -> Result<Self, SpawnError> {
        let page = page_size();
        // Round up to whole pages and add one guard page at the low end.
        let size = size.div_ceil(page) * page;
        // SAFETY: anonymous private mapping with no address hint.
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size + page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(SpawnError::StackAllocation(Errno::last_raw()));
        }
        // SAFETY: `mapping` spans size + page bytes; the first page becomes the guard.
        let rc = unsafe { libc::mprotect(mapping, page, libc::PROT_NONE) };
        if rc != 0 {
            return Err(SpawnError::GuardPage(Errno::last_raw()));
        }
        // SAFETY: the usable region starts one page past the mapping base.
        let base = unsafe { mapping.add(page) };
        Ok(Self { base, size })
    }

    /// Highest usable address; stacks grow downward on all supported targets.
    pub fn top(&self) -> *mut c_void {
        // SAFETY: base + size stays within the mapping created in `new`.
        unsafe { self.base.add(self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Spawns `entry` as a new process running on the caller-supplied stack.
///
/// The child shares the parent's address space (`CLONE_VM`) so it can read
/// the crashing process's memory directly; it is still a separate process
/// with its own pid and signal disposition. No atfork handlers run.
///
/// # Safety
/// `entry` must be safe to run in a process that shares memory with the
/// caller, and `arg` must stay valid until the child exits. Only one child
/// may use `stack` at a time.
pub unsafe fn clone_with_stack(
    entry: extern "C" fn(*mut c_void) -> c_int,
    stack: &StackArena,
    arg: *mut c_void,
) -> Result<Pid, SpawnError> {
    let flags = libc::CLONE_VM | libc::SIGCHLD;
    // SAFETY: stack.top() points at the high end of a live mapping; the
    // remaining preconditions are forwarded to our caller.
    let pid = unsafe { libc::clone(entry, stack.top(), flags, arg) };
    if pid < 0 {
        Err(SpawnError::CloneFailed(Errno::last_raw()))
    } else {
        Ok(Pid::from_raw(pid))
    }
}

/// Blocks until the child exits, retrying only when the wait is interrupted
/// by an unrelated signal. The OS bounds this wait by the child's lifetime;
/// no additional timeout is layered on top.
pub fn wait_for_exit(pid: Pid) -> Result<ChildExit, WaitError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ChildExit::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ChildExit::Signaled(sig as i32)),
            // Stops and continues are not exits; keep waiting.
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(WaitError::WaitFailed(e)),
        }
    }
}

/// Polling reaper bounded by the caller's time budget. Returns the child's
/// exit once collected, `None` if it was never ours to reap, and
/// [`WaitError::Timeout`] when the budget runs out with the child still
/// alive (the child is left running; the caller decides whether to kill it).
pub fn reap_child_non_blocking(
    pid: Pid,
    timeout_manager: &TimeoutManager,
) -> Result<Option<ChildExit>, WaitError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::StillAlive) => {
                if timeout_manager.expired() {
                    return Err(WaitError::Timeout);
                }
                // sched_yield is async-signal-safe; no sleeping allocator
                // paths on the polling loop.
                std::thread::yield_now();
            }
            Ok(WaitStatus::Exited(_, code)) => return Ok(Some(ChildExit::Exited(code))),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(Some(ChildExit::Signaled(sig as i32))),
            // Stops and continues are not exits; keep polling.
            Ok(_) => continue,
            Err(Errno::ECHILD) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(WaitError::WaitFailed(e)),
        }
    }
}

/// Kills the process without running abort machinery or atexit handlers.
pub fn terminate() -> ! {
    // SAFETY: no preconditions.
    unsafe { _exit(EXIT_FAILURE) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering::SeqCst};

    #[test]
    fn stack_arena_rounds_to_pages() {
        let arena = StackArena::new(1).expect("mmap");
        assert!(arena.size() >= 1);
        assert_eq!(arena.size() % page_size(), 0);
        assert!(!arena.top().is_null());
    }

    static CHILD_SAW: AtomicI32 = AtomicI32::new(0);

    extern "C" fn child_entry(arg: *mut c_void) -> c_int {
        // Shared address space: this store is visible to the parent.
        CHILD_SAW.store(arg as i32, SeqCst);
        7
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn clone_child_shares_memory_and_reports_exit() {
        let arena = StackArena::new(256 * 1024).expect("mmap");
        let pid = unsafe { clone_with_stack(child_entry, &arena, 42 as *mut c_void) }
            .expect("clone");
        let exit = wait_for_exit(pid).expect("wait");
        assert_eq!(exit, ChildExit::Exited(7));
        assert!(!exit.success());
        assert_eq!(CHILD_SAW.load(SeqCst), 42);
    }

    extern "C" fn exit_three(_arg: *mut c_void) -> c_int {
        3
    }

    extern "C" fn sleepy_entry(_arg: *mut c_void) -> c_int {
        // SAFETY: sleep has no preconditions.
        unsafe { libc::sleep(5) };
        0
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn reap_collects_a_finished_child() {
        let arena = StackArena::new(256 * 1024).expect("mmap");
        let pid = unsafe { clone_with_stack(exit_three, &arena, ptr::null_mut()) }.expect("clone");
        let manager = TimeoutManager::new(std::time::Duration::from_secs(5));
        let exit = reap_child_non_blocking(pid, &manager).expect("reap");
        assert_eq!(exit, Some(ChildExit::Exited(3)));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn reap_times_out_on_a_hung_child() {
        let arena = StackArena::new(256 * 1024).expect("mmap");
        let pid = unsafe { clone_with_stack(sleepy_entry, &arena, ptr::null_mut()) }.expect("clone");
        let manager = TimeoutManager::new(std::time::Duration::from_millis(50));
        assert_eq!(
            reap_child_non_blocking(pid, &manager),
            Err(WaitError::Timeout)
        );
        // The child is still ours to clean up after a timeout.
        // SAFETY: pid refers to the child cloned above.
        unsafe { libc::kill(pid.as_raw(), libc::SIGKILL) };
        let exit = wait_for_exit(pid).expect("wait");
        assert_eq!(exit, ChildExit::Signaled(libc::SIGKILL));
    }

    #[test]
    fn child_exit_success_only_for_zero() {
        assert!(ChildExit::Exited(0).success());
        assert!(!ChildExit::Exited(1).success());
        assert!(!ChildExit::Signaled(9).success());
    }
}
