// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Spawns and supervises the collector process.
//!
//! The collector runs in a separate process created with a caller-supplied,
//! preallocated stack and a shared address space, so it can read the
//! crashing process's memory directly without touching its heap. Every
//! buffer it writes into is a process-wide static for the same reason: the
//! crashing process may hold the allocator lock, so neither side of the
//! spawn may allocate.

use super::crash_handler::CrashContext;
use super::thread_control;
use crate::dump::buffer::{DumpBuffer, ProcessInfo, ThreadSnapshot};
use crate::recorder::fmtbuf::FixedWriter;
use crate::recorder::paths::{build_artifact_path, create_dir_idempotent, RawPath};
use crate::recorder::sysinfo::capture_system_info;
use crate::recorder::{RawFile, RecorderError};
use crate::shared::configuration::DumpMode;
use crate::shared::constants::{
    ATTACH_RETRY_BACKOFF, ATTACH_RETRY_LIMIT, COLLECTOR_STACK_SIZE, DEFAULT_DUMP_TIMEOUT,
    DUMP_FILE_EXTENSION, FRAME_TEXT_LEN, LOG_LINE_LEN, MAX_DUMP_THREADS, REPORT_FILE_EXTENSION,
    THREAD_NAME_LEN,
};
use libc::{c_int, c_void};
use npud_common::timeout::TimeoutManager;
use npud_common::unix_utils::{
    clone_with_stack, reap_child_non_blocking, terminate, wait_for_exit, StackArena, WaitError,
};
use nix::unistd::Pid;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering::SeqCst};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("collector stack was not allocated at init")]
    NoStack,
    #[error(transparent)]
    Spawn(#[from] npud_common::unix_utils::SpawnError),
    #[error(transparent)]
    Wait(#[from] npud_common::unix_utils::WaitError),
    #[error("collector exited with status {0}")]
    CollectorFailed(i32),
    #[error("collector was killed by signal {0}")]
    CollectorSignaled(i32),
    #[error("collector did not finish within the configured timeout")]
    Timeout,
    #[error("collector exit status was reaped elsewhere")]
    CollectorLost,
}

/// Everything the collector needs, copied out of the handler's stack frame
/// before the clone. The original siginfo/ucontext memory may be reclaimed
/// while the collector is still running.
pub(crate) struct CollectorArgs {
    pub context: CrashContext,
    pub mode: DumpMode,
    /// Exec the reader binary over the collector once the dump is written.
    pub exec_reader: bool,
}

impl CollectorArgs {
    const fn empty() -> Self {
        Self {
            context: CrashContext::empty(),
            mode: DumpMode::FullProcessBinary,
            exec_reader: false,
        }
    }
}

// Single-writer statics shared with the cloned collector. The spin lock in
// the crash router serializes all access.
struct SharedCell<T>(UnsafeCell<T>);
// SAFETY: access is serialized by the router's crash lock.
unsafe impl<T> Sync for SharedCell<T> {}

static ARGS: SharedCell<CollectorArgs> = SharedCell(UnsafeCell::new(CollectorArgs::empty()));
static DUMP: SharedCell<DumpBuffer> = SharedCell(UnsafeCell::new(DumpBuffer::new()));
static SCRATCH_THREAD: SharedCell<ThreadSnapshot> =
    SharedCell(UnsafeCell::new(ThreadSnapshot::new(0)));

static STACK: AtomicPtr<StackArena> = AtomicPtr::new(ptr::null_mut());

/// Upper bound on one collector run, staged at init from the
/// configuration. Read on the crash path, so it lives in an atomic rather
/// than behind the config pointer.
static DUMP_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_DUMP_TIMEOUT.as_millis() as u64);

/// Path to the reader binary, prepared at init; empty when unresolved.
static READER_PATH: SharedCell<RawPath> = SharedCell(UnsafeCell::new(RawPath::empty()));

// Threads the collector currently has attached, for emergency detach when
// the collector itself takes a fatal signal mid-dump.
const NO_TID: i32 = -1;
static ATTACHED: [AtomicI32; MAX_DUMP_THREADS] = [const { AtomicI32::new(NO_TID) }; MAX_DUMP_THREADS];
static ATTACHED_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Allocates the collector stack and stages the dump timeout. Called once
/// at init, never on the crash path.
pub(crate) fn init_spawner(reader_binary: Option<&str>, timeout: Duration) -> anyhow::Result<()> {
    if STACK.load(SeqCst).is_null() {
        let arena = Box::new(StackArena::new(COLLECTOR_STACK_SIZE)?);
        let old = STACK.swap(Box::into_raw(arena), SeqCst);
        anyhow::ensure!(old.is_null(), "collector stack initialized twice");
    }
    DUMP_TIMEOUT_MS.store(timeout.as_millis() as u64, SeqCst);
    let resolved = match reader_binary {
        Some(path) => path.to_string(),
        None => default_reader_path()?,
    };
    // SAFETY: init runs before any handler is installed; nothing else is
    // reading the cell yet.
    unsafe {
        *READER_PATH.0.get() = RawPath::from_str(&resolved)
            .map_err(|e| anyhow::anyhow!("reader path rejected: {e}"))?;
    }
    Ok(())
}

/// The reader ships next to whatever executable linked this library.
fn default_reader_path() -> anyhow::Result<String> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("current executable has no parent directory"))?;
    Ok(dir.join("npud-dump-reader").to_string_lossy().into_owned())
}

/// Fills the shared argument block. Caller holds the crash lock.
pub(crate) unsafe fn stage_args(context: &CrashContext, mode: DumpMode, exec_reader: bool) {
    let args = unsafe { &mut *ARGS.0.get() };
    args.context = context.clone();
    args.mode = mode;
    args.exec_reader = exec_reader;
}

/// Spawns the collector on the preallocated stack, authorizes it to trace
/// us, and waits for it within the configured timeout. A collector that
/// outlives the budget is killed so a wedged ptrace never hangs the
/// crashing process forever.
pub(crate) fn spawn_and_wait() -> Result<(), LaunchError> {
    let stack = STACK.load(SeqCst);
    if stack.is_null() {
        return Err(LaunchError::NoStack);
    }
    // SAFETY: the arena is allocated once and never freed.
    let stack = unsafe { &*stack };

    // The collector must be able to ptrace us even under a restrictive
    // yama policy. Dumpable additionally re-enables tracing for processes
    // that dropped it via setuid transitions.
    // SAFETY: prctl with integer arguments only.
    unsafe {
        libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
    }

    // SAFETY: collector_entry only touches the shared statics staged above;
    // the argument block outlives the child.
    let pid = unsafe { clone_with_stack(collector_entry, stack, ARGS.0.get() as *mut c_void) }?;

    // Best effort: older kernels lack PR_SET_PTRACER and the attach may
    // still succeed through dumpable alone.
    // SAFETY: prctl with integer arguments only.
    unsafe {
        libc::prctl(libc::PR_SET_PTRACER, pid.as_raw(), 0, 0, 0);
    }

    let budget = TimeoutManager::new(Duration::from_millis(DUMP_TIMEOUT_MS.load(SeqCst)));
    let exit = match reap_child_non_blocking(pid, &budget) {
        Err(WaitError::Timeout) => {
            // SAFETY: pid refers to the collector cloned above.
            unsafe { libc::kill(pid.as_raw(), libc::SIGKILL) };
            let _ = wait_for_exit(pid);
            return Err(LaunchError::Timeout);
        }
        other => other?,
    };
    match exit {
        Some(exit) if exit.success() => Ok(()),
        Some(npud_common::unix_utils::ChildExit::Exited(code)) => {
            Err(LaunchError::CollectorFailed(code))
        }
        Some(npud_common::unix_utils::ChildExit::Signaled(sig)) => {
            Err(LaunchError::CollectorSignaled(sig))
        }
        None => Err(LaunchError::CollectorLost),
    }
}

/// Detaches every thread the collector still holds and kills the collector.
/// Called by the crash router when a signal lands in the collector itself.
pub(crate) fn emergency_detach_and_exit() -> ! {
    let count = ATTACHED_COUNT.load(SeqCst).min(MAX_DUMP_THREADS);
    for slot in ATTACHED.iter().take(count) {
        let tid = slot.swap(NO_TID, SeqCst);
        if tid != NO_TID {
            let _ = thread_control::resume(Pid::from_raw(tid));
        }
    }
    terminate()
}

fn note_attached(tid: i32) {
    let index = ATTACHED_COUNT.fetch_add(1, SeqCst);
    if index < MAX_DUMP_THREADS {
        ATTACHED[index].store(tid, SeqCst);
    }
}

fn note_detached(tid: i32) {
    for slot in &ATTACHED {
        let _ = slot.compare_exchange(tid, NO_TID, SeqCst, SeqCst);
    }
}

extern "C" fn collector_entry(arg: *mut c_void) -> c_int {
    // The collector must outlive an operator's ^C aimed at the crashing
    // application.
    // SAFETY: installing SIG_IGN dispositions.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
    let args = unsafe { &*(arg as *const CollectorArgs) };
    match collect(args) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[derive(Debug, thiserror::Error)]
enum CollectError {
    #[error("attach retries exhausted for thread {0}")]
    AttachExhausted(i32),
    #[error(transparent)]
    Thread(#[from] thread_control::ThreadControlError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Format(#[from] crate::dump::buffer::DumpFormatError),
}

fn backoff() {
    let ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: ATTACH_RETRY_BACKOFF.subsec_nanos() as libc::c_long,
    };
    // SAFETY: ts is a live local.
    unsafe { libc::nanosleep(&ts, ptr::null_mut()) };
}

/// Attach with bounded retry: the target thread may still be inside the
/// kernel delivering the crash signal when the first attempts arrive.
fn suspend_with_retry(tid: Pid) -> Result<(), CollectError> {
    for _ in 0..ATTACH_RETRY_LIMIT {
        match thread_control::suspend(tid) {
            Ok(()) => {
                note_attached(tid.as_raw());
                return Ok(());
            }
            Err(thread_control::ThreadControlError::Attach { .. }) => backoff(),
            Err(e) => return Err(e.into()),
        }
    }
    Err(CollectError::AttachExhausted(tid.as_raw()))
}

fn resume_and_forget(tid: Pid) {
    let _ = thread_control::resume(tid);
    note_detached(tid.as_raw());
}

/// Captures one suspended thread into the scratch snapshot. The shared
/// address space lets the frame walker read the target's stack directly.
fn capture_thread(pid: i32, tid: Pid, snapshot: &mut ThreadSnapshot) {
    use super::frame_walker;
    use crate::dump::buffer::Arch;
    use crate::shared::constants::MAX_REGISTERS;

    snapshot.reset(tid.as_raw());
    let mut name = [0u8; THREAD_NAME_LEN];
    let n = thread_control::thread_name(pid, tid.as_raw(), &mut name);
    snapshot.set_name(&name[..n]);

    let mut regs = [0u64; MAX_REGISTERS];
    let count = match thread_control::registers(tid, &mut regs) {
        Ok(count) => count,
        Err(_) => {
            snapshot.set_unwind_failure("register read failed");
            return;
        }
    };
    let Some(start) = frame_walker::frame_from_registers(&regs, count, Arch::host()) else {
        snapshot.set_unwind_failure("no start frame for this architecture");
        return;
    };
    // SAFETY: the target shares our address space and is stopped; the
    // walker bounds every dereference.
    unsafe {
        frame_walker::walk(start, |index, frame| {
            let mut line = [0u8; FRAME_TEXT_LEN];
            let mut w = FixedWriter::new(&mut line);
            frame_walker::push_frame_line(&mut w, index, frame);
            let n = w.len();
            snapshot.push_frame(&line[..n]).is_ok()
        });
    }
}

fn collect(args: &CollectorArgs) -> Result<(), CollectError> {
    let context = &args.context;
    create_dir_idempotent(&context.incident_dir)?;

    // SAFETY: single writer; the crashing process is blocked in waitpid.
    let dump = unsafe { &mut *DUMP.0.get() };
    let snapshot = unsafe { &mut *SCRATCH_THREAD.0.get() };
    dump.reset();
    dump.write_header()?;
    dump.set_process_info(&process_info_from(context))?;

    let mut tids = [0i32; MAX_DUMP_THREADS];
    let tid_count = match args.mode {
        DumpMode::SingleThreadBinary => {
            tids[0] = context.tid;
            1
        }
        _ => thread_control::list_threads(context.pid, &mut tids)?,
    };

    let mut log = [0u8; LOG_LINE_LEN];
    let mut w = FixedWriter::new(&mut log);
    w.push_str("collector attached, threads ").push_dec(tid_count as u64);
    let n = w.len();
    dump.log_line(&log[..n]);

    for &tid in &tids[..tid_count] {
        let tid = Pid::from_raw(tid);
        if let Err(e) = suspend_with_retry(tid) {
            // One unreachable thread does not abort the dump.
            snapshot.reset(tid.as_raw());
            snapshot.set_unwind_failure("thread could not be suspended");
            let _ = dump.add_thread(snapshot);
            if matches!(e, CollectError::AttachExhausted(_)) && tid.as_raw() == context.tid {
                // The faulting thread is the one dump that matters.
                return Err(e);
            }
            continue;
        }
        capture_thread(context.pid, tid, snapshot);
        let _ = dump.add_thread(snapshot);
        resume_and_forget(tid);
    }

    let outcome = match args.mode {
        DumpMode::FullProcessText => write_text_artifact(context, dump),
        _ => write_binary_artifact(context, dump, args.exec_reader),
    };
    dump.reset();
    outcome
}

fn process_info_from(context: &CrashContext) -> ProcessInfo {
    ProcessInfo {
        pid: context.pid,
        tid: context.tid,
        signum: context.signum,
        si_code: context.si_code,
        fault_addr: context.fault_addr,
        mono_secs: context.mono_secs,
        mono_nanos: context.mono_nanos,
        wall_secs: context.wall_secs,
        arch: context.arch,
        prog: context.prog,
        regs: context.regs,
    }
}

fn write_binary_artifact(
    context: &CrashContext,
    dump: &DumpBuffer,
    exec_reader: bool,
) -> Result<(), CollectError> {
    let mut path = RawPath::empty();
    build_artifact_path(
        &mut path,
        &context.incident_dir,
        context.signum,
        context.tid,
        context.prog_name_bytes(),
        context.wall_secs,
        DUMP_FILE_EXTENSION,
    )?;
    let file = RawFile::create(&path)?;
    file.write_full(dump.as_bytes())?;
    drop(file);

    capture_system_info(&context.incident_dir, context.pid);

    if exec_reader {
        exec_reader_over_self(&path);
        // Exec failed; the binary artifact still exists for the async tool.
    }
    Ok(())
}

/// Replaces the collector with the reader binary, passing the dump path as
/// argv[1]. Only returns when exec fails.
fn exec_reader_over_self(dump_path: &RawPath) {
    // SAFETY: reader path was staged at init and is only read here.
    let reader = unsafe { &*READER_PATH.0.get() };
    if reader.is_empty() {
        return;
    }
    let argv = [reader.as_c_ptr(), dump_path.as_c_ptr(), ptr::null()];
    let envp = [ptr::null::<libc::c_char>()];
    // SAFETY: both pointer arrays are NUL-terminated and reference live
    // NUL-terminated buffers.
    unsafe {
        libc::execve(reader.as_c_ptr(), argv.as_ptr(), envp.as_ptr());
    }
}

/// Renders the dump as text straight from the collector, without
/// allocating: every line goes through a fixed writer.
fn write_text_artifact(context: &CrashContext, dump: &DumpBuffer) -> Result<(), CollectError> {
    let view = crate::dump::buffer::DumpView::parse(dump.as_bytes())?;
    let mut path = RawPath::empty();
    build_artifact_path(
        &mut path,
        &context.incident_dir,
        context.signum,
        context.tid,
        context.prog_name_bytes(),
        context.wall_secs,
        REPORT_FILE_EXTENSION,
    )?;
    let file = RawFile::create(&path)?;

    let mut line = [0u8; FRAME_TEXT_LEN + THREAD_NAME_LEN + 32];
    let mut w = FixedWriter::new(&mut line);
    w.push_str("process ")
        .push_signed(context.pid as i64)
        .push_str(" signal ")
        .push_signed(context.signum as i64)
        .push_str(" fault ")
        .push_hex(context.fault_addr)
        .push_str("\n");
    let n = w.len();
    file.write_full(&line[..n])?;

    for thread in view.threads() {
        let mut w = FixedWriter::new(&mut line);
        w.push_str("thread ")
            .push_signed(thread.tid() as i64)
            .push_str(" ")
            .push_str(thread.name())
            .push_str("\n");
        let n = w.len();
        file.write_full(&line[..n])?;
        if let Some(message) = thread.diagnostic() {
            file.write_full(b"  unwind failed: ")?;
            file.write_full(message)?;
            file.write_full(b"\n")?;
            continue;
        }
        for frame in thread.frames() {
            file.write_full(b"  ")?;
            file.write_full(frame)?;
            file.write_full(b"\n")?;
        }
    }

    capture_system_info(&context.incident_dir, context.pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_without_stack_is_rejected() {
        // The spawner static starts unset in a fresh test process.
        if STACK.load(SeqCst).is_null() {
            assert!(matches!(spawn_and_wait(), Err(LaunchError::NoStack)));
        }
    }

    #[test]
    fn init_stages_reader_path_and_timeout() {
        init_spawner(
            Some("/opt/npud/bin/npud-dump-reader"),
            Duration::from_millis(1234),
        )
        .unwrap();
        // SAFETY: test-only read after init.
        let reader = unsafe { &*READER_PATH.0.get() };
        assert_eq!(reader.as_str(), Some("/opt/npud/bin/npud-dump-reader"));
        assert_eq!(DUMP_TIMEOUT_MS.load(SeqCst), 1234);
    }

    #[test]
    fn attached_bookkeeping_round_trips() {
        note_attached(4242);
        note_detached(4242);
        assert!(ATTACHED.iter().all(|slot| slot.load(SeqCst) != 4242));
    }
}
