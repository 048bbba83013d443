// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! The crash signal router. The handler body runs under full
//! async-signal-safety constraints until the re-entrancy checks have
//! passed: atomics only, no allocation, no library calls that might take a
//! lock the interrupted code already holds.

use super::dumper_manager;
use super::frame_walker;
use super::signal_handler_manager;
use crate::dump::buffer::Arch;
use crate::recorder::fmtbuf::FixedWriter;
use crate::recorder::paths::{build_artifact_path, build_incident_dir, create_dir_idempotent, RawPath};
use crate::recorder::{RawFile, RecorderError};
use crate::shared::configuration::DumpMode;
use crate::shared::constants::{
    diagnostic_signum, FRAME_TEXT_LEN, MAX_REGISTERS, PROG_NAME_LEN, REPORT_FILE_EXTENSION,
};
use libc::{c_int, c_void, siginfo_t};
use std::cell::UnsafeCell;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicUsize,
    Ordering::SeqCst,
};

/// Event-name bytes staged at init; single path component, validated by the
/// configuration.
const EVENT_NAME_CAP: usize = 64;

/// One crash, captured inside the handler from the OS-delivered payload.
/// Copied, never referenced, into the collector's argument block: the
/// handler frame this was built on may be gone while the collector runs.
#[derive(Clone)]
pub(crate) struct CrashContext {
    pub pid: i32,
    pub tid: i32,
    pub signum: i32,
    pub si_code: i32,
    pub fault_addr: u64,
    pub mono_secs: u64,
    pub mono_nanos: u32,
    pub wall_secs: i64,
    pub arch: Arch,
    pub regs: [u64; MAX_REGISTERS],
    pub reg_count: usize,
    pub prog: [u8; PROG_NAME_LEN],
    pub incident_dir: RawPath,
}

impl CrashContext {
    pub(crate) const fn empty() -> Self {
        Self {
            pid: 0,
            tid: 0,
            signum: 0,
            si_code: 0,
            fault_addr: 0,
            mono_secs: 0,
            mono_nanos: 0,
            wall_secs: 0,
            arch: Arch::Unknown,
            regs: [0; MAX_REGISTERS],
            reg_count: 0,
            prog: [0; PROG_NAME_LEN],
            incident_dir: RawPath::empty(),
        }
    }

    pub(crate) fn prog_name_bytes(&self) -> &[u8] {
        let end = self
            .prog
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.prog.len());
        &self.prog[..end]
    }
}

struct StagedCell<T>(UnsafeCell<T>);
// SAFETY: written once at init, before any handler can observe it.
unsafe impl<T> Sync for StagedCell<T> {}

static ENABLED: AtomicBool = AtomicBool::new(false);
/// Pid recorded at crash time. A mismatch with getpid() means the signal
/// landed inside a spawned collector, which shares these statics.
static CRASH_PID: AtomicI32 = AtomicI32::new(0);
/// Tid of the thread currently being handled; re-delivery to it is a
/// handler fault, not a new crash.
static CRASH_TID: AtomicI32 = AtomicI32::new(0);
static HARD_EXIT: AtomicBool = AtomicBool::new(false);
static CALLBACK_FIRED: AtomicBool = AtomicBool::new(false);
/// One crash handled at a time; losers of this race decline.
static HANDLING: AtomicBool = AtomicBool::new(false);
/// Registered diagnostic callback as a raw fn address; 0 when unset.
static CALLBACK: AtomicUsize = AtomicUsize::new(0);

static DIAG_ROOT: StagedCell<RawPath> = StagedCell(UnsafeCell::new(RawPath::empty()));
static EVENT_NAME: StagedCell<([u8; EVENT_NAME_CAP], usize)> =
    StagedCell(UnsafeCell::new(([0; EVENT_NAME_CAP], 0)));
static PROG_NAME: StagedCell<[u8; PROG_NAME_LEN]> =
    StagedCell(UnsafeCell::new([0; PROG_NAME_LEN]));

/// Registers the function invoked exactly once after the collector has run
/// (successfully or not). Used by the tracer to flush its ring buffers
/// while the process is still alive.
pub fn register_crash_callback(callback: extern "C" fn()) {
    CALLBACK.store(callback as usize, SeqCst);
}

/// Marks the process as past the point of orderly crash handling; any
/// further signal delivery declines immediately.
pub fn begin_hard_exit() {
    HARD_EXIT.store(true, SeqCst);
}

pub(crate) fn enable() {
    ENABLED.store(true, SeqCst);
}

pub(crate) fn disable() {
    ENABLED.store(false, SeqCst);
}

pub fn enabled() -> bool {
    ENABLED.load(SeqCst)
}

/// Stages everything the handler will need, so the crash path itself never
/// allocates or parses. Called once from init, before registration.
pub(crate) fn stage(diag_root: &str, event_name: &str) -> anyhow::Result<()> {
    let root = RawPath::from_str(diag_root)
        .map_err(|e| anyhow::anyhow!("diagnostics root rejected: {e}"))?;
    anyhow::ensure!(
        event_name.len() <= EVENT_NAME_CAP,
        "event name exceeds {EVENT_NAME_CAP} bytes"
    );
    let prog = std::fs::read_to_string("/proc/self/comm").unwrap_or_default();
    // SAFETY: init-time single-threaded staging, before handlers exist.
    unsafe {
        *DIAG_ROOT.0.get() = root;
        let (buf, len) = &mut *EVENT_NAME.0.get();
        buf[..event_name.len()].copy_from_slice(event_name.as_bytes());
        *len = event_name.len();
        let prog_cell = &mut *PROG_NAME.0.get();
        let trimmed = prog.trim_end();
        let take = trimmed.len().min(PROG_NAME_LEN - 1);
        prog_cell[..take].copy_from_slice(&trimmed.as_bytes()[..take]);
    }
    Ok(())
}

fn gettid() -> i32 {
    // SAFETY: no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

fn now(clock: libc::clockid_t) -> (i64, u32) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a live local.
    unsafe { libc::clock_gettime(clock, &mut ts) };
    (ts.tv_sec as i64, ts.tv_nsec as u32)
}

/// Declines the signal: diagnostic signals return to the interrupted code,
/// fatal ones die the way the OS would have without us.
fn decline(signum: c_int, fatal: bool) {
    if fatal {
        signal_handler_manager::restore_default_and_raise(signum);
    }
}

/// The installed signal handler.
pub(crate) extern "C" fn handle_signal(signum: c_int, info: *mut siginfo_t, uc: *mut c_void) {
    let fatal = signum != diagnostic_signum();

    // Re-entrancy checks, in order, before any shared state is touched.
    if !ENABLED.load(SeqCst) {
        decline(signum, fatal);
        return;
    }
    // SAFETY: getpid has no preconditions.
    let my_pid = unsafe { libc::getpid() };
    let recorded_pid = CRASH_PID.load(SeqCst);
    if recorded_pid != 0 && recorded_pid != my_pid {
        // We are the collector: these statics are shared through the
        // cloned address space. Let go of the target and die.
        dumper_manager::emergency_detach_and_exit();
    }
    let my_tid = gettid();
    if CRASH_TID.load(SeqCst) == my_tid {
        // The handler itself faulted.
        decline(signum, fatal);
        return;
    }
    if HARD_EXIT.load(SeqCst) {
        decline(signum, fatal);
        return;
    }
    if HANDLING
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_err()
    {
        // Another thread's crash is already in flight; it will take the
        // process down (or finish the diagnostic dump).
        decline(signum, fatal);
        return;
    }

    CRASH_PID.store(my_pid, SeqCst);
    CRASH_TID.store(my_tid, SeqCst);

    let mode = dump_mode_for(signum, info);
    let context = build_context(signum, info, uc, my_pid, my_tid);
    let launched = launch(&context, mode, fatal);

    fire_callback_once();

    if launched.is_err() {
        let _ = fallback_dump(&context);
    }

    // A later, unrelated crash must not be mistaken for recursion into
    // this one.
    CRASH_TID.store(0, SeqCst);

    if fatal {
        begin_hard_exit();
        HANDLING.store(false, SeqCst);
        // SAFETY: called from the handler with the original payload.
        if !unsafe { signal_handler_manager::chain_displaced(signum, info, uc) } {
            signal_handler_manager::restore_default_and_raise(signum);
        }
        return;
    }

    CRASH_PID.store(0, SeqCst);
    CALLBACK_FIRED.store(false, SeqCst);
    HANDLING.store(false, SeqCst);
}

/// The diagnostic signal's queued payload selects the dump strategy; an
/// out-of-range payload and every fatal signal take the full binary path.
fn dump_mode_for(signum: c_int, info: *mut siginfo_t) -> DumpMode {
    if signum != diagnostic_signum() || info.is_null() {
        return DumpMode::FullProcessBinary;
    }
    // SAFETY: the kernel delivered this siginfo for a queued RT signal.
    let payload = unsafe { (*info).si_value().sival_ptr } as usize as i32;
    DumpMode::try_from(payload).unwrap_or(DumpMode::FullProcessBinary)
}

fn build_context(
    signum: c_int,
    info: *mut siginfo_t,
    uc: *mut c_void,
    pid: i32,
    tid: i32,
) -> CrashContext {
    let mut context = CrashContext::empty();
    context.pid = pid;
    context.tid = tid;
    context.signum = signum;
    context.arch = Arch::host();
    if !info.is_null() {
        // SAFETY: info was delivered by the kernel to this handler.
        unsafe {
            context.si_code = (*info).si_code;
            context.fault_addr = (*info).si_addr() as u64;
        }
    }
    let (mono_secs, mono_nanos) = now(libc::CLOCK_MONOTONIC);
    context.mono_secs = mono_secs as u64;
    context.mono_nanos = mono_nanos;
    let (wall_secs, _) = now(libc::CLOCK_REALTIME);
    context.wall_secs = wall_secs;
    // SAFETY: the ucontext came straight from the kernel.
    context.reg_count =
        unsafe { frame_walker::registers_from_ucontext(uc as *const libc::ucontext_t, &mut context.regs) };

    // SAFETY: staged once at init, read-only afterwards.
    let (event, event_len, root) = unsafe {
        let (buf, len) = &*EVENT_NAME.0.get();
        (buf, *len, &*DIAG_ROOT.0.get())
    };
    // SAFETY: same staging discipline.
    context.prog = unsafe { *PROG_NAME.0.get() };
    let _ = build_incident_dir(
        &mut context.incident_dir,
        root,
        &event[..event_len],
        pid,
        wall_secs,
    );
    context
}

fn launch(context: &CrashContext, mode: DumpMode, fatal: bool) -> Result<(), dumper_manager::LaunchError> {
    let _ = create_dir_idempotent(&context.incident_dir);
    // Only an explicitly requested full binary dump hands the artifact to
    // the reader; fatal dumps leave the .bin for the asynchronous tool.
    let exec_reader = !fatal && mode == DumpMode::FullProcessBinary;
    // SAFETY: the crash lock is held; no other writer exists.
    unsafe { dumper_manager::stage_args(context, mode, exec_reader) };
    dumper_manager::spawn_and_wait()
}

fn fire_callback_once() {
    if CALLBACK_FIRED
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_ok()
    {
        let callback = CALLBACK.load(SeqCst);
        if callback != 0 {
            // SAFETY: the address was stored from a typed fn pointer.
            let callback: extern "C" fn() = unsafe { std::mem::transmute(callback) };
            callback();
        }
    }
}

/// Same-process, allocation-free last resort: walk our own frame-pointer
/// chain and write it straight to a text artifact.
pub(crate) fn fallback_dump(context: &CrashContext) -> Result<(), RecorderError> {
    create_dir_idempotent(&context.incident_dir)?;
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

    let mut line = [0u8; FRAME_TEXT_LEN];
    let mut w = FixedWriter::new(&mut line);
    w.push_str("fallback dump: pid ")
        .push_signed(context.pid as i64)
        .push_str(" tid ")
        .push_signed(context.tid as i64)
        .push_str(" signal ")
        .push_signed(context.signum as i64)
        .push_str(" fault ")
        .push_hex(context.fault_addr)
        .push_str("\n");
    let n = w.len();
    file.write_full(&line[..n])?;

    let Some(start) = frame_walker::frame_from_registers(&context.regs, context.reg_count, context.arch)
    else {
        return file.write_full(b"no start frame available\n");
    };
    let mut failure = None;
    // SAFETY: walking our own live stack; each dereference is bounds-checked.
    unsafe {
        frame_walker::walk(start, |index, frame| {
            let mut line = [0u8; FRAME_TEXT_LEN];
            let mut w = FixedWriter::new(&mut line);
            frame_walker::push_frame_line(&mut w, index, frame);
            w.push_str("\n");
            let n = w.len();
            match file.write_full(&line[..n]) {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        });
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
