// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Per-thread suspension and inspection via ptrace. Runs inside the
//! collector process after it has been authorized to trace the crash
//! target. Waits retry only on interruption; nothing here spins.

use crate::recorder::fmtbuf::FixedWriter;
use crate::recorder::paths::RawPath;
use crate::recorder::{read_line, RecorderError};
use crate::shared::constants::{MAX_DUMP_THREADS, MAX_REGISTERS, UNKNOWN_THREAD_NAME};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ThreadControlError {
    #[error("ptrace attach to {tid} failed: {errno}")]
    Attach { tid: i32, errno: Errno },
    #[error("wait for {tid} to stop failed: {errno}")]
    Wait { tid: i32, errno: Errno },
    #[error("thread {tid} vanished while stopping (status {status:?})")]
    Vanished { tid: i32, status: WaitStatus },
    #[error("ptrace detach from {tid} failed: {errno}")]
    Detach { tid: i32, errno: Errno },
    #[error("register read for {tid} failed (errno {errno})")]
    Registers { tid: i32, errno: i32 },
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

/// Attaches to `tid` and blocks until it reports the attach stop. Signals
/// that were already pending on the target are re-injected and waited
/// through rather than swallowed.
pub fn suspend(tid: Pid) -> Result<(), ThreadControlError> {
    ptrace::attach(tid).map_err(|errno| ThreadControlError::Attach {
        tid: tid.as_raw(),
        errno,
    })?;
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(()),
            Ok(WaitStatus::Stopped(_, other)) => {
                // A different signal was pending; hand it back and keep
                // waiting for our stop.
                ptrace::cont(tid, other).map_err(|errno| ThreadControlError::Wait {
                    tid: tid.as_raw(),
                    errno,
                })?;
            }
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Err(ThreadControlError::Vanished {
                    tid: tid.as_raw(),
                    status,
                })
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                return Err(ThreadControlError::Wait {
                    tid: tid.as_raw(),
                    errno,
                })
            }
        }
    }
}

pub fn resume(tid: Pid) -> Result<(), ThreadControlError> {
    ptrace::detach(tid, None).map_err(|errno| ThreadControlError::Detach {
        tid: tid.as_raw(),
        errno,
    })
}

/// Raw register bytes as the kernel lays them out; large enough for any
/// supported architecture's general-purpose set.
const REGISTER_BUF_LEN: usize = 512;

/// Reads the general-purpose registers of a stopped thread into `out`,
/// returning how many 64-bit slots were filled.
///
/// PTRACE_GETREGSET with NT_PRSTATUS is the primary mechanism; kernels or
/// architectures without it fall back to PTRACE_GETREGS where that request
/// exists.
pub fn registers(tid: Pid, out: &mut [u64; MAX_REGISTERS]) -> Result<usize, ThreadControlError> {
    let mut raw = [0u8; REGISTER_BUF_LEN];
    let mut iov = libc::iovec {
        iov_base: raw.as_mut_ptr() as *mut libc::c_void,
        iov_len: raw.len(),
    };
    // SAFETY: iov points at a live local buffer; the thread is stopped.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid.as_raw(),
            libc::NT_PRSTATUS as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    let filled = if rc == 0 {
        iov.iov_len
    } else {
        getregs_fallback(tid, &mut raw)?
    };
    let slots = (filled / 8).min(MAX_REGISTERS);
    for (i, slot) in out.iter_mut().take(slots).enumerate() {
        let mut word = [0u8; 8];
        word.copy_from_slice(&raw[i * 8..i * 8 + 8]);
        *slot = u64::from_ne_bytes(word);
    }
    Ok(slots)
}

#[cfg(target_arch = "x86_64")]
fn getregs_fallback(tid: Pid, raw: &mut [u8; REGISTER_BUF_LEN]) -> Result<usize, ThreadControlError> {
    // SAFETY: raw is large enough for user_regs_struct; the thread is stopped.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGS,
            tid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            raw.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if rc != 0 {
        return Err(ThreadControlError::Registers {
            tid: tid.as_raw(),
            errno: Errno::last_raw(),
        });
    }
    Ok(std::mem::size_of::<libc::user_regs_struct>())
}

#[cfg(not(target_arch = "x86_64"))]
fn getregs_fallback(tid: Pid, _raw: &mut [u8; REGISTER_BUF_LEN]) -> Result<usize, ThreadControlError> {
    // No PTRACE_GETREGS request on this architecture.
    Err(ThreadControlError::Registers {
        tid: tid.as_raw(),
        errno: Errno::last_raw(),
    })
}

/// Reads `/proc/<pid>/task/<tid>/comm` into `out`, substituting "unknown"
/// on any failure. Returns the name length. Thread naming is cosmetic, so
/// errors never propagate.
pub fn thread_name(pid: i32, tid: i32, out: &mut [u8]) -> usize {
    if out.is_empty() {
        return 0;
    }
    let mut component = [0u8; 64];
    let mut w = FixedWriter::new(&mut component);
    w.push_str("/proc/")
        .push_signed(pid as i64)
        .push_str("/task/")
        .push_signed(tid as i64)
        .push_str("/comm");
    let n = w.len();
    let mut path = RawPath::empty();
    let read = path
        .push_raw(&component[..n])
        .and_then(|_| read_line(&path, out));
    match read {
        Ok(n) if n > 0 => n,
        _ => {
            let fallback = UNKNOWN_THREAD_NAME.as_bytes();
            let take = fallback.len().min(out.len());
            out[..take].copy_from_slice(&fallback[..take]);
            take
        }
    }
}

/// Lists the live thread ids of `pid` by walking `/proc/<pid>/task` with
/// raw getdents64, capped at the dump's thread capacity. Allocation-free.
pub fn list_threads(pid: i32, out: &mut [i32; MAX_DUMP_THREADS]) -> Result<usize, ThreadControlError> {
    let mut component = [0u8; 64];
    let mut w = FixedWriter::new(&mut component);
    w.push_str("/proc/").push_signed(pid as i64).push_str("/task");
    let n = w.len();
    let mut path = RawPath::empty();
    path.push_raw(&component[..n])?;

    // SAFETY: the path buffer is NUL-terminated by construction.
    let fd = unsafe { libc::open(path.as_c_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
    if fd < 0 {
        return Err(RecorderError::Open(Errno::last_raw()).into());
    }

    let mut count = 0usize;
    let mut dents = [0u8; 4096];
    loop {
        // SAFETY: dents is a live buffer; fd came from open above.
        let nread = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                dents.as_mut_ptr() as *mut libc::c_void,
                dents.len(),
            )
        };
        if nread < 0 {
            if Errno::last_raw() == libc::EINTR {
                continue;
            }
            // SAFETY: fd is live and closed exactly once.
            unsafe { libc::close(fd) };
            return Err(RecorderError::Read(Errno::last_raw()).into());
        }
        if nread == 0 {
            break;
        }
        let mut at = 0usize;
        while at < nread as usize && count < MAX_DUMP_THREADS {
            // linux_dirent64: ino u64, off i64, reclen u16, type u8, name...
            let reclen = u16::from_ne_bytes([dents[at + 16], dents[at + 17]]) as usize;
            let name = &dents[at + 19..at + reclen];
            if let Some(tid) = parse_tid(name) {
                out[count] = tid;
                count += 1;
            }
            at += reclen;
        }
        if count == MAX_DUMP_THREADS {
            break;
        }
    }
    // SAFETY: fd is live and closed exactly once.
    unsafe { libc::close(fd) };
    Ok(count)
}

fn parse_tid(name: &[u8]) -> Option<i32> {
    let mut value: i64 = 0;
    let mut digits = 0;
    for &b in name {
        match b {
            0 => break,
            b'0'..=b'9' => {
                value = value * 10 + (b - b'0') as i64;
                digits += 1;
                if value > i32::MAX as i64 {
                    return None;
                }
            }
            _ => return None,
        }
    }
    (digits > 0).then_some(value as i32)
}
