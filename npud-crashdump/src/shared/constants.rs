// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Fixed sizes and identifiers of the binary dump artifact, plus the exit
//! code contract of the `npud-dump-reader` companion binary.

use std::time::Duration;

/// First two bytes of every dump file ("NP"). A reader must reject any file
/// whose magic or version does not match exactly.
pub const DUMP_MAGIC: u16 = 0x4E50;
pub const DUMP_VERSION: u16 = 1;

/// Upper bound on thread records in one dump.
pub const MAX_DUMP_THREADS: usize = 32;
/// Upper bound on recorded frames per thread. A frame count of -1 marks an
/// unwind failure with a diagnostic string in the first frame slot.
pub const MAX_STACK_DEPTH: usize = 64;
/// Each frame is stored as one bounded, pre-formatted text line.
pub const FRAME_TEXT_LEN: usize = 128;
/// Kernel thread names (`comm`) are at most 15 bytes plus NUL.
pub const THREAD_NAME_LEN: usize = 16;
pub const PROG_NAME_LEN: usize = 32;
/// Fixed ring of free-form diagnostic lines carried inside the dump.
pub const LOG_RING_LINES: usize = 64;
pub const LOG_LINE_LEN: usize = 128;
/// Register slots in the ProcessInfo record, sized for the largest
/// supported architecture (aarch64: x0..x30, sp, pc, pstate).
pub const MAX_REGISTERS: usize = 34;

/// Substituted whenever a thread's name cannot be read.
pub const UNKNOWN_THREAD_NAME: &str = "unknown";

pub const DUMP_FILE_EXTENSION: &str = "bin";
pub const REPORT_FILE_EXTENSION: &str = "txt";

/// Environment override for the diagnostics root directory; falls back to
/// `$HOME/npud/diag`, then `/tmp/npud/diag`.
pub const DIAG_PATH_ENV: &str = "NPUD_DIAG_PATH";
pub const DEFAULT_DIAG_SUBDIR: &str = "npud/diag";

/// Longest path the recorder will construct or the reader will accept.
pub const MAX_DUMP_PATH: usize = 4096;

pub const DEFAULT_EVENT_NAME: &str = "crash";

/// Stack handed to the cloned collector process; allocated once at init.
pub const COLLECTOR_STACK_SIZE: usize = 1024 * 1024;

/// Bounded ptrace-attach retry loop inside the collector.
pub const ATTACH_RETRY_LIMIT: u32 = 10;
pub const ATTACH_RETRY_BACKOFF: Duration = Duration::from_millis(20);

pub const DEFAULT_DUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the reader waits for the incident directory to appear before
/// giving up with [`EXIT_DIR_TIMEOUT`].
pub const READER_DIR_WAIT: Duration = Duration::from_secs(5);

// Exit codes of npud-dump-reader; the contract between the collector and
// the post-mortem tool.
pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGS: i32 = 2;
pub const EXIT_DIR_TIMEOUT: i32 = 3;
pub const EXIT_LOG_INIT: i32 = 4;
pub const EXIT_DUMP_FAILED: i32 = 5;

/// The internally defined diagnostic signal. Its queued payload carries a
/// 32-bit mode selecting the dump strategy (see
/// [`crate::DumpMode`]). Real-time signal numbers are resolved at runtime.
pub fn diagnostic_signum() -> i32 {
    libc::SIGRTMIN() + 8
}
