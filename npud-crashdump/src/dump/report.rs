// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Renders a binary dump into the human-readable `.txt` report. This runs
//! in the post-mortem reader, well away from any signal context, so it is
//! free to allocate and use the standard library.

use super::buffer::{Arch, DumpView, ProcessInfo, ThreadView, DUMP_BUFFER_SIZE};
use crate::shared::constants::{DUMP_FILE_EXTENSION, MAX_DUMP_PATH, REPORT_FILE_EXTENSION};
use chrono::{TimeZone, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Dump path is empty or exceeds {MAX_DUMP_PATH} bytes")]
    InvalidPath,
    #[error("Dump path does not end in .{DUMP_FILE_EXTENSION}")]
    WrongExtension,
    #[error("Dump file not found: {0}")]
    NotFound(PathBuf),
    #[error(transparent)]
    Format(#[from] super::buffer::DumpFormatError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const X86_64_REGISTER_NAMES: [&str; 27] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
    "rsi", "rdi", "orig_rax", "rip", "cs", "eflags", "rsp", "ss", "fs_base", "gs_base", "ds",
    "es", "fs", "gs",
];

fn validate_path(path: &Path) -> Result<(), ReportError> {
    let len = path.as_os_str().len();
    if len == 0 || len >= MAX_DUMP_PATH {
        return Err(ReportError::InvalidPath);
    }
    if path.extension().and_then(|e| e.to_str()) != Some(DUMP_FILE_EXTENSION) {
        return Err(ReportError::WrongExtension);
    }
    if !path.is_file() {
        return Err(ReportError::NotFound(path.to_path_buf()));
    }
    Ok(())
}

/// `uname -a` via a subprocess; the report is complete without it.
fn kernel_banner() -> Option<String> {
    let output = std::process::Command::new("uname").arg("-a").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let banner = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!banner.is_empty()).then_some(banner)
}

fn write_summary(out: &mut String, info: &ProcessInfo) {
    let _ = writeln!(out, "==== process ====");
    let _ = writeln!(out, "program:    {}", info.prog_name());
    let _ = writeln!(out, "pid:        {}", info.pid);
    let _ = writeln!(out, "tid:        {}", info.tid);
    let _ = writeln!(
        out,
        "signal:     {} (si_code {})",
        info.signum, info.si_code
    );
    let _ = writeln!(out, "fault addr: {:#018x}", info.fault_addr);
    if let Some(when) = Utc.timestamp_opt(info.wall_secs, 0).single() {
        let _ = writeln!(out, "wall time:  {}", when.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    let _ = writeln!(
        out,
        "monotonic:  {}.{:09}s",
        info.mono_secs, info.mono_nanos
    );
}

fn write_registers(out: &mut String, info: &ProcessInfo) {
    let _ = writeln!(out, "==== registers ====");
    match info.arch {
        Arch::X86_64 => {
            for (i, name) in X86_64_REGISTER_NAMES.iter().enumerate() {
                let _ = writeln!(out, "{name:>8} = {:#018x}", info.regs[i]);
            }
        }
        Arch::Aarch64 => {
            for i in 0..31 {
                let _ = writeln!(out, "{:>8} = {:#018x}", format!("x{i}"), info.regs[i]);
            }
            let _ = writeln!(out, "{:>8} = {:#018x}", "sp", info.regs[31]);
            let _ = writeln!(out, "{:>8} = {:#018x}", "pc", info.regs[32]);
            let _ = writeln!(out, "{:>8} = {:#018x}", "pstate", info.regs[33]);
        }
        Arch::Unknown => {
            for (i, reg) in info.regs.iter().enumerate() {
                let _ = writeln!(out, "  reg[{i:02}] = {reg:#018x}");
            }
        }
    }
}

fn write_thread(out: &mut String, index: usize, thread: &ThreadView<'_>) {
    let _ = writeln!(
        out,
        "==== thread {} ({}) ====",
        thread.tid(),
        if thread.name().is_empty() {
            "unknown"
        } else {
            thread.name()
        }
    );
    let _ = writeln!(out, "record:     {index}");
    match thread.diagnostic() {
        Some(message) => {
            let _ = writeln!(
                out,
                "unwind failed: {}",
                String::from_utf8_lossy(message)
            );
        }
        None => {
            for frame in thread.frames() {
                let _ = writeln!(out, "  {}", String::from_utf8_lossy(frame));
            }
        }
    }
}

fn write_log_ring(out: &mut String, view: &DumpView<'_>) {
    let mut lines = view.log_lines().peekable();
    if lines.peek().is_none() {
        return;
    }
    let _ = writeln!(out, "==== diagnostic log ====");
    for line in lines {
        let _ = writeln!(out, "  {}", String::from_utf8_lossy(line));
    }
}

/// Renders `dump_path` into a sibling `.txt` report and, on success,
/// deletes the source binary. Returns the report path.
pub fn render_report(dump_path: &Path) -> Result<PathBuf, ReportError> {
    validate_path(dump_path)?;
    let bytes = std::fs::read(dump_path)?;
    let view = DumpView::parse(&bytes)?;
    let info = view.process_info();

    let mut out = String::with_capacity(16 * 1024);
    if let Some(banner) = kernel_banner() {
        let _ = writeln!(out, "{banner}");
    }
    write_summary(&mut out, &info);
    write_registers(&mut out, &info);
    for (index, thread) in view.threads().enumerate() {
        write_thread(&mut out, index, &thread);
    }
    write_log_ring(&mut out, &view);

    // Bytes past the fixed layout carry architecture-specific extras and
    // are carried over verbatim.
    if bytes.len() > DUMP_BUFFER_SIZE {
        out.push_str(&String::from_utf8_lossy(&bytes[DUMP_BUFFER_SIZE..]));
    }

    let report_path = dump_path.with_extension(REPORT_FILE_EXTENSION);
    std::fs::write(&report_path, out.as_bytes())?;
    tracing::info!(
        dump = %dump_path.display(),
        report = %report_path.display(),
        threads = view.thread_count(),
        "rendered crash report"
    );
    std::fs::remove_file(dump_path)?;
    Ok(report_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::buffer::{DumpBuffer, ThreadSnapshot};

    fn write_sample_dump(dir: &Path, extra: &[u8]) -> PathBuf {
        let mut buffer = Box::new(DumpBuffer::new());
        buffer.write_header().unwrap();
        let mut info = ProcessInfo {
            pid: 100,
            tid: 101,
            signum: libc::SIGABRT,
            si_code: -6,
            fault_addr: 0x1000,
            wall_secs: 1_700_000_000,
            arch: Arch::host(),
            ..Default::default()
        };
        info.prog[..4].copy_from_slice(b"npud");
        buffer.set_process_info(&info).unwrap();

        let mut main = ThreadSnapshot::new(101);
        main.set_name(b"main");
        main.push_frame(b"#0 pc 0x401000 fp 0x7ffd0000").unwrap();
        buffer.add_thread(&main).unwrap();

        let mut broken = ThreadSnapshot::new(102);
        broken.set_name(b"worker");
        broken.set_unwind_failure("no frame pointer chain");
        buffer.add_thread(&broken).unwrap();

        buffer.log_line(b"collector attached");

        let path = dir.join("sigabrt_101_npud_20231114221320.bin");
        let mut bytes = buffer.as_bytes().to_vec();
        bytes.extend_from_slice(extra);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn renders_report_and_removes_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = write_sample_dump(tmp.path(), b"");
        let report = render_report(&dump).unwrap();
        assert!(!dump.exists());
        let text = std::fs::read_to_string(&report).unwrap();
        assert!(text.contains("program:    npud"));
        assert!(text.contains("==== thread 101 (main) ===="));
        assert!(text.contains("#0 pc 0x401000"));
        assert!(text.contains("unwind failed: no frame pointer chain"));
        assert!(text.contains("collector attached"));
    }

    #[test]
    fn trailing_bytes_are_appended_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = write_sample_dump(tmp.path(), b"extra arch detail\n");
        let report = render_report(&dump).unwrap();
        let text = std::fs::read_to_string(&report).unwrap();
        assert!(text.ends_with("extra arch detail\n"));
    }

    #[test]
    fn rejects_wrong_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.txt");
        std::fs::write(&path, b"not a dump").unwrap();
        assert!(matches!(
            render_report(&path),
            Err(ReportError::WrongExtension)
        ));
        assert!(path.exists());
    }

    #[test]
    fn rejects_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("absent.bin");
        assert!(matches!(render_report(&path), Err(ReportError::NotFound(_))));
    }

    #[test]
    fn corrupt_header_leaves_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = write_sample_dump(tmp.path(), b"");
        let mut bytes = std::fs::read(&dump).unwrap();
        bytes[0] = 0;
        std::fs::write(&dump, bytes).unwrap();
        assert!(matches!(render_report(&dump), Err(ReportError::Format(_))));
        assert!(dump.exists());
    }
}
