// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Best-effort system state capture into the incident directory. Each
//! source is independent: a missing pseudo-file skips that artifact and
//! never blocks the others.

use super::fmtbuf::FixedWriter;
use super::paths::RawPath;
use super::{RawFile, RecorderError};

/// Copies a pseudo-file with a fixed bounce buffer. Pseudo-files report
/// size 0, so a plain read loop is the only portable way.
fn copy_pseudo_file(src: &RawPath, dst: &RawPath) -> Result<(), RecorderError> {
    let from = RawFile::open_read(src)?;
    let to = RawFile::create(dst)?;
    let mut buffer = [0u8; 512];
    loop {
        let n = from.read_some(&mut buffer)?;
        if n == 0 {
            return Ok(());
        }
        to.write_full(&buffer[..n])?;
    }
}

fn proc_path(pid: i32, leaf: &str) -> Result<RawPath, RecorderError> {
    let mut component = [0u8; 64];
    let mut w = FixedWriter::new(&mut component);
    w.push_str("/proc/").push_signed(pid as i64).push_str("/").push_str(leaf);
    let n = w.len();
    let mut path = RawPath::empty();
    path.push_raw(&component[..n])?;
    Ok(path)
}

fn dest_path(dir: &RawPath, leaf: &str) -> Result<RawPath, RecorderError> {
    let mut path = dir.clone();
    path.push_component(leaf.as_bytes())?;
    Ok(path)
}

/// Captures memory, status, limits and map information for `pid` into the
/// incident directory. Returns how many of the sources were captured.
pub fn capture_system_info(dir: &RawPath, pid: i32) -> usize {
    let mut captured = 0usize;

    let meminfo = RawPath::from_str("/proc/meminfo");
    if let (Ok(src), Ok(dst)) = (meminfo, dest_path(dir, "meminfo")) {
        if copy_pseudo_file(&src, &dst).is_ok() {
            captured += 1;
        }
    }
    for leaf in ["status", "limits", "maps"] {
        if let (Ok(src), Ok(dst)) = (proc_path(pid, leaf), dest_path(dir, leaf)) {
            if copy_pseudo_file(&src, &dst).is_ok() {
                captured += 1;
            }
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_own_process_state() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = RawPath::from_str(tmp.path().to_str().unwrap()).unwrap();
        let pid = std::process::id() as i32;
        let captured = capture_system_info(&dir, pid);
        // All four sources exist for a live pid on Linux.
        assert_eq!(captured, 4);
        let status = std::fs::read_to_string(tmp.path().join("status")).unwrap();
        assert!(status.contains("Pid:"));
        assert!(tmp.path().join("maps").metadata().unwrap().len() > 0);
    }

    #[test]
    fn missing_pid_skips_without_failing_others() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = RawPath::from_str(tmp.path().to_str().unwrap()).unwrap();
        // meminfo still succeeds even though the pid sources are gone.
        let captured = capture_system_info(&dir, -1);
        assert_eq!(captured, 1);
        assert!(tmp.path().join("meminfo").exists());
        assert!(!tmp.path().join("status").exists());
    }
}
