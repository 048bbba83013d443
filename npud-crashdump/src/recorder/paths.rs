// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Incident directory layout and signal-safe path construction.
//!
//! One incident directory exists per (event, pid, crash time) triple, and
//! within it one artifact file per (thread, timestamp) pair. Directory
//! creation is idempotent so concurrent crash threads converge on the same
//! directory. Components carrying a `..` traversal token are rejected.

use super::fmtbuf::FixedWriter;
use super::RecorderError;
use crate::shared::constants::{DIAG_PATH_ENV, DEFAULT_DIAG_SUBDIR, MAX_DUMP_PATH};
use nix::errno::Errno;
use std::path::PathBuf;

/// A NUL-terminated path in a fixed buffer, safe to build and pass to libc
/// from a signal handler.
pub struct RawPath {
    buf: [u8; MAX_DUMP_PATH],
    len: usize,
}

impl RawPath {
    pub const fn empty() -> Self {
        Self {
            buf: [0u8; MAX_DUMP_PATH],
            len: 0,
        }
    }

    pub fn from_str(s: &str) -> Result<Self, RecorderError> {
        let mut path = Self::empty();
        path.push_raw(s.as_bytes())?;
        Ok(path)
    }

    /// Appends bytes verbatim, keeping room for the trailing NUL.
    pub fn push_raw(&mut self, bytes: &[u8]) -> Result<(), RecorderError> {
        if self.len + bytes.len() >= MAX_DUMP_PATH {
            return Err(RecorderError::PathTooLong);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.buf[self.len] = 0;
        Ok(())
    }

    /// Appends `/component`, rejecting traversal tokens.
    pub fn push_component(&mut self, component: &[u8]) -> Result<(), RecorderError> {
        if component.is_empty() {
            return Err(RecorderError::InvalidParameter);
        }
        if contains_traversal(component) {
            return Err(RecorderError::TraversalRejected);
        }
        self.push_raw(b"/")?;
        self.push_raw(component)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }

    pub fn as_c_ptr(&self) -> *const libc::c_char {
        self.buf.as_ptr() as *const libc::c_char
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Clone for RawPath {
    fn clone(&self) -> Self {
        Self {
            buf: self.buf,
            len: self.len,
        }
    }
}

fn contains_traversal(component: &[u8]) -> bool {
    component.windows(2).any(|w| w == b"..")
}

/// Idempotent mkdir: an already-existing directory (a sibling crash thread
/// got there first) is reported as `Ok(false)`.
pub fn create_dir_idempotent(path: &RawPath) -> Result<bool, RecorderError> {
    loop {
        // SAFETY: the path buffer is NUL-terminated by construction.
        let rc = unsafe { libc::mkdir(path.as_c_ptr(), 0o755) };
        if rc == 0 {
            return Ok(true);
        }
        match Errno::last_raw() {
            libc::EEXIST => return Ok(false),
            libc::EINTR => continue,
            errno => return Err(RecorderError::Mkdir(errno)),
        }
    }
}

/// Civil time split out of a unix timestamp without any library calls.
/// Uses the days-to-civil algorithm; valid for all timestamps this system
/// can produce.
pub struct WallTime {
    pub year: i64,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

pub fn civil_from_unix(secs: i64) -> WallTime {
    let days = secs.div_euclid(86_400);
    let sod = secs.rem_euclid(86_400) as u32;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = (z - era * 146_097) as i64; // [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365; // [0, 399]
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let mut year = yoe + era * 400;
    if month <= 2 {
        year += 1;
    }
    WallTime {
        year,
        month,
        day,
        hour: sod / 3600,
        minute: (sod / 60) % 60,
        second: sod % 60,
    }
}

/// Fixed-width `YYYYmmddHHMMSS`.
pub fn push_timestamp(w: &mut FixedWriter<'_>, epoch_secs: i64) {
    let t = civil_from_unix(epoch_secs);
    w.push_dec_padded(t.year.max(0) as u64, 4);
    w.push_dec_padded(t.month as u64, 2);
    w.push_dec_padded(t.day as u64, 2);
    w.push_dec_padded(t.hour as u64, 2);
    w.push_dec_padded(t.minute as u64, 2);
    w.push_dec_padded(t.second as u64, 2);
}

pub fn signal_short_name(signum: i32) -> Option<&'static str> {
    Some(match signum {
        libc::SIGINT => "sigint",
        libc::SIGTERM => "sigterm",
        libc::SIGQUIT => "sigquit",
        libc::SIGILL => "sigill",
        libc::SIGTRAP => "sigtrap",
        libc::SIGABRT => "sigabrt",
        libc::SIGBUS => "sigbus",
        libc::SIGFPE => "sigfpe",
        libc::SIGSEGV => "sigsegv",
        libc::SIGXCPU => "sigxcpu",
        libc::SIGXFSZ => "sigxfsz",
        libc::SIGSYS => "sigsys",
        _ => return None,
    })
}

fn push_signal_token(w: &mut FixedWriter<'_>, signum: i32) {
    match signal_short_name(signum) {
        Some(name) => {
            w.push_str(name);
        }
        None if signum == crate::shared::constants::diagnostic_signum() => {
            w.push_str("diag");
        }
        None => {
            w.push_str("sig").push_signed(signum as i64);
        }
    }
}

/// `<root>/<event>_<pid>_<YYYYmmddHHMMSS>`
pub fn build_incident_dir(
    out: &mut RawPath,
    root: &RawPath,
    event: &[u8],
    pid: i32,
    epoch_secs: i64,
) -> Result<(), RecorderError> {
    *out = root.clone();
    let mut component = [0u8; 160];
    let mut w = FixedWriter::new(&mut component);
    w.push_bytes(event).push_str("_").push_signed(pid as i64).push_str("_");
    push_timestamp(&mut w, epoch_secs);
    if w.is_truncated() {
        return Err(RecorderError::PathTooLong);
    }
    let n = w.len();
    out.push_component(&component[..n])
}

/// `<dir>/<signal>_<tid>_<prog>_<YYYYmmddHHMMSS>.<ext>`
pub fn build_artifact_path(
    out: &mut RawPath,
    dir: &RawPath,
    signum: i32,
    tid: i32,
    prog: &[u8],
    epoch_secs: i64,
    extension: &str,
) -> Result<(), RecorderError> {
    *out = dir.clone();
    let mut component = [0u8; 224];
    let mut w = FixedWriter::new(&mut component);
    push_signal_token(&mut w, signum);
    w.push_str("_").push_signed(tid as i64).push_str("_");
    w.push_bytes(prog).push_str("_");
    push_timestamp(&mut w, epoch_secs);
    w.push_str(".").push_str(extension);
    if w.is_truncated() {
        return Err(RecorderError::PathTooLong);
    }
    let n = w.len();
    out.push_component(&component[..n])
}

/// Resolves the diagnostics root directory. Not signal-safe; call at init
/// and cache the result.
pub fn resolve_diag_root() -> PathBuf {
    if let Ok(root) = std::env::var(DIAG_PATH_ENV) {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(DEFAULT_DIAG_SUBDIR);
        }
    }
    PathBuf::from("/tmp").join(DEFAULT_DIAG_SUBDIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Utc};

    #[test]
    fn rejects_traversal_components() {
        let mut path = RawPath::from_str("/tmp/diag").unwrap();
        assert_eq!(
            path.push_component(b".."),
            Err(RecorderError::TraversalRejected)
        );
        assert_eq!(
            path.push_component(b"evil..name"),
            Err(RecorderError::TraversalRejected)
        );
        path.push_component(b"fine.name").unwrap();
        assert_eq!(path.as_str(), Some("/tmp/diag/fine.name"));
    }

    #[test]
    fn overlong_path_is_rejected() {
        let mut path = RawPath::empty();
        let long = vec![b'a'; MAX_DUMP_PATH];
        assert_eq!(path.push_raw(&long), Err(RecorderError::PathTooLong));
    }

    #[test]
    fn civil_time_matches_chrono() {
        for secs in [0i64, 951_782_400, 1_700_000_000, 4_102_444_799] {
            let ours = civil_from_unix(secs);
            let theirs = Utc.timestamp_opt(secs, 0).unwrap();
            assert_eq!(ours.year, theirs.year() as i64);
            assert_eq!(ours.month, theirs.month());
            assert_eq!(ours.day, theirs.day());
            assert_eq!(ours.hour, theirs.hour());
            assert_eq!(ours.minute, theirs.minute());
            assert_eq!(ours.second, theirs.second());
        }
    }

    #[test]
    fn incident_dir_layout() {
        let root = RawPath::from_str("/tmp/diag").unwrap();
        let mut out = RawPath::empty();
        build_incident_dir(&mut out, &root, b"crash", 4242, 1_700_000_000).unwrap();
        assert_eq!(out.as_str(), Some("/tmp/diag/crash_4242_20231114221320"));
    }

    #[test]
    fn artifact_path_layout() {
        let dir = RawPath::from_str("/tmp/diag/crash_1_20231114221320").unwrap();
        let mut out = RawPath::empty();
        build_artifact_path(&mut out, &dir, libc::SIGSEGV, 77, b"worker", 1_700_000_000, "bin")
            .unwrap();
        assert_eq!(
            out.as_str(),
            Some("/tmp/diag/crash_1_20231114221320/sigsegv_77_worker_20231114221320.bin")
        );
    }

    #[test]
    fn unnamed_signal_uses_number_token() {
        let dir = RawPath::from_str("/d").unwrap();
        let mut out = RawPath::empty();
        build_artifact_path(&mut out, &dir, 63, 1, b"p", 0, "txt").unwrap();
        let s = out.as_str().unwrap();
        assert!(s.contains("sig63_") || s.contains("diag_"), "got {s}");
    }

    #[test]
    fn directory_creation_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("incident");
        let raw = RawPath::from_str(dir.to_str().unwrap()).unwrap();
        assert_eq!(create_dir_idempotent(&raw), Ok(true));
        assert_eq!(create_dir_idempotent(&raw), Ok(false));
        assert!(dir.is_dir());
    }

    #[test]
    fn diag_root_honors_env_override() {
        // Serialized by the fact that this is the only test touching the var.
        std::env::set_var(DIAG_PATH_ENV, "/custom/diag");
        assert_eq!(resolve_diag_root(), PathBuf::from("/custom/diag"));
        std::env::remove_var(DIAG_PATH_ENV);
        let fallback = resolve_diag_root();
        assert!(fallback.ends_with(DEFAULT_DIAG_SUBDIR));
    }
}
