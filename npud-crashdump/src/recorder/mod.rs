// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Signal-safe recording primitives: fixed-buffer path construction, the
//! incident directory layout, and bounded-retry file I/O. Everything in this
//! module is callable from the crash path: no allocation, no locks, no
//! unbounded blocking. Only interrupted syscalls are retried.

pub mod fmtbuf;
pub mod paths;
pub mod sysinfo;

use nix::errno::Errno;
use std::os::unix::io::RawFd;

pub use paths::RawPath;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RecorderError {
    #[error("Path exceeds the recorder's fixed capacity")]
    PathTooLong,
    #[error("Path component contains a parent-directory traversal token")]
    TraversalRejected,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("open failed (errno {0})")]
    Open(i32),
    #[error("mkdir failed (errno {0})")]
    Mkdir(i32),
    #[error("write failed after {written} bytes (errno {errno})")]
    Write { errno: i32, written: usize },
    #[error("read failed (errno {0})")]
    Read(i32),
}

/// A raw file descriptor that closes on drop. Thin on purpose: `File` pulls
/// in machinery we must not rely on inside a signal handler.
pub struct RawFile(RawFd);

impl RawFile {
    pub fn create(path: &RawPath) -> Result<Self, RecorderError> {
        // SAFETY: the path buffer is NUL-terminated by construction.
        let fd = loop {
            let fd = unsafe {
                libc::open(
                    path.as_c_ptr(),
                    libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
                    0o644,
                )
            };
            if fd >= 0 {
                break fd;
            }
            let errno = Errno::last_raw();
            if errno != libc::EINTR {
                return Err(RecorderError::Open(errno));
            }
        };
        Ok(Self(fd))
    }

    pub fn open_read(path: &RawPath) -> Result<Self, RecorderError> {
        // SAFETY: the path buffer is NUL-terminated by construction.
        let fd = loop {
            let fd = unsafe { libc::open(path.as_c_ptr(), libc::O_RDONLY) };
            if fd >= 0 {
                break fd;
            }
            let errno = Errno::last_raw();
            if errno != libc::EINTR {
                return Err(RecorderError::Open(errno));
            }
        };
        Ok(Self(fd))
    }

    pub fn write_full(&self, bytes: &[u8]) -> Result<(), RecorderError> {
        write_full(self.0, bytes)
    }

    /// One bounded read; 0 means end of file.
    pub fn read_some(&self, buf: &mut [u8]) -> Result<usize, RecorderError> {
        loop {
            // SAFETY: buf is a live, writable slice.
            let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = Errno::last_raw();
            if errno != libc::EINTR {
                return Err(RecorderError::Read(errno));
            }
        }
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        // SAFETY: the fd came from open and is closed exactly once.
        let _ = unsafe { libc::close(self.0) };
    }
}

/// Writes the whole buffer. Retries continue only on EINTR; a partial write
/// advances and continues; an error before any byte of the remaining data
/// was written is a hard failure. The write counts as a success only once
/// every requested byte went out.
pub fn write_full(fd: RawFd, bytes: &[u8]) -> Result<(), RecorderError> {
    let mut written = 0usize;
    while written < bytes.len() {
        let remaining = &bytes[written..];
        // SAFETY: remaining points into the caller's live slice.
        let n = unsafe {
            libc::write(
                fd,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
            )
        };
        if n > 0 {
            written += n as usize;
            continue;
        }
        let errno = Errno::last_raw();
        if n < 0 && errno == libc::EINTR {
            continue;
        }
        return Err(RecorderError::Write { errno, written });
    }
    Ok(())
}

/// Reads one line (without the newline) from a pseudo-file into `out`.
/// Returns the number of bytes placed in `out`.
pub fn read_line(path: &RawPath, out: &mut [u8]) -> Result<usize, RecorderError> {
    if out.is_empty() {
        return Err(RecorderError::InvalidParameter);
    }
    let file = RawFile::open_read(path)?;
    let n = file.read_some(out)?;
    let end = out[..n].iter().position(|&b| b == b'\n').unwrap_or(n);
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn tmp_raw_path(dir: &tempfile::TempDir, name: &str) -> RawPath {
        let p = dir.path().join(name);
        RawPath::from_str(p.to_str().unwrap()).unwrap()
    }

    #[test]
    fn write_full_round_trips_through_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = tmp_raw_path(&dir, "out.bin");
        let file = RawFile::create(&path).unwrap();
        file.write_full(b"hello recorder").unwrap();
        drop(file);

        let mut contents = String::new();
        std::fs::File::open(dir.path().join("out.bin"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello recorder");
    }

    #[test]
    fn write_to_bad_fd_reports_zero_written() {
        let err = write_full(-1, b"data").unwrap_err();
        match err {
            RecorderError::Write { written, .. } => assert_eq!(written, 0),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn read_line_stops_at_newline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("line"), "first\nsecond\n").unwrap();
        let path = tmp_raw_path(&dir, "line");
        let mut buf = [0u8; 64];
        let n = read_line(&path, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
    }

    #[test]
    fn read_line_rejects_empty_destination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("line"), "x").unwrap();
        let path = tmp_raw_path(&dir, "line");
        assert_eq!(
            read_line(&path, &mut []),
            Err(RecorderError::InvalidParameter)
        );
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = tmp_raw_path(&dir, "absent");
        assert!(matches!(
            RawFile::open_read(&path),
            Err(RecorderError::Open(_))
        ));
    }
}
