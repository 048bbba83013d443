// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! The flat, fixed-size dump artifact.
//!
//! The whole snapshot lives in one byte arena with explicit field offsets:
//! a header with magic/version and a block-layout table, one ProcessInfo
//! record, a thread table, and a ring of free-form log lines. No pointers,
//! no allocation, so the arena can be populated from the crash path and
//! flushed with a single bulk write. The decoder validates rather than
//! casting memory, which keeps the on-disk bytes identical across
//! compilers.

use crate::shared::constants::{
    DUMP_MAGIC, DUMP_VERSION, FRAME_TEXT_LEN, LOG_LINE_LEN, LOG_RING_LINES, MAX_DUMP_THREADS,
    MAX_REGISTERS, MAX_STACK_DEPTH, PROG_NAME_LEN, THREAD_NAME_LEN,
};

pub const HEADER_LEN: usize = 32;
pub const PROCINFO_OFFSET: usize = HEADER_LEN;
pub const PROCINFO_LEN: usize = 360;
pub const THREAD_RECORD_LEN: usize = 8 + THREAD_NAME_LEN + MAX_STACK_DEPTH * FRAME_TEXT_LEN;
pub const THREADS_OFFSET: usize = PROCINFO_OFFSET + PROCINFO_LEN;
pub const THREADS_LEN: usize = MAX_DUMP_THREADS * THREAD_RECORD_LEN;
pub const LOG_RING_OFFSET: usize = THREADS_OFFSET + THREADS_LEN;
pub const LOG_RING_LEN: usize = 8 + LOG_RING_LINES * LOG_LINE_LEN;
/// Total artifact size; the reader consumes exactly this many bytes.
pub const DUMP_BUFFER_SIZE: usize = LOG_RING_OFFSET + LOG_RING_LEN;

const BLOCK_COUNT: u16 = 3;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum DumpFormatError {
    #[error("Dump truncated: {0} bytes, expected at least {DUMP_BUFFER_SIZE}")]
    Truncated(usize),
    #[error("Bad magic {0:#06x}, expected {DUMP_MAGIC:#06x}")]
    BadMagic(u16),
    #[error("Unsupported version {0}, expected {DUMP_VERSION}")]
    BadVersion(u16),
    #[error("Block layout table does not match this reader")]
    BadLayout,
    #[error("Header already written")]
    HeaderAlreadyWritten,
    #[error("Header not yet written")]
    MissingHeader,
    #[error("Thread table is full")]
    ThreadTableFull,
    #[error("Frame table is full")]
    FrameTableFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arch {
    #[default]
    Unknown = 0,
    X86_64 = 1,
    Aarch64 = 2,
}

impl Arch {
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        return Arch::X86_64;
        #[cfg(target_arch = "aarch64")]
        return Arch::Aarch64;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        return Arch::Unknown;
    }

    fn from_u32(value: u32) -> Self {
        match value {
            1 => Arch::X86_64,
            2 => Arch::Aarch64,
            _ => Arch::Unknown,
        }
    }
}

/// The single per-dump process record, including the faulting thread's
/// register file.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub tid: i32,
    pub signum: i32,
    pub si_code: i32,
    pub fault_addr: u64,
    pub mono_secs: u64,
    pub mono_nanos: u32,
    pub wall_secs: i64,
    pub arch: Arch,
    pub prog: [u8; PROG_NAME_LEN],
    pub regs: [u64; MAX_REGISTERS],
}

impl Default for ProcessInfo {
    fn default() -> Self {
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
            prog: [0; PROG_NAME_LEN],
            regs: [0; MAX_REGISTERS],
        }
    }
}

impl ProcessInfo {
    pub fn prog_name(&self) -> &str {
        str_until_nul(&self.prog)
    }
}

/// One suspended thread: identity, name and a bounded list of
/// pre-formatted frame lines. `frame_count == -1` means the unwind failed
/// and `frames[0]` carries a diagnostic string instead.
pub struct ThreadSnapshot {
    pub tid: i32,
    pub frame_count: i32,
    pub name: [u8; THREAD_NAME_LEN],
    frames: [[u8; FRAME_TEXT_LEN]; MAX_STACK_DEPTH],
}

impl ThreadSnapshot {
    pub const fn new(tid: i32) -> Self {
        Self {
            tid,
            frame_count: 0,
            name: [0; THREAD_NAME_LEN],
            frames: [[0; FRAME_TEXT_LEN]; MAX_STACK_DEPTH],
        }
    }

    pub fn reset(&mut self, tid: i32) {
        self.tid = tid;
        self.frame_count = 0;
        self.name = [0; THREAD_NAME_LEN];
        for frame in self.frames.iter_mut() {
            frame.fill(0);
        }
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let take = name.len().min(THREAD_NAME_LEN - 1);
        self.name[..take].copy_from_slice(&name[..take]);
        self.name[take..].fill(0);
    }

    pub fn push_frame(&mut self, text: &[u8]) -> Result<(), DumpFormatError> {
        if self.frame_count < 0 {
            // An unwind failure record takes no further frames.
            return Err(DumpFormatError::FrameTableFull);
        }
        let index = self.frame_count as usize;
        if index >= MAX_STACK_DEPTH {
            return Err(DumpFormatError::FrameTableFull);
        }
        let take = text.len().min(FRAME_TEXT_LEN - 1);
        self.frames[index][..take].copy_from_slice(&text[..take]);
        self.frame_count += 1;
        Ok(())
    }

    /// Marks the unwind as failed and stores the diagnostic in slot zero.
    pub fn set_unwind_failure(&mut self, message: &str) {
        self.frame_count = -1;
        let bytes = message.as_bytes();
        let take = bytes.len().min(FRAME_TEXT_LEN - 1);
        self.frames[0][..take].copy_from_slice(&bytes[..take]);
        self.frames[0][take..].fill(0);
    }

    pub fn frame(&self, index: usize) -> &[u8] {
        bytes_until_nul(&self.frames[index])
    }
}

/// The process-wide dump arena. One logical writer at a time; reset to
/// zero after each flush.
pub struct DumpBuffer {
    bytes: [u8; DUMP_BUFFER_SIZE],
    header_written: bool,
}

impl DumpBuffer {
    pub const fn new() -> Self {
        Self {
            bytes: [0u8; DUMP_BUFFER_SIZE],
            header_written: false,
        }
    }

    pub fn reset(&mut self) {
        self.bytes.fill(0);
        self.header_written = false;
    }

    /// Appends the validated header. Exactly once per dump.
    pub fn write_header(&mut self) -> Result<(), DumpFormatError> {
        if self.header_written {
            return Err(DumpFormatError::HeaderAlreadyWritten);
        }
        put_u16(&mut self.bytes, 0, DUMP_MAGIC);
        put_u16(&mut self.bytes, 2, DUMP_VERSION);
        put_u16(&mut self.bytes, 4, BLOCK_COUNT);
        put_u16(&mut self.bytes, 6, 0);
        let table = [
            (PROCINFO_OFFSET, PROCINFO_LEN),
            (THREADS_OFFSET, THREADS_LEN),
            (LOG_RING_OFFSET, LOG_RING_LEN),
        ];
        for (i, (offset, len)) in table.iter().enumerate() {
            put_u32(&mut self.bytes, 8 + i * 8, *offset as u32);
            put_u32(&mut self.bytes, 12 + i * 8, *len as u32);
        }
        self.header_written = true;
        Ok(())
    }

    pub fn set_process_info(&mut self, info: &ProcessInfo) -> Result<(), DumpFormatError> {
        if !self.header_written {
            return Err(DumpFormatError::MissingHeader);
        }
        let b = PROCINFO_OFFSET;
        put_i32(&mut self.bytes, b, info.pid);
        put_i32(&mut self.bytes, b + 4, info.tid);
        put_i32(&mut self.bytes, b + 8, info.signum);
        put_i32(&mut self.bytes, b + 12, info.si_code);
        put_u64(&mut self.bytes, b + 16, info.fault_addr);
        put_u64(&mut self.bytes, b + 24, info.mono_secs);
        put_u32(&mut self.bytes, b + 32, info.mono_nanos);
        put_u32(&mut self.bytes, b + 36, info.arch as u32);
        put_i64(&mut self.bytes, b + 40, info.wall_secs);
        self.bytes[b + 48..b + 48 + PROG_NAME_LEN].copy_from_slice(&info.prog);
        for (i, reg) in info.regs.iter().enumerate() {
            put_u64(&mut self.bytes, b + 88 + i * 8, *reg);
        }
        Ok(())
    }

    fn thread_count(&self) -> u32 {
        get_u32(&self.bytes, PROCINFO_OFFSET + 80)
    }

    /// Appends one thread record in suspension order.
    pub fn add_thread(&mut self, snapshot: &ThreadSnapshot) -> Result<usize, DumpFormatError> {
        if !self.header_written {
            return Err(DumpFormatError::MissingHeader);
        }
        let index = self.thread_count() as usize;
        if index >= MAX_DUMP_THREADS {
            return Err(DumpFormatError::ThreadTableFull);
        }
        let b = THREADS_OFFSET + index * THREAD_RECORD_LEN;
        put_i32(&mut self.bytes, b, snapshot.tid);
        put_i32(&mut self.bytes, b + 4, snapshot.frame_count);
        self.bytes[b + 8..b + 8 + THREAD_NAME_LEN].copy_from_slice(&snapshot.name);
        let stored_frames = if snapshot.frame_count < 0 {
            1 // diagnostic string in slot zero
        } else {
            snapshot.frame_count as usize
        };
        for i in 0..stored_frames {
            let f = b + 8 + THREAD_NAME_LEN + i * FRAME_TEXT_LEN;
            self.bytes[f..f + FRAME_TEXT_LEN].copy_from_slice(&snapshot.frames[i]);
        }
        put_u32(&mut self.bytes, PROCINFO_OFFSET + 80, (index + 1) as u32);
        Ok(index)
    }

    /// Appends one line to the log ring, overwriting the oldest line when
    /// the ring is full. Usable before the header is written so early
    /// failures still leave a trace in the eventual dump.
    pub fn log_line(&mut self, line: &[u8]) {
        let next = get_u32(&self.bytes, LOG_RING_OFFSET) as usize % LOG_RING_LINES;
        let count = get_u32(&self.bytes, LOG_RING_OFFSET + 4);
        let slot = LOG_RING_OFFSET + 8 + next * LOG_LINE_LEN;
        let take = line.len().min(LOG_LINE_LEN - 1);
        self.bytes[slot..slot + take].copy_from_slice(&line[..take]);
        self.bytes[slot + take..slot + LOG_LINE_LEN].fill(0);
        put_u32(
            &mut self.bytes,
            LOG_RING_OFFSET,
            ((next + 1) % LOG_RING_LINES) as u32,
        );
        put_u32(
            &mut self.bytes,
            LOG_RING_OFFSET + 4,
            count.saturating_add(1).min(LOG_RING_LINES as u32),
        );
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for DumpBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated, read-only view over dump bytes.
pub struct DumpView<'a> {
    bytes: &'a [u8],
}

impl<'a> DumpView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, DumpFormatError> {
        if bytes.len() < DUMP_BUFFER_SIZE {
            return Err(DumpFormatError::Truncated(bytes.len()));
        }
        let magic = get_u16(bytes, 0);
        if magic != DUMP_MAGIC {
            return Err(DumpFormatError::BadMagic(magic));
        }
        let version = get_u16(bytes, 2);
        if version != DUMP_VERSION {
            return Err(DumpFormatError::BadVersion(version));
        }
        if get_u16(bytes, 4) != BLOCK_COUNT
            || get_u32(bytes, 8) as usize != PROCINFO_OFFSET
            || get_u32(bytes, 16) as usize != THREADS_OFFSET
            || get_u32(bytes, 24) as usize != LOG_RING_OFFSET
        {
            return Err(DumpFormatError::BadLayout);
        }
        Ok(Self {
            bytes: &bytes[..DUMP_BUFFER_SIZE],
        })
    }

    pub fn process_info(&self) -> ProcessInfo {
        let b = PROCINFO_OFFSET;
        let mut prog = [0u8; PROG_NAME_LEN];
        prog.copy_from_slice(&self.bytes[b + 48..b + 48 + PROG_NAME_LEN]);
        let mut regs = [0u64; MAX_REGISTERS];
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = get_u64(self.bytes, b + 88 + i * 8);
        }
        ProcessInfo {
            pid: get_i32(self.bytes, b),
            tid: get_i32(self.bytes, b + 4),
            signum: get_i32(self.bytes, b + 8),
            si_code: get_i32(self.bytes, b + 12),
            fault_addr: get_u64(self.bytes, b + 16),
            mono_secs: get_u64(self.bytes, b + 24),
            mono_nanos: get_u32(self.bytes, b + 32),
            arch: Arch::from_u32(get_u32(self.bytes, b + 36)),
            wall_secs: get_i64(self.bytes, b + 40),
            prog,
            regs,
        }
    }

    pub fn thread_count(&self) -> usize {
        (get_u32(self.bytes, PROCINFO_OFFSET + 80) as usize).min(MAX_DUMP_THREADS)
    }

    pub fn thread(&self, index: usize) -> Option<ThreadView<'a>> {
        if index >= self.thread_count() {
            return None;
        }
        Some(ThreadView {
            bytes: &self.bytes[THREADS_OFFSET + index * THREAD_RECORD_LEN..]
                [..THREAD_RECORD_LEN],
        })
    }

    pub fn threads(&self) -> impl Iterator<Item = ThreadView<'a>> + '_ {
        (0..self.thread_count()).filter_map(move |i| self.thread(i))
    }

    /// Log lines, oldest first.
    pub fn log_lines(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        let next = get_u32(self.bytes, LOG_RING_OFFSET) as usize % LOG_RING_LINES;
        let count = get_u32(self.bytes, LOG_RING_OFFSET + 4) as usize;
        let start = (next + LOG_RING_LINES - count.min(LOG_RING_LINES)) % LOG_RING_LINES;
        (0..count.min(LOG_RING_LINES)).map(move |i| {
            let slot = (start + i) % LOG_RING_LINES;
            let at = LOG_RING_OFFSET + 8 + slot * LOG_LINE_LEN;
            bytes_until_nul(&self.bytes[at..at + LOG_LINE_LEN])
        })
    }
}

pub struct ThreadView<'a> {
    bytes: &'a [u8],
}

impl<'a> ThreadView<'a> {
    pub fn tid(&self) -> i32 {
        get_i32(self.bytes, 0)
    }

    pub fn frame_count(&self) -> i32 {
        get_i32(self.bytes, 4)
    }

    pub fn name(&self) -> &'a str {
        str_until_nul(&self.bytes[8..8 + THREAD_NAME_LEN])
    }

    /// Frame lines; empty when the unwind failed (see [`Self::diagnostic`]).
    pub fn frames(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        let count = self.frame_count().max(0) as usize;
        (0..count.min(MAX_STACK_DEPTH)).map(move |i| {
            let at = 8 + THREAD_NAME_LEN + i * FRAME_TEXT_LEN;
            bytes_until_nul(&self.bytes[at..at + FRAME_TEXT_LEN])
        })
    }

    /// The diagnostic string stored for an unwind failure.
    pub fn diagnostic(&self) -> Option<&'a [u8]> {
        if self.frame_count() != -1 {
            return None;
        }
        let at = 8 + THREAD_NAME_LEN;
        Some(bytes_until_nul(&self.bytes[at..at + FRAME_TEXT_LEN]))
    }
}

fn bytes_until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

fn str_until_nul(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes_until_nul(bytes)).unwrap_or("")
}

fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_i32(bytes: &mut [u8], at: usize, value: i32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_i64(bytes: &mut [u8], at: usize, value: i64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn get_i32(bytes: &[u8], at: usize) -> i32 {
    get_u32(bytes, at) as i32
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(out)
}

fn get_i64(bytes: &[u8], at: usize) -> i64 {
    get_u64(bytes, at) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ProcessInfo {
        let mut info = ProcessInfo {
            pid: 1234,
            tid: 1235,
            signum: libc::SIGSEGV,
            si_code: 1,
            fault_addr: 0xdead_beef,
            mono_secs: 17,
            mono_nanos: 42,
            wall_secs: 1_700_000_000,
            arch: Arch::host(),
            ..Default::default()
        };
        info.prog[..6].copy_from_slice(b"worker");
        info.regs[0] = 0x1111;
        info
    }

    fn populated_buffer() -> Box<DumpBuffer> {
        let mut buffer = Box::new(DumpBuffer::new());
        buffer.write_header().unwrap();
        buffer.set_process_info(&sample_info()).unwrap();
        let mut snap = ThreadSnapshot::new(1235);
        snap.set_name(b"worker-0");
        snap.push_frame(b"#0 pc 0x0000000000401000").unwrap();
        snap.push_frame(b"#1 pc 0x0000000000401200").unwrap();
        buffer.add_thread(&snap).unwrap();
        buffer
    }

    #[test]
    fn header_written_exactly_once() {
        let mut buffer = Box::new(DumpBuffer::new());
        buffer.write_header().unwrap();
        assert_eq!(
            buffer.write_header(),
            Err(DumpFormatError::HeaderAlreadyWritten)
        );
        buffer.reset();
        buffer.write_header().unwrap();
    }

    #[test]
    fn records_require_header() {
        let mut buffer = Box::new(DumpBuffer::new());
        assert_eq!(
            buffer.set_process_info(&sample_info()),
            Err(DumpFormatError::MissingHeader)
        );
        assert_eq!(
            buffer.add_thread(&ThreadSnapshot::new(1)).unwrap_err(),
            DumpFormatError::MissingHeader
        );
    }

    #[test]
    fn round_trips_through_view() {
        let buffer = populated_buffer();
        let view = DumpView::parse(buffer.as_bytes()).unwrap();
        let info = view.process_info();
        assert_eq!(info.pid, 1234);
        assert_eq!(info.signum, libc::SIGSEGV);
        assert_eq!(info.fault_addr, 0xdead_beef);
        assert_eq!(info.prog_name(), "worker");
        assert_eq!(info.regs[0], 0x1111);
        assert_eq!(view.thread_count(), 1);
        let thread = view.thread(0).unwrap();
        assert_eq!(thread.tid(), 1235);
        assert_eq!(thread.name(), "worker-0");
        let frames: Vec<&[u8]> = thread.frames().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"#0 pc 0x0000000000401000");
        assert!(thread.diagnostic().is_none());
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let buffer = populated_buffer();
        let mut bytes = buffer.as_bytes().to_vec();
        bytes[0] ^= 0xff;
        assert!(matches!(
            DumpView::parse(&bytes),
            Err(DumpFormatError::BadMagic(_))
        ));
        bytes[0] ^= 0xff;
        bytes[2] = 0xfe;
        assert!(matches!(
            DumpView::parse(&bytes),
            Err(DumpFormatError::BadVersion(_))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let buffer = populated_buffer();
        let bytes = &buffer.as_bytes()[..DUMP_BUFFER_SIZE - 1];
        assert!(matches!(
            DumpView::parse(bytes),
            Err(DumpFormatError::Truncated(n)) if n == DUMP_BUFFER_SIZE - 1
        ));
    }

    #[test]
    fn unwind_failure_renders_diagnostic_only() {
        let mut buffer = Box::new(DumpBuffer::new());
        buffer.write_header().unwrap();
        buffer.set_process_info(&sample_info()).unwrap();
        let mut snap = ThreadSnapshot::new(9);
        snap.set_unwind_failure("frame pointer chain unavailable");
        assert_eq!(
            snap.push_frame(b"should not land"),
            Err(DumpFormatError::FrameTableFull)
        );
        buffer.add_thread(&snap).unwrap();

        let view = DumpView::parse(buffer.as_bytes()).unwrap();
        let thread = view.thread(0).unwrap();
        assert_eq!(thread.frame_count(), -1);
        assert_eq!(thread.frames().count(), 0);
        assert_eq!(
            thread.diagnostic().unwrap(),
            b"frame pointer chain unavailable"
        );
    }

    #[test]
    fn thread_table_capacity_is_enforced() {
        let mut buffer = populated_buffer();
        let snap = ThreadSnapshot::new(1);
        for _ in 1..MAX_DUMP_THREADS {
            buffer.add_thread(&snap).unwrap();
        }
        assert_eq!(
            buffer.add_thread(&snap),
            Err(DumpFormatError::ThreadTableFull)
        );
    }

    #[test]
    fn frame_capacity_is_enforced() {
        let mut snap = ThreadSnapshot::new(1);
        for _ in 0..MAX_STACK_DEPTH {
            snap.push_frame(b"frame").unwrap();
        }
        assert_eq!(snap.push_frame(b"frame"), Err(DumpFormatError::FrameTableFull));
        assert_eq!(snap.frame_count, MAX_STACK_DEPTH as i32);
    }

    #[test]
    fn log_ring_keeps_newest_lines() {
        let mut buffer = Box::new(DumpBuffer::new());
        buffer.write_header().unwrap();
        buffer.set_process_info(&sample_info()).unwrap();
        for i in 0..LOG_RING_LINES + 3 {
            let line = format!("line {i}");
            buffer.log_line(line.as_bytes());
        }
        let view = DumpView::parse(buffer.as_bytes()).unwrap();
        let lines: Vec<&[u8]> = view.log_lines().collect();
        assert_eq!(lines.len(), LOG_RING_LINES);
        assert_eq!(lines[0], b"line 3");
        assert_eq!(lines[LOG_RING_LINES - 1], format!("line {}", LOG_RING_LINES + 2).as_bytes());
    }
}
