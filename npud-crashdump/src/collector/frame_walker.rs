// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Frame-pointer chain walking. No DWARF, no symbolication: each frame is
//! recorded as raw program-counter and stack-pointer values, formatted into
//! a bounded text line. Used by the collector for suspended threads and by
//! the in-process fallback path for the faulting thread itself.

use crate::dump::buffer::Arch;
use crate::recorder::fmtbuf::FixedWriter;
use crate::shared::constants::{MAX_REGISTERS, MAX_STACK_DEPTH};

/// Largest plausible distance between two frames. A hop beyond this is a
/// corrupt chain, not a deep stack.
const MAX_FRAME_HOP: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

/// Extracts the starting frame from a saved general-purpose register array
/// laid out the way the kernel reports them.
pub fn frame_from_registers(regs: &[u64; MAX_REGISTERS], count: usize, arch: Arch) -> Option<RawFrame> {
    match arch {
        Arch::X86_64 if count > 19 => Some(RawFrame {
            ip: regs[16],
            sp: regs[19],
            fp: regs[4],
        }),
        Arch::Aarch64 if count > 32 => Some(RawFrame {
            ip: regs[32],
            sp: regs[31],
            fp: regs[29],
        }),
        _ => None,
    }
}

/// Copies the handler-delivered register file into a kernel-layout array so
/// the dump stores the same shape regardless of capture path.
#[cfg(target_arch = "x86_64")]
pub unsafe fn registers_from_ucontext(uc: *const libc::ucontext_t, out: &mut [u64; MAX_REGISTERS]) -> usize {
    if uc.is_null() {
        return 0;
    }
    let gregs = unsafe { &(*uc).uc_mcontext.gregs };
    // ucontext gregs and user_regs_struct disagree on ordering; map the
    // slots the report cares about into kernel layout.
    out[4] = gregs[libc::REG_RBP as usize] as u64;
    out[5] = gregs[libc::REG_RBX as usize] as u64;
    out[10] = gregs[libc::REG_RAX as usize] as u64;
    out[11] = gregs[libc::REG_RCX as usize] as u64;
    out[12] = gregs[libc::REG_RDX as usize] as u64;
    out[13] = gregs[libc::REG_RSI as usize] as u64;
    out[14] = gregs[libc::REG_RDI as usize] as u64;
    out[16] = gregs[libc::REG_RIP as usize] as u64;
    out[18] = gregs[libc::REG_EFL as usize] as u64;
    out[19] = gregs[libc::REG_RSP as usize] as u64;
    out[0] = gregs[libc::REG_R15 as usize] as u64;
    out[1] = gregs[libc::REG_R14 as usize] as u64;
    out[2] = gregs[libc::REG_R13 as usize] as u64;
    out[3] = gregs[libc::REG_R12 as usize] as u64;
    out[6] = gregs[libc::REG_R11 as usize] as u64;
    out[7] = gregs[libc::REG_R10 as usize] as u64;
    out[8] = gregs[libc::REG_R9 as usize] as u64;
    out[9] = gregs[libc::REG_R8 as usize] as u64;
    27
}

#[cfg(target_arch = "aarch64")]
pub unsafe fn registers_from_ucontext(uc: *const libc::ucontext_t, out: &mut [u64; MAX_REGISTERS]) -> usize {
    if uc.is_null() {
        return 0;
    }
    let mc = unsafe { &(*uc).uc_mcontext };
    out[..31].copy_from_slice(&mc.regs);
    out[31] = mc.sp;
    out[32] = mc.pc;
    out[33] = mc.pstate;
    34
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn registers_from_ucontext(_uc: *const libc::ucontext_t, _out: &mut [u64; MAX_REGISTERS]) -> usize {
    0
}

fn plausible_fp(fp: u64, sp: u64) -> bool {
    fp != 0 && fp % 8 == 0 && fp > sp && fp - sp < MAX_FRAME_HOP
}

/// Walks the frame-pointer chain starting at `start`, calling `emit` for
/// each frame in order. Stops at the depth cap, at the first implausible
/// frame pointer, or when `emit` returns false.
///
/// # Safety
/// The chain must point into live stack memory of the current address
/// space. The plausibility checks bound, but cannot eliminate, the risk of
/// reading unmapped memory on a corrupted stack.
pub unsafe fn walk(start: RawFrame, mut emit: impl FnMut(usize, &RawFrame) -> bool) -> usize {
    let mut frame = start;
    let mut depth = 0usize;
    loop {
        if !emit(depth, &frame) {
            return depth + 1;
        }
        depth += 1;
        if depth >= MAX_STACK_DEPTH || !plausible_fp(frame.fp, frame.sp) {
            return depth;
        }
        // Both supported architectures store {previous fp, return address}
        // at the frame pointer.
        let next_fp = unsafe { (frame.fp as *const u64).read_volatile() };
        let ret = unsafe { ((frame.fp + 8) as *const u64).read_volatile() };
        if ret == 0 {
            return depth;
        }
        frame = RawFrame {
            ip: ret,
            sp: frame.fp + 16,
            fp: next_fp,
        };
    }
}

/// `#N pc 0x... sp 0x...`, the dump's per-frame text line.
pub fn push_frame_line(w: &mut FixedWriter<'_>, index: usize, frame: &RawFrame) {
    w.push_str("#").push_dec(index as u64);
    w.push_str(" pc ").push_hex(frame.ip);
    w.push_str(" sp ").push_hex(frame.sp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::constants::FRAME_TEXT_LEN;

    #[test]
    fn register_frame_uses_arch_indices() {
        let mut regs = [0u64; MAX_REGISTERS];
        regs[4] = 0xb000;
        regs[16] = 0x1000;
        regs[19] = 0x2000;
        regs[29] = 0x3000;
        regs[31] = 0x4000;
        regs[32] = 0x5000;
        let x86 = frame_from_registers(&regs, 27, Arch::X86_64).unwrap();
        assert_eq!((x86.ip, x86.sp, x86.fp), (0x1000, 0x2000, 0xb000));
        let arm = frame_from_registers(&regs, 34, Arch::Aarch64).unwrap();
        assert_eq!((arm.ip, arm.sp, arm.fp), (0x5000, 0x4000, 0x3000));
        assert!(frame_from_registers(&regs, 3, Arch::X86_64).is_none());
        assert!(frame_from_registers(&regs, 34, Arch::Unknown).is_none());
    }

    #[test]
    fn walks_a_synthetic_chain() {
        // Lay out two stack frames in a local array: each frame is
        // {previous fp, return address}.
        let mut stack = [0u64; 8];
        let base = stack.as_ptr() as u64;
        stack[4] = 0; // outermost frame: fp = 0 terminates
        stack[5] = 0xcafe;
        stack[0] = base + 4 * 8; // inner frame links to the outer one
        stack[1] = 0xbeef;
        let start = RawFrame {
            ip: 0xfeed,
            sp: base.saturating_sub(16),
            fp: base,
        };
        let mut seen = Vec::new();
        let depth = unsafe {
            walk(start, |_, frame| {
                seen.push(frame.ip);
                true
            })
        };
        assert_eq!(depth, 3);
        assert_eq!(seen, vec![0xfeed, 0xbeef, 0xcafe]);
    }

    #[test]
    fn emit_can_stop_the_walk() {
        let start = RawFrame { ip: 1, sp: 0, fp: 0 };
        let depth = unsafe { walk(start, |_, _| false) };
        assert_eq!(depth, 1);
    }

    #[test]
    fn implausible_fp_terminates() {
        for fp in [0u64, 7, u64::MAX & !7] {
            let start = RawFrame { ip: 1, sp: 0x1000, fp };
            let depth = unsafe { walk(start, |_, _| true) };
            assert_eq!(depth, 1, "fp {fp:#x} should not be followed");
        }
    }

    #[test]
    fn frame_line_is_bounded() {
        let mut buf = [0u8; FRAME_TEXT_LEN];
        let mut w = FixedWriter::new(&mut buf);
        let frame = RawFrame {
            ip: 0x0000_7fff_1234_5678,
            sp: 0x0000_7fff_0000_0000,
            fp: 0,
        };
        push_frame_line(&mut w, 3, &frame);
        let n = w.len();
        assert_eq!(
            &buf[..n],
            b"#3 pc 0x00007fff12345678 sp 0x00007fff00000000"
        );
    }
}
