// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-buffer text formatting for the crash path. Nothing here allocates;
//! output that would overflow the destination is truncated and flagged.

/// Appends text fragments into a caller-provided byte buffer.
pub struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
    truncated: bool,
}

impl<'a> FixedWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            len: 0,
            truncated: false,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let room = self.buf.len() - self.len;
        let take = bytes.len().min(room);
        if take < bytes.len() {
            self.truncated = true;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        self
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    /// Unsigned decimal, most significant digit first.
    pub fn push_dec(&mut self, mut val: u64) -> &mut Self {
        let mut digits = [0u8; 20];
        let mut i = 0;
        loop {
            digits[i] = b'0' + (val % 10) as u8;
            val /= 10;
            i += 1;
            if val == 0 {
                break;
            }
        }
        digits[..i].reverse();
        self.push_bytes(&digits[..i])
    }

    pub fn push_signed(&mut self, val: i64) -> &mut Self {
        if val < 0 {
            self.push_bytes(b"-");
            self.push_dec(val.unsigned_abs())
        } else {
            self.push_dec(val as u64)
        }
    }

    /// `0x`-prefixed, zero-padded 16-digit hex.
    pub fn push_hex(&mut self, val: u64) -> &mut Self {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut out = [0u8; 18];
        out[0] = b'0';
        out[1] = b'x';
        for i in 0..16 {
            out[2 + i] = DIGITS[((val >> ((15 - i) * 4)) & 0xf) as usize];
        }
        self.push_bytes(&out)
    }

    /// Zero-padded decimal of fixed width, for timestamp fields.
    pub fn push_dec_padded(&mut self, val: u64, width: usize) -> &mut Self {
        let mut digits = [b'0'; 20];
        let mut v = val;
        let mut i = 0;
        while v > 0 && i < 20 {
            digits[19 - i] = b'0' + (v % 10) as u8;
            v /= 10;
            i += 1;
        }
        let width = width.min(20);
        self.push_bytes(&digits[20 - width..])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
