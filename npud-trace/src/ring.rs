// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! A bounded byte-budget ring of typed entries. Appends evict the oldest
//! entries until the new one fits; the budget covers payload bytes, so a
//! journal's memory use is capped no matter how chatty its producer is.

use std::collections::VecDeque;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RingError {
    #[error("entry of {len} bytes exceeds the ring capacity of {capacity}")]
    EntryTooLarge { len: usize, capacity: usize },
}

/// One journal entry: a producer-defined kind tag plus freeform bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity_bytes: usize,
    used_bytes: usize,
    entries: VecDeque<Entry>,
}

impl RingBuffer {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            used_bytes: 0,
            entries: VecDeque::new(),
        }
    }

    /// Appends an entry, evicting from the front until it fits.
    pub fn push(&mut self, kind: u32, bytes: &[u8]) -> Result<(), RingError> {
        if bytes.len() > self.capacity_bytes {
            return Err(RingError::EntryTooLarge {
                len: bytes.len(),
                capacity: self.capacity_bytes,
            });
        }
        while self.used_bytes + bytes.len() > self.capacity_bytes {
            if let Some(evicted) = self.entries.pop_front() {
                self.used_bytes -= evicted.bytes.len();
            } else {
                break;
            }
        }
        self.used_bytes += bytes.len();
        self.entries.push_back(Entry {
            kind,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    /// Defensive copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_in_order() {
        let mut ring = RingBuffer::new(1024);
        ring.push(1, b"first").unwrap();
        ring.push(2, b"second").unwrap();
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].kind, 1);
        assert_eq!(snap[0].bytes, b"first");
        assert_eq!(snap[1].bytes, b"second");
        assert_eq!(ring.used_bytes(), 11);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut ring = RingBuffer::new(10);
        ring.push(1, b"aaaa").unwrap();
        ring.push(2, b"bbbb").unwrap();
        ring.push(3, b"cccc").unwrap();
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].bytes, b"bbbb");
        assert_eq!(snap[1].bytes, b"cccc");
        assert!(ring.used_bytes() <= 10);
    }

    #[test]
    fn oversized_entry_is_rejected_without_eviction() {
        let mut ring = RingBuffer::new(8);
        ring.push(1, b"keep").unwrap();
        assert_eq!(
            ring.push(2, b"way too large"),
            Err(RingError::EntryTooLarge {
                len: 13,
                capacity: 8
            })
        );
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn zero_length_entries_are_fine() {
        let mut ring = RingBuffer::new(4);
        for i in 0..100 {
            ring.push(i, b"").unwrap();
        }
        assert_eq!(ring.len(), 100);
        assert_eq!(ring.used_bytes(), 0);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut ring = RingBuffer::new(64);
        ring.push(1, b"data").unwrap();
        let snap = ring.snapshot();
        ring.push(2, b"more").unwrap();
        assert_eq!(snap.len(), 1);
    }
}
