//! Atomic-word view of the mapped pool region.
//!
//! Every persistent structure in the heap is built from 8-byte-aligned
//! little-endian words, so a word-granular atomic view is enough for header
//! publication and for the run-bitmap CAS path. Byte-granular helpers merge
//! partial words with a CAS loop so writers of neighboring bytes are never
//! clobbered.

use std::sync::atomic::{AtomicU64, Ordering};

/// The pool mapping, exposed as a dense array of 64-bit words.
pub struct PoolRegion {
    words: Box<[AtomicU64]>,
}

impl PoolRegion {
    /// Creates a zero-filled region of `size` bytes (rounded down to a
    /// multiple of 8).
    pub fn new(size: usize) -> Self {
        let words = (0..size / 8).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.words.len() * 8
    }

    fn word(&self, off: usize) -> &AtomicU64 {
        debug_assert_eq!(off % 8, 0, "unaligned word access at offset {off}");
        &self.words[off / 8]
    }

    /// Loads the word at byte offset `off` (must be 8-aligned).
    pub fn load(&self, off: usize) -> u64 {
        self.word(off).load(Ordering::Acquire)
    }

    /// Stores the word at byte offset `off` (must be 8-aligned).
    pub fn store(&self, off: usize, val: u64) {
        self.word(off).store(val, Ordering::Release);
    }

    /// Single-word compare-and-swap at byte offset `off`.
    pub fn compare_exchange(&self, off: usize, current: u64, new: u64) -> Result<u64, u64> {
        self.word(off)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Reads `buf.len()` bytes starting at an arbitrary byte offset.
    pub fn read_bytes(&self, off: usize, buf: &mut [u8]) {
        let mut i = 0;
        while i < buf.len() {
            let abs = off + i;
            let start = abs % 8;
            let n = (8 - start).min(buf.len() - i);
            let w = self.words[abs / 8].load(Ordering::Acquire).to_le_bytes();
            buf[i..i + n].copy_from_slice(&w[start..start + n]);
            i += n;
        }
    }

    /// Writes `data` starting at an arbitrary byte offset.
    pub fn write_bytes(&self, off: usize, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let abs = off + i;
            let start = abs % 8;
            let n = (8 - start).min(data.len() - i);
            let word = &self.words[abs / 8];
            if n == 8 {
                let mut b = [0u8; 8];
                b.copy_from_slice(&data[i..i + 8]);
                word.store(u64::from_le_bytes(b), Ordering::Release);
            } else {
                self.merge_partial(word, start, &data[i..i + n]);
            }
            i += n;
        }
    }

    /// Fills `len` bytes with `val` starting at `off`.
    pub fn fill_bytes(&self, off: usize, val: u8, len: usize) {
        let full = [val; 8];
        let mut i = 0;
        while i < len {
            let abs = off + i;
            let start = abs % 8;
            let n = (8 - start).min(len - i);
            let word = &self.words[abs / 8];
            if n == 8 {
                word.store(u64::from_le_bytes(full), Ordering::Release);
            } else {
                self.merge_partial(word, start, &full[..n]);
            }
            i += n;
        }
    }

    fn merge_partial(&self, word: &AtomicU64, start: usize, bytes: &[u8]) {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            let mut b = cur.to_le_bytes();
            b[start..start + bytes.len()].copy_from_slice(bytes);
            match word.compare_exchange(
                cur,
                u64::from_le_bytes(b),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(v) => cur = v,
            }
        }
    }

    /// Copies the entire region out as raw little-endian bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for w in self.words.iter() {
            out.extend_from_slice(&w.load(Ordering::Acquire).to_le_bytes());
        }
        out
    }

    /// Overwrites the region from a snapshot taken with [`PoolRegion::snapshot`].
    pub fn restore(&self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.size());
        self.write_bytes(0, bytes);
    }
}
