//! Fixed-length bit set used by the transaction journal
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (least significant bit
//! first), which is also the on-disk journal encoding.

use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmask {
    /// Backing bytes, `ceil(len / 8)` of them
    bytes: Vec<u8>,

    /// Number of meaningful bits
    len: usize,
}

impl Bitmask {
    /// All-clear mask of `len` bits
    pub fn new(len: usize) -> Self {
        Bitmask {
            bytes: vec![0u8; (len + 7) / 8],
            len,
        }
    }

    /// Wrap persisted bytes; padding bits past `len` are cleared
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut mask = Self::new(len);
        let n = bytes.len().min(mask.bytes.len());
        mask.bytes[..n].copy_from_slice(&bytes[..n]);
        mask.clear_padding();
        mask
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        (self.bytes[index / 8] & (1u8 << (index % 8))) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bytes[index / 8] |= 1u8 << (index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bytes[index / 8] &= !(1u8 << (index % 8));
        }
    }

    /// Set every bit in `range` (clamped to the mask length)
    pub fn set_range(&mut self, range: Range<usize>) {
        for index in range.start..range.end.min(self.len) {
            self.set(index);
        }
    }

    pub fn clear_all(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    /// True if any bit in `range` is set
    pub fn any_set(&self, range: Range<usize>) -> bool {
        (range.start..range.end.min(self.len)).any(|i| self.is_set(i))
    }

    /// True if every bit in `range` is set (vacuously true when empty)
    pub fn all_set(&self, range: Range<usize>) -> bool {
        if range.end > self.len {
            return false;
        }
        range.into_iter().all(|i| self.is_set(i))
    }

    /// True if no bit is set
    pub fn is_clear(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of set bits in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.is_set(*i))
    }

    fn clear_padding(&mut self) {
        let tail = self.len % 8;
        if tail != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << tail) - 1;
            }
        }
    }
}
