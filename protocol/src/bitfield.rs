//! # Bitfield
//!
//! Bit `i` set means block `i` is verified and durably stored here. The
//! same sparse [`Bits`] structure also tracks what each remote peer has
//! announced.
//!
//! Persistence is page-granular: only pages touched since the last
//! `flush()` are rewritten, and a clean flush does no I/O at all.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::config::BITFIELD_PAGE_SIZE;
use crate::error::Result;
use crate::storage::{read_padded, RandomAccess};

const BITS_PER_PAGE: u64 = BITFIELD_PAGE_SIZE as u64 * 8;

/// Sparse, auto-extending bit-vector split into fixed pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bits {
    pages: BTreeMap<u64, Vec<u8>>,
}

impl Bits {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` for any index never set.
    pub fn get(&self, index: u64) -> bool {
        let (page, byte, mask) = locate(index);
        self.pages
            .get(&page)
            .map(|p| p[byte] & mask != 0)
            .unwrap_or(false)
    }

    /// Set or clear a bit. Returns whether anything changed.
    pub fn set(&mut self, index: u64, value: bool) -> bool {
        let (page, byte, mask) = locate(index);
        if !value && !self.pages.contains_key(&page) {
            return false;
        }
        let bytes = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0; BITFIELD_PAGE_SIZE]);
        let before = bytes[byte];
        if value {
            bytes[byte] |= mask;
        } else {
            bytes[byte] &= !mask;
        }
        before != bytes[byte]
    }

    /// Set every bit in `[start, end)`. Whole bytes are filled at once, so
    /// the cost is per page touched rather than per bit.
    pub fn set_range(&mut self, start: u64, end: u64) {
        let mut index = start;
        while index < end {
            let page = index / BITS_PER_PAGE;
            let page_start = page * BITS_PER_PAGE;
            let lo = (index - page_start) as usize;
            let hi = (end - page_start).min(BITS_PER_PAGE) as usize;
            let bytes = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0; BITFIELD_PAGE_SIZE]);
            fill_bits(bytes, lo, hi);
            index = page_start + hi as u64;
        }
    }

    /// Runs of set bits in `[start, end)` as `(first, count)` pairs.
    pub fn runs(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        let mut current: Option<(u64, u64)> = None;
        for (&page, bytes) in self.pages.range(start / BITS_PER_PAGE..) {
            let page_start = page * BITS_PER_PAGE;
            if page_start >= end {
                break;
            }
            for (offset, byte) in bytes.iter().enumerate() {
                if *byte == 0 {
                    continue;
                }
                for bit in 0..8u64 {
                    let index = page_start + offset as u64 * 8 + bit;
                    if index < start || index >= end || byte & (1 << bit) == 0 {
                        continue;
                    }
                    current = match current {
                        Some((first, count)) if first + count == index => Some((first, count + 1)),
                        Some(run) => {
                            runs.push(run);
                            Some((index, 1))
                        }
                        None => Some((index, 1)),
                    };
                }
            }
        }
        runs.extend(current);
        runs
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.pages
            .values()
            .flat_map(|p| p.iter())
            .map(|b| b.count_ones() as u64)
            .sum()
    }

    fn page_bytes(&self, page: u64) -> Option<&[u8]> {
        self.pages.get(&page).map(|p| p.as_slice())
    }

    fn load_page(&mut self, page: u64, bytes: Vec<u8>) {
        if bytes.iter().any(|b| *b != 0) {
            self.pages.insert(page, bytes);
        }
    }
}

/// Set bits `[lo, hi)` of one page.
fn fill_bits(bytes: &mut [u8], mut lo: usize, hi: usize) {
    while lo < hi && lo % 8 != 0 {
        bytes[lo / 8] |= 1 << (lo % 8);
        lo += 1;
    }
    let whole = hi / 8 * 8;
    if lo < whole {
        bytes[lo / 8..whole / 8].fill(0xff);
        lo = whole;
    }
    while lo < hi {
        bytes[lo / 8] |= 1 << (lo % 8);
        lo += 1;
    }
}

fn locate(index: u64) -> (u64, usize, u8) {
    let page = index / BITS_PER_PAGE;
    let within = index % BITS_PER_PAGE;
    (page, (within / 8) as usize, 1 << (within % 8))
}

/// The persistent "stored locally" bit-vector of a log.
pub struct Bitfield {
    storage: Box<dyn RandomAccess>,
    bits: Bits,
    dirty: BTreeSet<u64>,
}

impl Bitfield {
    /// Load every persisted page.
    pub async fn open(storage: Box<dyn RandomAccess>) -> Result<Self> {
        let len = storage.len().await?;
        let page_size = BITFIELD_PAGE_SIZE as u64;
        let mut bits = Bits::new();
        for page in 0..len.div_ceil(page_size) {
            let bytes = read_padded(storage.as_ref(), page * page_size, page_size).await?;
            bits.load_page(page, bytes);
        }
        Ok(Self {
            storage,
            bits,
            dirty: BTreeSet::new(),
        })
    }

    pub fn get(&self, index: u64) -> bool {
        self.bits.get(index)
    }

    /// In-memory only until [`flush`](Bitfield::flush).
    pub fn set(&mut self, index: u64, value: bool) {
        if self.bits.set(index, value) {
            self.dirty.insert(index / BITS_PER_PAGE);
        }
    }

    pub fn bits(&self) -> &Bits {
        &self.bits
    }

    /// Write dirty pages and sync.
    pub async fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let zeros = vec![0u8; BITFIELD_PAGE_SIZE];
        for page in &self.dirty {
            let bytes = self.bits.page_bytes(*page).unwrap_or(&zeros);
            self.storage
                .write(page * BITFIELD_PAGE_SIZE as u64, bytes)
                .await?;
        }
        self.storage.flush().await?;
        trace!(pages = self.dirty.len(), "bitfield flushed");
        self.dirty.clear();
        Ok(())
    }
}
