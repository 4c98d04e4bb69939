//! Size-class arithmetic for blob extents.
//!
//! Extent slot `i` spans `2^i` pages, so the first `k` slots together cover
//! `2^k - 1` pages. A blob is laid out as a prefix of these slots plus an
//! optional arbitrary-length tail run used by the fixed-size schedule.

use smallvec::SmallVec;

use crate::error::{Result, StoreError};
use crate::types::{LargePage, PageId, PAGE_SIZE};

/// Maximum number of power-of-two extent slots per blob.
pub const MAX_EXTENT_CNT: usize = 32;

/// Number of pages in extent slot `idx`.
pub const fn extent_page_cnt(idx: usize) -> u32 {
    1 << idx
}

/// Total pages covered by the first `extent_cnt` slots.
pub const fn capacity_pages(extent_cnt: usize) -> u64 {
    (1u64 << extent_cnt) - 1
}

/// The arbitrary-length trailing run of a fixed-size blob.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TailExtent {
    pub start_pid: PageId,
    pub page_cnt: u32,
    pub in_used: bool,
}

impl TailExtent {
    pub const fn unused() -> Self {
        Self {
            start_pid: PageId(0),
            page_cnt: 0,
            in_used: false,
        }
    }

    pub fn as_large_page(&self) -> LargePage {
        LargePage::new(self.start_pid, self.page_cnt)
    }
}

impl Default for TailExtent {
    fn default() -> Self {
        Self::unused()
    }
}

/// Ordered extent list of one blob: power-of-two slots plus the optional
/// tail. Slot `i` always spans `2^i` pages; only the start pids are stored.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ExtentList {
    pub extent_pids: SmallVec<[PageId; 8]>,
    pub special_blk: TailExtent,
}

impl ExtentList {
    pub fn extent_cnt(&self) -> usize {
        self.extent_pids.len()
    }

    /// The page run of extent slot `idx`.
    pub fn extent(&self, idx: usize) -> LargePage {
        LargePage::new(self.extent_pids[idx], extent_page_cnt(idx))
    }

    /// Iterates the power-of-two extents in slot order, tail excluded.
    pub fn iter_extents(&self) -> impl Iterator<Item = LargePage> + '_ {
        self.extent_pids
            .iter()
            .enumerate()
            .map(|(idx, &pid)| LargePage::new(pid, extent_page_cnt(idx)))
    }

    /// Number of storage units: extents plus the tail when in use.
    pub fn unit_cnt(&self) -> usize {
        self.extent_cnt() + usize::from(self.special_blk.in_used)
    }

    /// The page run of storage unit `unit` (the tail is the last unit).
    pub fn unit(&self, unit: usize) -> LargePage {
        if unit < self.extent_cnt() {
            self.extent(unit)
        } else {
            self.special_blk.as_large_page()
        }
    }

    /// Logical byte offset where storage unit `unit` begins.
    pub fn unit_base_bytes(&self, unit: usize) -> u64 {
        capacity_pages(unit.min(self.extent_cnt())) * PAGE_SIZE as u64
    }

    /// Index of the storage unit covering logical byte `offset`.
    pub fn unit_covering(&self, offset: u64) -> Result<usize> {
        for unit in 0..self.unit_cnt() {
            let base = self.unit_base_bytes(unit);
            let len = self.unit(unit).page_cnt as u64 * PAGE_SIZE as u64;
            if offset < base + len {
                return Ok(unit);
            }
        }
        Err(StoreError::Invalid("offset beyond blob capacity"))
    }

    /// Total pages across all units.
    pub fn total_page_cnt(&self) -> u64 {
        let tail = if self.special_blk.in_used {
            self.special_blk.page_cnt as u64
        } else {
            0
        };
        capacity_pages(self.extent_cnt()) + tail
    }

    /// Total byte capacity across all units.
    pub fn capacity_bytes(&self) -> u64 {
        self.total_page_cnt() * PAGE_SIZE as u64
    }
}

/// Slot count of the doubling schedule covering `page_cnt` pages with no
/// tail: the smallest `k` with `2^k - 1 >= page_cnt`.
pub fn growing_schedule(page_cnt: u64) -> Result<usize> {
    // bit length of page_cnt: 2^k - 1 >= page_cnt holds exactly from there
    let k = (u64::BITS - page_cnt.leading_zeros()) as usize;
    if k > MAX_EXTENT_CNT {
        return Err(StoreError::Invalid("blob exceeds maximum extent count"));
    }
    Ok(k)
}

/// Slot count and tail length of the fixed-size schedule: doubling slots
/// are taken while they fit, the remainder becomes the tail. A remainder
/// of zero means no tail, even when the caller did not ask for growth.
pub fn fixed_schedule(page_cnt: u64) -> Result<(usize, u32)> {
    let mut cnt = 0usize;
    let mut covered = 0u64;
    while cnt < MAX_EXTENT_CNT && covered + extent_page_cnt(cnt) as u64 <= page_cnt {
        covered += extent_page_cnt(cnt) as u64;
        cnt += 1;
    }
    let tail = page_cnt - covered;
    if tail > u32::MAX as u64 {
        return Err(StoreError::Invalid("blob exceeds maximum extent count"));
    }
    Ok((cnt, tail as u32))
}
