//! Free-space index over the page file.
//!
//! Free runs are kept in a dual index: `by_start` for adjacency queries and
//! `by_len` for exact/best-fit allocation. Power-of-two aligned runs follow
//! buddy discipline: a freed run merges only with its equal-size aligned
//! buddy, so a removed blob's extents stay individually re-allocatable.
//! Arbitrary-length (tail) runs coalesce with adjacent arbitrary runs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::error::{invariant_violation, Result, StoreError};
use crate::types::{LargePage, PageId};

const FREE_LIST_MAGIC: [u8; 4] = *b"TPFL";
const FREE_LIST_VERSION: u16 = 1;
const FREE_LIST_HDR_LEN: usize = 16;
const FREE_ENTRY_LEN: usize = 12;

fn is_buddy_run(start: u64, len: u32) -> bool {
    len.is_power_of_two() && start % len as u64 == 0
}

/// Per-database free-run index with buddy coalescing.
#[derive(Default, Debug)]
pub struct FreeSpaceManager {
    by_start: BTreeMap<u64, u32>,
    by_len: BTreeMap<u32, BTreeSet<u64>>,
}

impl FreeSpaceManager {
    fn insert_run(&mut self, start: u64, len: u32) {
        debug_assert!(len > 0);
        self.by_start.insert(start, len);
        self.by_len.entry(len).or_default().insert(start);
    }

    fn remove_run(&mut self, start: u64, len: u32) {
        self.by_start.remove(&start);
        if let Some(starts) = self.by_len.get_mut(&len) {
            starts.remove(&start);
            if starts.is_empty() {
                self.by_len.remove(&len);
            }
        }
    }

    /// Best-fit request for a buddy-aligned run of `2^power` pages.
    ///
    /// An exact-length entry wins; otherwise the smallest longer run that
    /// contains an aligned slot is split and its remainders reinserted.
    /// `None` sends the caller to the buffer manager for fresh pages.
    pub fn request_extent(&mut self, power: usize) -> Option<PageId> {
        let len: u32 = 1 << power;
        if let Some(starts) = self.by_len.get(&len) {
            let start = *starts.iter().next().expect("by_len entry non-empty");
            self.remove_run(start, len);
            trace!(power, pid = start, exact = true, "free_space.request_extent");
            return Some(PageId(start));
        }
        let mut found: Option<(u64, u32, u64)> = None;
        for (&run_len, starts) in self.by_len.range(len + 1..) {
            for &start in starts {
                let aligned = start.next_multiple_of(len as u64);
                if aligned + len as u64 <= start + run_len as u64 {
                    found = Some((start, run_len, aligned));
                    break;
                }
            }
            if found.is_some() {
                break;
            }
        }
        let (start, run_len, aligned) = found?;
        self.remove_run(start, run_len);
        if aligned > start {
            self.insert_run(start, (aligned - start) as u32);
        }
        let back = start + run_len as u64 - (aligned + len as u64);
        if back > 0 {
            self.insert_run(aligned + len as u64, back as u32);
        }
        trace!(power, pid = aligned, exact = false, "free_space.request_extent");
        Some(PageId(aligned))
    }

    /// Best-fit request for `pages` contiguous pages with no alignment
    /// constraint; the run is split off the low end.
    pub fn request_tail(&mut self, pages: u32) -> Option<PageId> {
        debug_assert!(pages > 0);
        let (&run_len, starts) = self.by_len.range(pages..).next()?;
        let start = *starts.iter().next().expect("by_len entry non-empty");
        self.remove_run(start, run_len);
        if run_len > pages {
            self.insert_run(start + pages as u64, run_len - pages);
        }
        trace!(pages, pid = start, "free_space.request_tail");
        Some(PageId(start))
    }

    /// Returns a run to the index and coalesces it.
    ///
    /// Buddy-aligned power-of-two runs repeatedly merge with their equal-size
    /// buddy; arbitrary runs merge with adjacent arbitrary runs.
    pub fn free(&mut self, start: u64, len: u32) -> Result<()> {
        if len == 0 {
            return Err(StoreError::Invalid("cannot free an empty run"));
        }
        if let Some((&prev_start, &prev_len)) = self.by_start.range(..=start).next_back() {
            if prev_start + prev_len as u64 > start {
                return Err(invariant_violation("double free of page run"));
            }
        }
        if let Some((&next_start, _)) = self.by_start.range(start..).next() {
            if start + len as u64 > next_start {
                return Err(invariant_violation("freed run overlaps free entry"));
            }
        }
        if is_buddy_run(start, len) {
            let mut cur_start = start;
            let mut cur_len = len as u64;
            while cur_len <= u32::MAX as u64 / 2 {
                let buddy = cur_start ^ cur_len;
                if self.by_start.get(&buddy) != Some(&(cur_len as u32)) {
                    break;
                }
                self.remove_run(buddy, cur_len as u32);
                cur_start = cur_start.min(buddy);
                cur_len *= 2;
            }
            self.insert_run(cur_start, cur_len as u32);
        } else {
            let mut merged_start = start;
            let mut merged_len = len as u64;
            if let Some((&prev_start, &prev_len)) = self.by_start.range(..start).next_back() {
                if prev_start + prev_len as u64 == start && !is_buddy_run(prev_start, prev_len) {
                    self.remove_run(prev_start, prev_len);
                    merged_start = prev_start;
                    merged_len += prev_len as u64;
                }
            }
            if let Some((&next_start, &next_len)) = self.by_start.range(start..).next() {
                if merged_start + merged_len == next_start && !is_buddy_run(next_start, next_len) {
                    self.remove_run(next_start, next_len);
                    merged_len += next_len as u64;
                }
            }
            self.insert_run(merged_start, merged_len as u32);
        }
        trace!(pid = start, pages = len, "free_space.free");
        Ok(())
    }

    /// Bulk-ingests the freed ranges a committing transaction published.
    pub fn publish_free_ranges(&mut self, ranges: &[LargePage]) -> Result<()> {
        for range in ranges {
            self.free(range.start_pid.0, range.page_cnt)?;
        }
        trace!(ranges = ranges.len(), "free_space.publish");
        Ok(())
    }

    /// Free runs in ascending start order.
    pub fn entries(&self) -> impl Iterator<Item = LargePage> + '_ {
        self.by_start
            .iter()
            .map(|(&start, &len)| LargePage::new(PageId(start), len))
    }

    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    pub fn total_free_pages(&self) -> u64 {
        self.by_start.values().map(|&len| len as u64).sum()
    }

    /// Serializes the index for the persisted free-pages list.
    pub fn encode(&self) -> Vec<u8> {
        let mut entries = Vec::with_capacity(self.len() * FREE_ENTRY_LEN);
        for run in self.entries() {
            entries.extend_from_slice(&run.start_pid.0.to_be_bytes());
            entries.extend_from_slice(&run.page_cnt.to_be_bytes());
        }
        let crc = crc32fast::hash(&entries);
        let mut buf = Vec::with_capacity(FREE_LIST_HDR_LEN + entries.len());
        buf.extend_from_slice(&FREE_LIST_MAGIC);
        buf.extend_from_slice(&FREE_LIST_VERSION.to_be_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&(self.len() as u32).to_be_bytes());
        buf.extend_from_slice(&crc.to_be_bytes());
        buf.extend_from_slice(&entries);
        buf
    }

    /// Rebuilds the index from a persisted free-pages list.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FREE_LIST_HDR_LEN {
            return Err(StoreError::Corruption("free list truncated"));
        }
        if src[0..4] != FREE_LIST_MAGIC {
            return Err(StoreError::Corruption("free list magic mismatch"));
        }
        if u16::from_be_bytes(src[4..6].try_into().unwrap()) != FREE_LIST_VERSION {
            return Err(StoreError::Corruption("free list version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(StoreError::Corruption("free list reserved bytes non-zero"));
        }
        let count = u32::from_be_bytes(src[8..12].try_into().unwrap()) as usize;
        let stored_crc = u32::from_be_bytes(src[12..16].try_into().unwrap());
        let entries = &src[FREE_LIST_HDR_LEN..];
        if entries.len() != count * FREE_ENTRY_LEN {
            return Err(StoreError::Corruption("free list length mismatch"));
        }
        if crc32fast::hash(entries) != stored_crc {
            return Err(StoreError::Corruption("free list crc mismatch"));
        }
        let mut manager = Self::default();
        let mut prev_end = 0u64;
        for idx in 0..count {
            let off = idx * FREE_ENTRY_LEN;
            let start = u64::from_be_bytes(entries[off..off + 8].try_into().unwrap());
            let len = u32::from_be_bytes(entries[off + 8..off + 12].try_into().unwrap());
            if len == 0 || (idx > 0 && start < prev_end) {
                return Err(StoreError::Corruption("free list entries not ascending"));
            }
            prev_end = start + len as u64;
            manager.insert_run(start, len);
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_fit_wins() {
        let mut fs = FreeSpaceManager::default();
        fs.free(4, 4).unwrap();
        fs.free(16, 8).unwrap();
        assert_eq!(fs.request_extent(2), Some(PageId(4)));
        assert_eq!(fs.request_extent(2), Some(PageId(16)));
        assert_eq!(fs.entries().collect::<Vec<_>>(), vec![LargePage::new(
            PageId(20),
            4
        )]);
    }

    #[test]
    fn aligned_split_of_larger_run() {
        let mut fs = FreeSpaceManager::default();
        // arbitrary run [5, 21): the first 4-aligned slot inside is 8
        fs.free(5, 16).unwrap();
        assert_eq!(fs.request_extent(2), Some(PageId(8)));
        let entries: Vec<_> = fs.entries().collect();
        assert_eq!(
            entries,
            vec![
                LargePage::new(PageId(5), 3),
                LargePage::new(PageId(12), 9)
            ]
        );
    }

    #[test]
    fn request_miss_returns_none() {
        let mut fs = FreeSpaceManager::default();
        fs.free(2, 2).unwrap();
        assert_eq!(fs.request_extent(3), None);
        assert_eq!(fs.request_tail(3), None);
    }

    #[test]
    fn tail_split_takes_low_end() {
        let mut fs = FreeSpaceManager::default();
        fs.free(3, 5).unwrap();
        assert_eq!(fs.request_tail(2), Some(PageId(3)));
        assert_eq!(
            fs.entries().collect::<Vec<_>>(),
            vec![LargePage::new(PageId(5), 3)]
        );
    }

    #[test]
    fn buddy_pair_merges_upward() {
        let mut fs = FreeSpaceManager::default();
        fs.free(8, 4).unwrap();
        fs.free(12, 4).unwrap();
        assert_eq!(
            fs.entries().collect::<Vec<_>>(),
            vec![LargePage::new(PageId(8), 8)]
        );
        // merged run keeps merging with its own buddy
        fs.free(0, 8).unwrap();
        assert_eq!(
            fs.entries().collect::<Vec<_>>(),
            vec![LargePage::new(PageId(0), 16)]
        );
    }

    #[test]
    fn non_buddy_neighbors_stay_discrete() {
        let mut fs = FreeSpaceManager::default();
        // a removed doubling-schedule blob: runs 1|1, 2|2, 4|4
        fs.free(1, 1).unwrap();
        fs.free(2, 2).unwrap();
        fs.free(4, 4).unwrap();
        assert_eq!(fs.len(), 3);
        assert_eq!(fs.total_free_pages(), 7);
    }

    #[test]
    fn arbitrary_runs_coalesce() {
        let mut fs = FreeSpaceManager::default();
        fs.free(3, 5).unwrap();
        fs.free(8, 3).unwrap();
        assert_eq!(
            fs.entries().collect::<Vec<_>>(),
            vec![LargePage::new(PageId(3), 8)]
        );
    }

    #[test]
    fn double_free_is_rejected() {
        let mut fs = FreeSpaceManager::default();
        fs.free(4, 4).unwrap();
        assert!(matches!(fs.free(4, 4), Err(StoreError::Invariant(_))));
        assert!(matches!(fs.free(6, 4), Err(StoreError::Invariant(_))));
    }

    #[test]
    fn persisted_list_roundtrip() {
        let mut fs = FreeSpaceManager::default();
        fs.free(1, 1).unwrap();
        fs.free(2, 2).unwrap();
        fs.free(9, 3).unwrap();
        let encoded = fs.encode();
        let decoded = FreeSpaceManager::decode(&encoded).unwrap();
        assert_eq!(
            decoded.entries().collect::<Vec<_>>(),
            fs.entries().collect::<Vec<_>>()
        );
    }

    #[test]
    fn decode_rejects_bad_crc() {
        let mut fs = FreeSpaceManager::default();
        fs.free(1, 1).unwrap();
        let mut encoded = fs.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            FreeSpaceManager::decode(&encoded),
            Err(StoreError::Corruption(_))
        ));
    }

    proptest! {
        #[test]
        fn freed_runs_conserve_pages_and_never_overlap(
            powers in prop::collection::vec(0usize..6, 1..32),
        ) {
            let mut fs = FreeSpaceManager::default();
            let mut next = 0u64;
            let mut freed_pages = 0u64;
            for power in powers {
                let len = 1u32 << power;
                let start = next.next_multiple_of(len as u64);
                next = start + len as u64;
                freed_pages += len as u64;
                fs.free(start, len).unwrap();
                let mut prev_end = 0u64;
                for run in fs.entries() {
                    prop_assert!(run.start_pid.0 >= prev_end, "entries overlap");
                    prev_end = run.start_pid.0 + run.page_cnt as u64;
                }
            }
            prop_assert_eq!(fs.total_free_pages(), freed_pages);
        }

        #[test]
        fn request_extent_returns_aligned_runs(
            powers in prop::collection::vec(0usize..5, 1..16),
        ) {
            let mut fs = FreeSpaceManager::default();
            fs.free(0, 1 << 8).unwrap();
            for power in powers {
                if let Some(pid) = fs.request_extent(power) {
                    prop_assert_eq!(pid.0 % (1u64 << power), 0);
                }
            }
        }
    }
}
