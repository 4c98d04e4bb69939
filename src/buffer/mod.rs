//! Buffer manager: the frame table over the page file.
//!
//! Pages live in physical frames keyed by page id. Blob extents are
//! reserved here when the free-space index misses, written through the
//! frame table, flushed at commit, and transitioned to their post-flush
//! state according to the configured logging variant.

pub mod alias;
pub mod frame;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::{LoggingVariant, StoreConfig};
use crate::error::{invariant_violation, Result, StoreError};
use crate::io::FileIo;
use crate::types::{LargePage, PageId, PAGE_SIZE};

pub use frame::{Frame, PageState};

/// Counters tracking buffer-pool activity.
#[derive(Default, Clone, Debug)]
pub struct BufferStats {
    /// Pages handed out by fresh allocation.
    pub allocated_pages: u64,
    /// Pages read back from the page file.
    pub loaded_pages: u64,
    /// Pages whose physical frame was released.
    pub evicted_pages: u64,
    /// Cooling sweeps run against the pool.
    pub sweeps: u64,
}

/// A freshly reserved page run.
///
/// `align_gap` holds the pages skipped to reach buddy alignment; the
/// caller hands them to the free-space index so no page id is lost.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FreshAlloc {
    pub start_pid: PageId,
    pub align_gap: Option<LargePage>,
}

struct BufferInner {
    frames: HashMap<PageId, Frame>,
    next_page: u64,
    physical_used: u64,
    stats: BufferStats,
}

pub struct BufferManager {
    config: Arc<StoreConfig>,
    file: Arc<dyn FileIo>,
    inner: Mutex<BufferInner>,
}

impl BufferManager {
    /// Opens a buffer manager over an existing page file. Page 0 is the
    /// reserved metadata page; dense allocation resumes at `next_page`.
    pub fn new(config: Arc<StoreConfig>, file: Arc<dyn FileIo>, next_page: u64) -> Result<Self> {
        Ok(Self {
            config,
            file,
            inner: Mutex::new(BufferInner {
                frames: HashMap::new(),
                next_page: next_page.max(1),
                physical_used: 0,
                stats: BufferStats::default(),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Reserves a fresh buddy-aligned run of `2^power` pages, resident and
    /// pinned against eviction until flushed. Pages skipped to reach the
    /// alignment are reported back for the free-space index.
    pub fn alloc_extent(&self, power: usize) -> Result<FreshAlloc> {
        let page_cnt = 1u64 << power;
        self.alloc_fresh(page_cnt, page_cnt)
    }

    /// Reserves a fresh run of `pages` pages with no alignment constraint.
    pub fn alloc_tail(&self, pages: u32) -> Result<PageId> {
        Ok(self.alloc_fresh(pages as u64, 1)?.start_pid)
    }

    fn alloc_fresh(&self, page_cnt: u64, align: u64) -> Result<FreshAlloc> {
        let mut inner = self.inner.lock();
        let start = inner.next_page.next_multiple_of(align);
        if start + page_cnt > self.config.max_page_cnt() {
            return Err(StoreError::OutOfSpace);
        }
        let align_gap = if start > inner.next_page {
            Some(LargePage::new(
                PageId(inner.next_page),
                (start - inner.next_page) as u32,
            ))
        } else {
            None
        };
        for off in 0..page_cnt {
            let mut frame = Frame::zeroed();
            frame.prevent_evict = true;
            inner.frames.insert(PageId(start + off), frame);
        }
        inner.next_page = start + page_cnt;
        inner.physical_used += page_cnt;
        inner.stats.allocated_pages += page_cnt;
        self.maybe_reclaim(&mut inner);
        trace!(pid = start, pages = page_cnt, "buffer.alloc");
        Ok(FreshAlloc {
            start_pid: PageId(start),
            align_gap,
        })
    }

    /// Makes every page of `run` resident and pinned for writing. With
    /// `preserve`, existing file content is read back into absent frames;
    /// otherwise they start zeroed.
    pub fn ensure_resident_for_write(&self, run: LargePage, preserve: bool) -> Result<()> {
        let file_len = self.file.len()?;
        let mut inner = self.inner.lock();
        for off in 0..run.page_cnt as u64 {
            let pid = PageId(run.start_pid.0 + off);
            if let Some(frame) = inner.frames.get_mut(&pid) {
                frame.prevent_evict = true;
                continue;
            }
            let mut frame = Frame::zeroed();
            frame.prevent_evict = true;
            if preserve && pid.file_offset() + PAGE_SIZE as u64 <= file_len {
                self.file.read_at(pid.file_offset(), &mut frame.buf)?;
            }
            inner.frames.insert(pid, frame);
            inner.physical_used += 1;
        }
        Ok(())
    }

    /// Copies `src` into the run's frames starting at `byte_off` within the
    /// run. Every touched page must be resident.
    pub fn write_run(&self, run: LargePage, byte_off: u64, src: &[u8]) -> Result<()> {
        if byte_off + src.len() as u64 > run.page_cnt as u64 * PAGE_SIZE as u64 {
            return Err(StoreError::Invalid("write past end of page run"));
        }
        let mut inner = self.inner.lock();
        let mut cursor = byte_off;
        let mut remaining = src;
        while !remaining.is_empty() {
            let pid = PageId(run.start_pid.0 + cursor / PAGE_SIZE as u64);
            let in_page = (cursor % PAGE_SIZE as u64) as usize;
            let chunk_len = remaining.len().min(PAGE_SIZE - in_page);
            let frame = inner
                .frames
                .get_mut(&pid)
                .ok_or_else(|| invariant_violation("write to non-resident page"))?;
            frame.buf[in_page..in_page + chunk_len].copy_from_slice(&remaining[..chunk_len]);
            cursor += chunk_len as u64;
            remaining = &remaining[chunk_len..];
        }
        Ok(())
    }

    /// Copies run content starting at `byte_off` into `dst`, reading
    /// non-resident pages straight from the page file.
    pub fn read_run(&self, run: LargePage, byte_off: u64, dst: &mut [u8]) -> Result<()> {
        if byte_off + dst.len() as u64 > run.page_cnt as u64 * PAGE_SIZE as u64 {
            return Err(StoreError::Invalid("read past end of page run"));
        }
        let inner = self.inner.lock();
        let mut cursor = byte_off;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let pid = PageId(run.start_pid.0 + cursor / PAGE_SIZE as u64);
            let in_page = (cursor % PAGE_SIZE as u64) as usize;
            let chunk_len = remaining.len().min(PAGE_SIZE - in_page);
            let (chunk, tail) = remaining.split_at_mut(chunk_len);
            if let Some(frame) = inner.frames.get(&pid) {
                chunk.copy_from_slice(&frame.buf[in_page..in_page + chunk_len]);
            } else {
                if pid.0 >= inner.next_page {
                    return Err(StoreError::ReadFault(pid.0));
                }
                self.file.read_at(pid.file_offset() + in_page as u64, chunk)?;
            }
            cursor += chunk_len as u64;
            remaining = tail;
        }
        Ok(())
    }

    /// Brings every page of an extent to SHARED, issuing page-file reads
    /// for evicted pages.
    pub fn load_extent_shared(&self, run: LargePage) -> Result<()> {
        let mut inner = self.inner.lock();
        for off in 0..run.page_cnt as u64 {
            let pid = PageId(run.start_pid.0 + off);
            if let Some(frame) = inner.frames.get_mut(&pid) {
                frame.fix_shared()?;
                continue;
            }
            if pid.0 >= inner.next_page {
                return Err(StoreError::ReadFault(pid.0));
            }
            let mut frame = Frame::zeroed();
            self.file.read_at(pid.file_offset(), &mut frame.buf)?;
            frame.state = PageState::Shared(1);
            inner.frames.insert(pid, frame);
            inner.physical_used += 1;
            inner.stats.loaded_pages += 1;
        }
        trace!(pid = run.start_pid.0, pages = run.page_cnt, "buffer.load_shared");
        Ok(())
    }

    /// Drops one shared pin from every page of an extent.
    pub fn release_extent_shared(&self, run: LargePage) -> Result<()> {
        let mut inner = self.inner.lock();
        for off in 0..run.page_cnt as u64 {
            let pid = PageId(run.start_pid.0 + off);
            let frame = inner
                .frames
                .get_mut(&pid)
                .ok_or_else(|| invariant_violation("shared release on evicted page"))?;
            frame.unfix_shared()?;
        }
        Ok(())
    }

    /// Writes the run's frames back to the page file in batches of
    /// `async_batch_size` pages.
    pub fn flush_run(&self, run: LargePage) -> Result<()> {
        let batch_pages = self.config.async_batch_size.max(1) as usize;
        let inner = self.inner.lock();
        let mut batch = Vec::with_capacity(batch_pages * PAGE_SIZE);
        let mut batch_start = run.start_pid;
        for off in 0..run.page_cnt as u64 {
            let pid = PageId(run.start_pid.0 + off);
            let frame = inner
                .frames
                .get(&pid)
                .ok_or_else(|| invariant_violation("flush of non-resident page"))?;
            if batch.is_empty() {
                batch_start = pid;
            }
            batch.extend_from_slice(&frame.buf);
            if batch.len() >= batch_pages * PAGE_SIZE {
                self.file.write_at(batch_start.file_offset(), &batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.file.write_at(batch_start.file_offset(), &batch)?;
        }
        trace!(pid = run.start_pid.0, pages = run.page_cnt, "buffer.flush");
        Ok(())
    }

    /// Applies the post-flush state of the logging variant to an extent and
    /// clears its eviction pins.
    pub fn evict_extent(&self, run: LargePage, variant: LoggingVariant) -> Result<()> {
        let mut inner = self.inner.lock();
        for off in 0..run.page_cnt as u64 {
            let pid = PageId(run.start_pid.0 + off);
            let pinned = match inner.frames.get(&pid) {
                Some(frame) => frame.is_pinned(),
                None => continue,
            };
            if pinned {
                return Err(invariant_violation("evicting a pinned page"));
            }
            match variant {
                LoggingVariant::EvictImmediately => {
                    inner.frames.remove(&pid);
                    inner.physical_used -= 1;
                    inner.stats.evicted_pages += 1;
                }
                LoggingVariant::KeepUnlocked | LoggingVariant::Mark => {
                    let frame = inner.frames.get_mut(&pid).expect("frame checked above");
                    frame.prevent_evict = false;
                    frame.state = if variant == LoggingVariant::KeepUnlocked {
                        PageState::Unlocked
                    } else {
                        PageState::Marked
                    };
                }
            }
        }
        trace!(
            pid = run.start_pid.0,
            pages = run.page_cnt,
            variant = variant.as_str(),
            "buffer.evict"
        );
        Ok(())
    }

    /// Flushes the page file itself.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()
    }

    /// Current state of one page.
    pub fn page_state(&self, pid: PageId) -> PageState {
        let inner = self.inner.lock();
        inner
            .frames
            .get(&pid)
            .map(|frame| frame.state)
            .unwrap_or(PageState::Evicted)
    }

    /// Number of pages currently holding physical frames.
    pub fn physical_used(&self) -> u64 {
        self.inner.lock().physical_used
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats.clone()
    }

    pub(crate) fn next_page(&self) -> u64 {
        self.inner.lock().next_page
    }

    /// Drops the frames of a run without writing anything back; used when a
    /// transaction aborts its reservations.
    pub(crate) fn discard_run(&self, run: LargePage) {
        let mut inner = self.inner.lock();
        for off in 0..run.page_cnt as u64 {
            if inner.frames.remove(&PageId(run.start_pid.0 + off)).is_some() {
                inner.physical_used -= 1;
            }
        }
    }

    /// Cooling sweep: demotes a slice of unlocked frames to MARKED, then
    /// reclaims marked frames until the pool is back under its watermark.
    fn maybe_reclaim(&self, inner: &mut BufferInner) {
        let capacity = self.config.frame_capacity() as u64;
        if inner.physical_used <= capacity {
            return;
        }
        inner.stats.sweeps += 1;
        let cool_target = capacity * self.config.cool_pct as u64 / 100;
        let mut cooled = 0u64;
        let mut to_mark = Vec::new();
        let mut to_evict = Vec::new();
        for (&pid, frame) in inner.frames.iter() {
            if frame.prevent_evict || frame.is_pinned() {
                continue;
            }
            match frame.state {
                PageState::Unlocked if cooled < cool_target => {
                    to_mark.push(pid);
                    cooled += 1;
                }
                PageState::Marked => to_evict.push(pid),
                _ => {}
            }
        }
        for pid in to_mark {
            if let Some(frame) = inner.frames.get_mut(&pid) {
                frame.state = PageState::Marked;
            }
        }
        let reclaim_floor = capacity.saturating_sub(capacity * self.config.free_pct as u64 / 100);
        for pid in to_evict {
            if inner.physical_used <= reclaim_floor {
                break;
            }
            inner.frames.remove(&pid);
            inner.physical_used -= 1;
            inner.stats.evicted_pages += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StdFileIo;
    use tempfile::tempdir;

    fn open_buffer(dir: &tempfile::TempDir) -> BufferManager {
        let config = Arc::new(StoreConfig::default());
        let file = Arc::new(StdFileIo::open(dir.path().join("pages.db")).unwrap());
        BufferManager::new(config, file, 1).unwrap()
    }

    #[test]
    fn fresh_extents_are_buddy_aligned() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        assert_eq!(buffer.alloc_extent(0).unwrap().start_pid, PageId(1));
        assert_eq!(buffer.alloc_extent(1).unwrap().start_pid, PageId(2));
        assert_eq!(buffer.alloc_extent(2).unwrap().start_pid, PageId(4));
        assert_eq!(buffer.alloc_extent(3).unwrap().start_pid, PageId(8));
    }

    #[test]
    fn alignment_gap_is_reported_for_reuse() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        assert_eq!(buffer.alloc_extent(0).unwrap().align_gap, None);
        // next page is 2: a 4-page request skips pages 2 and 3
        let fresh = buffer.alloc_extent(2).unwrap();
        assert_eq!(fresh.start_pid, PageId(4));
        assert_eq!(fresh.align_gap, Some(LargePage::new(PageId(2), 2)));
        // tails are unaligned and never skip pages
        assert_eq!(buffer.alloc_tail(3).unwrap(), PageId(8));
    }

    #[test]
    fn write_then_read_run_roundtrip() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        let pid = buffer.alloc_extent(1).unwrap().start_pid;
        let run = LargePage::new(pid, 2);
        let payload: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        buffer.write_run(run, 0, &payload).unwrap();
        let mut out = vec![0u8; payload.len()];
        buffer.read_run(run, 0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn read_run_falls_back_to_disk_after_eviction() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        let pid = buffer.alloc_extent(0).unwrap().start_pid;
        let run = LargePage::new(pid, 1);
        buffer.write_run(run, 0, &[7u8; PAGE_SIZE]).unwrap();
        buffer.flush_run(run).unwrap();
        buffer
            .evict_extent(run, LoggingVariant::EvictImmediately)
            .unwrap();
        assert_eq!(buffer.page_state(pid), PageState::Evicted);
        let mut out = vec![0u8; PAGE_SIZE];
        buffer.read_run(run, 0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 7));
    }

    #[test]
    fn logging_variants_set_post_flush_state() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        for (variant, expected) in [
            (LoggingVariant::EvictImmediately, PageState::Evicted),
            (LoggingVariant::KeepUnlocked, PageState::Unlocked),
            (LoggingVariant::Mark, PageState::Marked),
        ] {
            let pid = buffer.alloc_extent(0).unwrap().start_pid;
            let run = LargePage::new(pid, 1);
            buffer.flush_run(run).unwrap();
            buffer.evict_extent(run, variant).unwrap();
            assert_eq!(buffer.page_state(pid), expected, "variant {variant:?}");
        }
    }

    #[test]
    fn physical_frame_accounting_per_variant() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        let pid = buffer.alloc_extent(2).unwrap().start_pid;
        let run = LargePage::new(pid, 4);
        let before = buffer.physical_used();
        buffer.flush_run(run).unwrap();
        buffer
            .evict_extent(run, LoggingVariant::EvictImmediately)
            .unwrap();
        assert_eq!(buffer.physical_used(), before - 4);

        let pid = buffer.alloc_extent(2).unwrap().start_pid;
        let run = LargePage::new(pid, 4);
        let before = buffer.physical_used();
        buffer.flush_run(run).unwrap();
        buffer.evict_extent(run, LoggingVariant::Mark).unwrap();
        assert_eq!(buffer.physical_used(), before);
    }

    #[test]
    fn evicted_extent_loads_back_shared() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        let pid = buffer.alloc_extent(1).unwrap().start_pid;
        let run = LargePage::new(pid, 2);
        buffer.write_run(run, 0, &[3u8; 2 * PAGE_SIZE]).unwrap();
        buffer.flush_run(run).unwrap();
        buffer
            .evict_extent(run, LoggingVariant::EvictImmediately)
            .unwrap();
        buffer.load_extent_shared(run).unwrap();
        assert_eq!(buffer.page_state(pid), PageState::Shared(1));
        buffer.release_extent_shared(run).unwrap();
        assert_eq!(buffer.page_state(pid), PageState::Unlocked);
    }

    #[test]
    fn load_beyond_file_is_a_read_fault() {
        let dir = tempdir().unwrap();
        let buffer = open_buffer(&dir);
        let run = LargePage::new(PageId(100), 1);
        match buffer.load_extent_shared(run) {
            Err(StoreError::ReadFault(pid)) => assert_eq!(pid, 100),
            other => panic!("expected read fault, got {other:?}"),
        }
    }
}
