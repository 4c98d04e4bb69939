//! Allocation, growth, loading, and removal of blobs.
//!
//! A `BlobManager` belongs to exactly one worker. Operations run to
//! completion on that worker and are never interleaved; the loaded-extent
//! set and the aliasing window are worker-local and unsynchronized.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::extent::{extent_page_cnt, ExtentList, TailExtent};
use super::state::{content_hash, BlobState};
use crate::buffer::alias::{AliasingArea, PageAliasGuard};
use crate::buffer::BufferManager;
use crate::error::{invariant_violation, Result, StoreError};
use crate::free_space::FreeSpaceManager;
use crate::txn::Transaction;
use crate::types::{LargePage, PageId, PAGE_SIZE};

pub struct BlobManager {
    buffer: Arc<BufferManager>,
    free_space: Arc<Mutex<FreeSpaceManager>>,
    /// Extents this worker holds SHARED pins on, keyed by start pid.
    extent_loaded: BTreeMap<PageId, u32>,
    alias: AliasingArea,
    /// Gather buffer for loads when the aliasing window is disabled.
    scratch: Vec<u8>,
    /// Diagnostic slot: the header most recently produced on this worker.
    last_blob: Option<BlobState>,
}

impl BlobManager {
    pub(crate) fn new(
        buffer: Arc<BufferManager>,
        free_space: Arc<Mutex<FreeSpaceManager>>,
    ) -> Self {
        Self {
            buffer,
            free_space,
            extent_loaded: BTreeMap::new(),
            alias: AliasingArea::new(),
            scratch: Vec::new(),
            last_blob: None,
        }
    }

    /// Stores `payload` as a new blob, or appends it to `prev` when given.
    ///
    /// The returned header is owned by the caller; the manager retains only
    /// a diagnostic copy. On error nothing observable changes: reservations
    /// are rolled back when the surrounding transaction aborts and `prev`
    /// is never modified.
    pub fn allocate_blob(
        &mut self,
        txn: &mut Transaction,
        payload: &[u8],
        prev: Option<&BlobState>,
        likely_grow: bool,
    ) -> Result<BlobState> {
        let state = match prev {
            None => self.fresh_blob_allocation(txn, payload, likely_grow)?,
            Some(prev) => self.extend_existing_blob(txn, payload, prev)?,
        };
        self.last_blob = Some(state.clone());
        Ok(state)
    }

    /// Publishes every extent of `blob`, tail included, to the
    /// transaction's free list. The ranges reach the free-space index only
    /// when the transaction commits.
    pub fn remove_blob(&mut self, txn: &mut Transaction, blob: &BlobState) -> Result<()> {
        for unit in 0..blob.extents.unit_cnt() {
            let run = blob.extents.unit(unit);
            if txn
                .to_free_extents
                .iter()
                .any(|published| published.start_pid == run.start_pid)
            {
                return Err(invariant_violation("blob removed twice in one transaction"));
            }
        }
        for unit in 0..blob.extents.unit_cnt() {
            txn.to_free_extents.push(blob.extents.unit(unit));
        }
        trace!(
            size = blob.blob_size,
            extents = blob.extents.unit_cnt(),
            "blob.remove"
        );
        Ok(())
    }

    /// Loads the extents covering `[offset, offset + required_load_size)`
    /// and invokes `cb` exactly once with the contiguous span.
    ///
    /// The span starts at the first covered extent's logical base; callers
    /// reaching an interior offset index with the intra-extent remainder of
    /// `offset`. Pages stay SHARED-pinned until [`unload_all_blobs`].
    ///
    /// [`unload_all_blobs`]: Self::unload_all_blobs
    pub fn load_blob<F>(
        &mut self,
        blob: &BlobState,
        required_load_size: u64,
        offset: u64,
        cb: F,
    ) -> Result<()>
    where
        F: FnOnce(&[u8]),
    {
        if offset > 0 && offset >= blob.blob_size {
            return Err(StoreError::Invalid("load offset beyond blob size"));
        }
        self.load_blob_content(blob, required_load_size, offset)?;
        let end = offset.saturating_add(required_load_size);
        if self.buffer.config().blob_normal_buffer_pool {
            let len = self.gather_into_scratch(blob, offset, end)?;
            cb(&self.scratch[..len]);
        } else {
            let guard = PageAliasGuard::map(&self.buffer, &mut self.alias, blob, offset..end)?;
            cb(guard.as_slice());
        }
        trace!(
            size = blob.blob_size,
            required = required_load_size,
            offset,
            "blob.load"
        );
        Ok(())
    }

    /// Releases every SHARED pin this worker holds and vacates the
    /// aliasing area.
    pub fn unload_all_blobs(&mut self) -> Result<()> {
        for (&start_pid, &page_cnt) in &self.extent_loaded {
            self.buffer
                .release_extent_shared(LargePage::new(start_pid, page_cnt))?;
        }
        trace!(extents = self.extent_loaded.len(), "blob.unload_all");
        self.extent_loaded.clear();
        self.alias.release();
        Ok(())
    }

    /// Orders two blobs by their logical content. Both payloads are
    /// realized through the aliasing window, one after the other; the
    /// loaded extents stay pinned for the caller to release.
    pub fn compare(&mut self, a: &BlobState, b: &BlobState) -> Result<Ordering> {
        if a.blob_size == b.blob_size && a.hash == b.hash && a.hash != [0u8; 32] {
            return Ok(Ordering::Equal);
        }
        let mut a_content = Vec::with_capacity(a.blob_size as usize);
        self.load_blob(a, a.blob_size, 0, |span| a_content.extend_from_slice(span))?;
        let mut ord = Ordering::Equal;
        self.load_blob(b, b.blob_size, 0, |span| ord = a_content.as_slice().cmp(span))?;
        Ok(ord)
    }

    /// Orders a blob against a plain byte string, short-circuiting on the
    /// first differing prefix byte.
    pub fn compare_with_bytes(&mut self, blob: &BlobState, bytes: &[u8]) -> Result<Ordering> {
        let prefix = (bytes.len() as u64).min(blob.blob_size) as usize;
        let mut ord = Ordering::Equal;
        if prefix > 0 {
            self.load_blob(blob, prefix as u64, 0, |span| {
                ord = span[..prefix].cmp(&bytes[..prefix]);
            })?;
        }
        Ok(ord.then(blob.blob_size.cmp(&(bytes.len() as u64))))
    }

    /// The header most recently produced on this worker, if any. Callers
    /// that must retain a header copy it; this slot is diagnostic only.
    pub fn last_blob(&self) -> Option<&BlobState> {
        self.last_blob.as_ref()
    }

    fn fresh_blob_allocation(
        &mut self,
        txn: &mut Transaction,
        payload: &[u8],
        likely_grow: bool,
    ) -> Result<BlobState> {
        let page_cnt = (payload.len() as u64).div_ceil(PAGE_SIZE as u64);
        let (extent_cnt, tail_pages) = if likely_grow {
            (super::extent::growing_schedule(page_cnt)?, 0)
        } else {
            super::extent::fixed_schedule(page_cnt)?
        };
        let mut extents = ExtentList::default();
        for slot in 0..extent_cnt {
            let run = self.acquire_extent(txn, slot)?;
            extents.extent_pids.push(run.start_pid);
        }
        if tail_pages > 0 {
            let start_pid = self.acquire_tail(txn, tail_pages)?;
            extents.special_blk = TailExtent {
                start_pid,
                page_cnt: tail_pages,
                in_used: true,
            };
        }
        self.write_payload(&extents, 0, payload)?;
        let mut state = BlobState {
            blob_size: payload.len() as u64,
            prev_blob_size: payload.len() as u64,
            hash: [0u8; 32],
            extents,
        };
        state.calculate_hash(payload);
        for unit in 0..state.extents.unit_cnt() {
            let run = state.extents.unit(unit);
            txn.to_flushed_large_pages.push(run);
            txn.to_evicted_extents.push(run);
        }
        trace!(
            size = state.blob_size,
            extents = extent_cnt,
            tail_pages,
            likely_grow,
            "blob.alloc.fresh"
        );
        Ok(state)
    }

    fn extend_existing_blob(
        &mut self,
        txn: &mut Transaction,
        payload: &[u8],
        prev: &BlobState,
    ) -> Result<BlobState> {
        let mut state = prev.clone();
        state.prev_blob_size = prev.blob_size;
        let written = if prev.extents.special_blk.in_used {
            self.move_tail_extent(txn, payload, &mut state)?
        } else {
            self.write_new_data_to_last_extent(txn, payload, &mut state)?
        };
        let mut residual = &payload[written..];
        while !residual.is_empty() {
            let slot = state.extents.extent_cnt();
            let run = self.acquire_extent(txn, slot)?;
            state.extents.extent_pids.push(run.start_pid);
            let take = residual.len().min(run.page_cnt as usize * PAGE_SIZE);
            self.buffer.write_run(run, 0, &residual[..take])?;
            txn.to_flushed_large_pages.push(run);
            txn.to_evicted_extents.push(run);
            residual = &residual[take..];
        }
        state.blob_size = prev.blob_size + payload.len() as u64;
        let guard = PageAliasGuard::map(&self.buffer, &mut self.alias, &state, 0..state.blob_size)?;
        let hash = content_hash(guard.as_slice());
        drop(guard);
        state.hash = hash;
        trace!(
            size = state.blob_size,
            prev_size = state.prev_blob_size,
            extents = state.extents.extent_cnt(),
            "blob.alloc.extend"
        );
        Ok(state)
    }

    /// Grow case for a blob whose last extent still has unfilled capacity:
    /// the suffix prefix lands there in place, producing one page-image
    /// WAL record for the partially overwritten span. Earlier extents are
    /// neither rewritten nor reloaded. Returns the bytes consumed.
    fn write_new_data_to_last_extent(
        &mut self,
        txn: &mut Transaction,
        payload: &[u8],
        state: &mut BlobState,
    ) -> Result<usize> {
        let extent_cnt = state.extents.extent_cnt();
        if extent_cnt == 0 || payload.is_empty() {
            return Ok(0);
        }
        let last = state.extents.extent(extent_cnt - 1);
        let base = state.extents.unit_base_bytes(extent_cnt - 1);
        let filled = state.blob_size - base;
        let capacity = last.page_cnt as u64 * PAGE_SIZE as u64;
        let remaining = capacity - filled;
        if remaining == 0 {
            return Ok(0);
        }
        let take = payload.len().min(remaining as usize);
        let first_dirty = filled / PAGE_SIZE as u64;
        let last_dirty = (filled + take as u64 - 1) / PAGE_SIZE as u64;
        let dirty = LargePage::new(
            PageId(last.start_pid.0 + first_dirty),
            (last_dirty - first_dirty + 1) as u32,
        );
        // only the dirty chunk re-enters the pool; the already-durable
        // prefix of the extent is neither rewritten nor reloaded
        self.buffer.ensure_resident_for_write(dirty, true)?;
        self.buffer
            .write_run(dirty, filled - first_dirty * PAGE_SIZE as u64, &payload[..take])?;
        txn.log_page_image(
            dirty.start_pid,
            (filled % PAGE_SIZE as u64) as u32,
            &payload[..take],
        );
        txn.to_flushed_large_pages.push(dirty);
        txn.to_evicted_extents.push(dirty);
        Ok(take)
    }

    /// Grow case for a blob with an active tail: the tail cannot be
    /// extended, so its content is promoted into the natural next
    /// power-of-two slot together with as much of the suffix as fits. The
    /// promoted data is already durable in the tail pages and the new
    /// extent is backed by fresh pages, so no page image is logged; the
    /// superseded tail is only marked for eviction. Returns the bytes
    /// consumed.
    fn move_tail_extent(
        &mut self,
        txn: &mut Transaction,
        payload: &[u8],
        state: &mut BlobState,
    ) -> Result<usize> {
        let tail = state.extents.special_blk;
        let slot = state.extents.extent_cnt();
        let tail_base = state.extents.unit_base_bytes(slot);
        let tail_filled = (state.blob_size - tail_base) as usize;
        let mut tail_data = vec![0u8; tail_filled];
        self.buffer
            .read_run(tail.as_large_page(), 0, &mut tail_data)?;
        let run = self.acquire_extent(txn, slot)?;
        state.extents.extent_pids.push(run.start_pid);
        self.buffer.write_run(run, 0, &tail_data)?;
        let capacity = run.page_cnt as usize * PAGE_SIZE;
        let take = payload.len().min(capacity - tail_filled);
        self.buffer
            .write_run(run, tail_filled as u64, &payload[..take])?;
        state.extents.special_blk = TailExtent::unused();
        txn.to_evicted_extents.push(tail.as_large_page());
        txn.to_flushed_large_pages.push(run);
        txn.to_evicted_extents.push(run);
        trace!(
            tail_pages = tail.page_cnt,
            promoted_slot = slot,
            "blob.alloc.move_tail"
        );
        Ok(take)
    }

    /// Fetches a buddy-aligned `2^slot` run: best fit from the free index,
    /// fresh pages from the buffer manager on a miss. Pages the buffer
    /// manager skipped for alignment go straight into the free index.
    fn acquire_extent(&mut self, txn: &mut Transaction, slot: usize) -> Result<LargePage> {
        let page_cnt = extent_page_cnt(slot);
        let reused = self.free_space.lock().request_extent(slot);
        let run = match reused {
            Some(pid) => {
                let run = LargePage::new(pid, page_cnt);
                self.buffer.ensure_resident_for_write(run, false)?;
                run
            }
            None => {
                let fresh = self.buffer.alloc_extent(slot)?;
                if let Some(gap) = fresh.align_gap {
                    self.free_space.lock().free(gap.start_pid.0, gap.page_cnt)?;
                }
                LargePage::new(fresh.start_pid, page_cnt)
            }
        };
        txn.reserved_extents.push(run);
        Ok(run)
    }

    fn acquire_tail(&mut self, txn: &mut Transaction, pages: u32) -> Result<PageId> {
        let reused = self.free_space.lock().request_tail(pages);
        let start_pid = match reused {
            Some(pid) => {
                self.buffer
                    .ensure_resident_for_write(LargePage::new(pid, pages), false)?;
                pid
            }
            None => self.buffer.alloc_tail(pages)?,
        };
        txn.reserved_extents.push(LargePage::new(start_pid, pages));
        Ok(start_pid)
    }

    /// Copies `src` into the blob's units starting at logical `offset`.
    fn write_payload(&self, extents: &ExtentList, mut offset: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let unit = extents.unit_covering(offset)?;
            let run = extents.unit(unit);
            let in_unit = offset - extents.unit_base_bytes(unit);
            let unit_capacity = run.page_cnt as u64 * PAGE_SIZE as u64;
            let chunk = src.len().min((unit_capacity - in_unit) as usize);
            self.buffer.write_run(run, in_unit, &src[..chunk])?;
            offset += chunk as u64;
            src = &src[chunk..];
        }
        Ok(())
    }

    /// Pins the extents whose logical byte range intersects the request,
    /// reading evicted pages back from the page file.
    fn load_blob_content(
        &mut self,
        blob: &BlobState,
        required_load_size: u64,
        offset: u64,
    ) -> Result<()> {
        let end = offset.saturating_add(required_load_size).min(blob.blob_size);
        if offset >= end {
            return Ok(());
        }
        let first = blob.extents.unit_covering(offset)?;
        let last = blob.extents.unit_covering(end - 1)?;
        for unit in first..=last {
            let run = blob.extents.unit(unit);
            if self.extent_loaded.contains_key(&run.start_pid) {
                continue;
            }
            self.buffer.load_extent_shared(run)?;
            self.extent_loaded.insert(run.start_pid, run.page_cnt);
        }
        Ok(())
    }

    /// Fallback gather path when the aliasing window is disabled: copies
    /// the covered units extent by extent into the worker's heap buffer.
    /// Returns the delivered span length.
    fn gather_into_scratch(&mut self, blob: &BlobState, offset: u64, end: u64) -> Result<usize> {
        let end = end.min(blob.blob_size);
        if offset >= end {
            self.scratch.clear();
            return Ok(0);
        }
        let first = blob.extents.unit_covering(offset)?;
        let last = blob.extents.unit_covering(end - 1)?;
        let window_base = blob.extents.unit_base_bytes(first);
        let gathered = blob.extents.unit_base_bytes(last) - window_base
            + blob.extents.unit(last).page_cnt as u64 * PAGE_SIZE as u64;
        self.scratch.resize(gathered as usize, 0);
        for unit in first..=last {
            let run = blob.extents.unit(unit);
            let dst_off = (blob.extents.unit_base_bytes(unit) - window_base) as usize;
            let dst_len = run.page_cnt as usize * PAGE_SIZE;
            self.buffer
                .read_run(run, 0, &mut self.scratch[dst_off..dst_off + dst_len])?;
        }
        Ok((end - window_base) as usize)
    }
}
