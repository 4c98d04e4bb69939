//! The per-worker aliasing window.
//!
//! A blob's extents are scattered page runs; the aliasing area stages the
//! loaded extents contiguously so comparators and load callbacks observe a
//! single byte range. One window exists per worker and at most one guard
//! may hold it at a time.

use std::ops::Range;

use crate::blob::state::BlobState;
use crate::error::{invariant_violation, Result};

use super::BufferManager;

/// The reserved gather buffer of one worker.
#[derive(Default)]
pub struct AliasingArea {
    buf: Vec<u8>,
    mapped: bool,
}

impl AliasingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a guard currently holds the window.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Releases the window's backing memory.
    pub fn release(&mut self) {
        debug_assert!(!self.mapped, "releasing a mapped aliasing area");
        self.buf = Vec::new();
    }
}

/// Scoped occupation of the aliasing window for one blob.
///
/// Maps the extents covering `load_range` so that the span returned by
/// [`as_slice`](Self::as_slice) starts at the first covered extent's
/// logical base; callers reaching an interior offset index with
/// `offset - window_base_bytes()`. Dropping the guard vacates the window.
pub struct PageAliasGuard<'a> {
    area: &'a mut AliasingArea,
    window_base: u64,
    len: usize,
}

impl<'a> PageAliasGuard<'a> {
    pub fn map(
        buffer: &BufferManager,
        area: &'a mut AliasingArea,
        blob: &BlobState,
        load_range: Range<u64>,
    ) -> Result<Self> {
        if area.mapped {
            return Err(invariant_violation("aliasing area already mapped"));
        }
        let end = load_range.end.min(blob.blob_size);
        if load_range.start >= end {
            area.mapped = true;
            return Ok(Self {
                area,
                window_base: 0,
                len: 0,
            });
        }
        let extents = &blob.extents;
        let first = extents.unit_covering(load_range.start)?;
        let last = extents.unit_covering(end - 1)?;
        let window_base = extents.unit_base_bytes(first);
        let gathered = extents.unit_base_bytes(last) - window_base
            + extents.unit(last).page_cnt as u64 * crate::types::PAGE_SIZE as u64;
        area.buf.resize(gathered as usize, 0);
        for unit in first..=last {
            let run = extents.unit(unit);
            let dst_off = (extents.unit_base_bytes(unit) - window_base) as usize;
            let dst_len = run.page_cnt as usize * crate::types::PAGE_SIZE;
            buffer.read_run(run, 0, &mut area.buf[dst_off..dst_off + dst_len])?;
        }
        area.mapped = true;
        Ok(Self {
            area,
            window_base,
            len: (end - window_base) as usize,
        })
    }

    /// Logical byte offset of the window's first byte within the blob.
    pub fn window_base_bytes(&self) -> u64 {
        self.window_base
    }

    /// The contiguous view over the mapped extents, truncated to the
    /// blob's logical end.
    pub fn as_slice(&self) -> &[u8] {
        &self.area.buf[..self.len]
    }
}

impl Drop for PageAliasGuard<'_> {
    fn drop(&mut self) {
        self.area.mapped = false;
    }
}
