use std::path::PathBuf;

use crate::types::PAGE_SIZE;

const GIB: u64 = 1 << 30;

/// Post-flush page state for extents a committing transaction releases
/// for eviction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum LoggingVariant {
    /// Pages transition to EVICTED; physical frames are released at commit.
    #[default]
    EvictImmediately,
    /// Pages stay UNLOCKED in memory and may be re-read without I/O.
    KeepUnlocked,
    /// Pages transition to MARKED; resident until the cooling sweep
    /// reclaims them.
    Mark,
}

impl LoggingVariant {
    /// Returns the string representation of the variant.
    pub fn as_str(self) -> &'static str {
        match self {
            LoggingVariant::EvictImmediately => "evict",
            LoggingVariant::KeepUnlocked => "keep",
            LoggingVariant::Mark => "mark",
        }
    }

    /// Parses a variant from its numeric flag value.
    pub fn from_flag(value: u32) -> Option<Self> {
        match value {
            0 => Some(LoggingVariant::EvictImmediately),
            1 => Some(LoggingVariant::KeepUnlocked),
            2 => Some(LoggingVariant::Mark),
            _ => None,
        }
    }
}

/// Configuration for a store, built once at mount and then immutable.
///
/// There are no process-wide mutable knobs; every component receives this
/// object by reference.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Buffer-pool size in GiB; caps the number of physical frames.
    pub dram_gib: u64,
    /// Backing-file size in GiB; caps page allocation.
    pub ssd_gib: u64,
    /// Path of the page file.
    pub ssd_path: PathBuf,
    /// Path of the persisted free-pages list.
    pub free_pages_list_path: PathBuf,
    /// Cooling watermark: percentage of unlocked frames marked per sweep.
    pub cool_pct: u32,
    /// Free-frame watermark: sweep triggers when fewer than this
    /// percentage of frames are free.
    pub free_pct: u32,
    /// I/O batching width (in pages) for commit write-back.
    pub async_batch_size: u32,
    /// Post-flush page state for blob extents.
    pub blob_logging_variant: LoggingVariant,
    /// Disables the aliasing window; loads gather extent-by-extent into a
    /// plain heap buffer.
    pub blob_normal_buffer_pool: bool,
    /// Number of workers the surrounding runtime schedules onto.
    pub worker_count: usize,
    /// Truncate the page file at mount.
    pub trunc: bool,
    /// Pre-size the page file by this many GiB at mount (0 disables).
    pub falloc_gib: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dram_gib: 1,
            ssd_gib: 10,
            ssd_path: PathBuf::from("tidepool.db"),
            free_pages_list_path: PathBuf::from("tidepool.free"),
            cool_pct: 10,
            free_pct: 1,
            async_batch_size: 64,
            blob_logging_variant: LoggingVariant::default(),
            blob_normal_buffer_pool: false,
            worker_count: 4,
            trunc: false,
            falloc_gib: 0,
        }
    }
}

impl StoreConfig {
    /// Number of physical frames the buffer pool may hold.
    pub fn frame_capacity(&self) -> usize {
        (self.dram_gib * GIB / PAGE_SIZE as u64) as usize
    }

    /// Highest page count the backing file may grow to.
    pub fn max_page_cnt(&self) -> u64 {
        self.ssd_gib * GIB / PAGE_SIZE as u64
    }
}
