//! The compact, self-describing blob header and its binary codec.

use sha2::{Digest, Sha256};
use smallvec::SmallVec;

use super::extent::{ExtentList, TailExtent, MAX_EXTENT_CNT};
use crate::error::{Result, StoreError};
use crate::types::{PageId, PAGE_SIZE};

/// Byte ranges of the fixed header prefix.
pub mod layout {
    use core::ops::Range;

    pub const BLOB_SIZE: Range<usize> = 0..8;
    pub const PREV_BLOB_SIZE: Range<usize> = 8..16;
    pub const HASH: Range<usize> = 16..48;
    pub const EXTENT_CNT: Range<usize> = 48..50;
    pub const TAIL_IN_USED: usize = 50;
    pub const RESERVED: usize = 51;
    pub const TAIL_START: Range<usize> = 52..60;
    pub const TAIL_PAGES: Range<usize> = 60..64;
    pub const FIXED_LEN: usize = 64;
}

/// Exact serialized size of a header with `extent_cnt` extents.
pub const fn malloc_size(extent_cnt: usize) -> usize {
    layout::FIXED_LEN + 8 * extent_cnt
}

/// Upper bound on any serialized header.
pub const MAX_MALLOC_SIZE: usize = malloc_size(MAX_EXTENT_CNT);

/// Descriptor of one stored blob: logical size, content digest, and the
/// ordered extent list. A pure value; holds no buffer-pool references.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct BlobState {
    /// Logical byte length.
    pub blob_size: u64,
    /// Size before the most recent grow; equals `blob_size` for fresh blobs.
    pub prev_blob_size: u64,
    /// Content digest; zeroed until the last extent is written.
    pub hash: [u8; 32],
    pub extents: ExtentList,
}

impl BlobState {
    /// Number of pages the logical payload occupies.
    pub fn page_count(&self) -> u64 {
        self.blob_size.div_ceil(PAGE_SIZE as u64)
    }

    /// Exact serialized size of this header.
    pub fn malloc_size(&self) -> usize {
        malloc_size(self.extents.extent_cnt())
    }

    /// Fills `hash` with the digest of the fully written payload.
    pub fn calculate_hash(&mut self, payload: &[u8]) {
        self.hash = content_hash(payload);
    }

    pub fn encode_into(&self, dst: &mut [u8]) -> Result<usize> {
        let len = self.malloc_size();
        if dst.len() < len {
            return Err(StoreError::Invalid("blob state buffer too small"));
        }
        let extent_cnt = self.extents.extent_cnt();
        if extent_cnt > MAX_EXTENT_CNT {
            return Err(StoreError::Invalid("blob state extent count too large"));
        }
        dst[layout::BLOB_SIZE].copy_from_slice(&self.blob_size.to_be_bytes());
        dst[layout::PREV_BLOB_SIZE].copy_from_slice(&self.prev_blob_size.to_be_bytes());
        dst[layout::HASH].copy_from_slice(&self.hash);
        dst[layout::EXTENT_CNT].copy_from_slice(&(extent_cnt as u16).to_be_bytes());
        dst[layout::TAIL_IN_USED] = u8::from(self.extents.special_blk.in_used);
        dst[layout::RESERVED] = 0;
        dst[layout::TAIL_START].copy_from_slice(&self.extents.special_blk.start_pid.0.to_be_bytes());
        dst[layout::TAIL_PAGES].copy_from_slice(&self.extents.special_blk.page_cnt.to_be_bytes());
        for (idx, pid) in self.extents.extent_pids.iter().enumerate() {
            let off = layout::FIXED_LEN + idx * 8;
            dst[off..off + 8].copy_from_slice(&pid.0.to_be_bytes());
        }
        Ok(len)
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < layout::FIXED_LEN {
            return Err(StoreError::Corruption("blob state truncated"));
        }
        let extent_cnt =
            u16::from_be_bytes(src[layout::EXTENT_CNT].try_into().unwrap()) as usize;
        if extent_cnt > MAX_EXTENT_CNT {
            return Err(StoreError::Corruption("blob state extent count too large"));
        }
        if src.len() < malloc_size(extent_cnt) {
            return Err(StoreError::Corruption("blob state truncated"));
        }
        let in_used = match src[layout::TAIL_IN_USED] {
            0 => false,
            1 => true,
            _ => return Err(StoreError::Corruption("blob state tail flag invalid")),
        };
        if src[layout::RESERVED] != 0 {
            return Err(StoreError::Corruption("blob state reserved byte not zero"));
        }
        let tail_pages = u32::from_be_bytes(src[layout::TAIL_PAGES].try_into().unwrap());
        if in_used && (tail_pages == 0 || tail_pages as u64 >= 1u64 << extent_cnt) {
            return Err(StoreError::Corruption("blob state tail length invalid"));
        }
        let mut extent_pids = SmallVec::new();
        for idx in 0..extent_cnt {
            let off = layout::FIXED_LEN + idx * 8;
            extent_pids.push(PageId(u64::from_be_bytes(
                src[off..off + 8].try_into().unwrap(),
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&src[layout::HASH]);
        Ok(Self {
            blob_size: u64::from_be_bytes(src[layout::BLOB_SIZE].try_into().unwrap()),
            prev_blob_size: u64::from_be_bytes(
                src[layout::PREV_BLOB_SIZE].try_into().unwrap(),
            ),
            hash,
            extents: ExtentList {
                extent_pids,
                special_blk: TailExtent {
                    start_pid: PageId(u64::from_be_bytes(
                        src[layout::TAIL_START].try_into().unwrap(),
                    )),
                    page_cnt: tail_pages,
                    in_used,
                },
            },
        })
    }
}

/// SHA-256 digest of a blob payload.
pub fn content_hash(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Fixed-capacity scratch buffer for headers that must outlive the
/// operation that produced them. Storage and decoded view have distinct
/// lifetimes: `store` truncates to the header's exact size, `view`
/// re-materializes the typed value.
pub struct TempBlobStorage {
    buf: Box<[u8; MAX_MALLOC_SIZE]>,
    len: usize,
}

impl Default for TempBlobStorage {
    fn default() -> Self {
        Self {
            buf: Box::new([0u8; MAX_MALLOC_SIZE]),
            len: 0,
        }
    }
}

impl TempBlobStorage {
    pub fn store(&mut self, state: &BlobState) -> Result<()> {
        self.len = state.encode_into(&mut self.buf[..])?;
        Ok(())
    }

    pub fn view(&self) -> Result<BlobState> {
        if self.len == 0 {
            return Err(StoreError::Invalid("temp blob storage is empty"));
        }
        BlobState::decode(&self.buf[..self.len])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
