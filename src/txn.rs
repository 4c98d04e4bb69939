//! Transaction-side state of the blob subsystem: the commit lists handed
//! to the writer at commit, and the per-transaction WAL buffer with its
//! byte cursor.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::io::FileIo;
use crate::types::{LargePage, PageId};

/// Encoded size of a [`LogEntry`] header.
pub const LOG_ENTRY_LEN: usize = 16;
/// Encoded size of a [`PageImgEntry`] header.
pub const PAGE_IMG_LEN: usize = 16;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum LogKind {
    TxStart = 1,
    PageImg = 2,
    TxCommit = 3,
}

impl TryFrom<u16> for LogKind {
    type Error = StoreError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(LogKind::TxStart),
            2 => Ok(LogKind::PageImg),
            3 => Ok(LogKind::TxCommit),
            _ => Err(StoreError::Corruption("unknown log record kind")),
        }
    }
}

/// Common header of every WAL record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LogEntry {
    pub txn_id: u64,
    pub kind: LogKind,
    /// Length of the record body following this header.
    pub len: u32,
}

impl LogEntry {
    pub fn encode(&self) -> [u8; LOG_ENTRY_LEN] {
        let mut buf = [0u8; LOG_ENTRY_LEN];
        buf[0..8].copy_from_slice(&self.txn_id.to_be_bytes());
        buf[8..10].copy_from_slice(&(self.kind as u16).to_be_bytes());
        buf[12..16].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_ENTRY_LEN {
            return Err(StoreError::Corruption("log entry truncated"));
        }
        if src[10..12] != [0, 0] {
            return Err(StoreError::Corruption("log entry reserved bytes non-zero"));
        }
        Ok(Self {
            txn_id: u64::from_be_bytes(src[0..8].try_into().unwrap()),
            kind: LogKind::try_from(u16::from_be_bytes(src[8..10].try_into().unwrap()))?,
            len: u32::from_be_bytes(src[12..16].try_into().unwrap()),
        })
    }
}

/// Header of a page-image record; followed by `length` bytes of page
/// content. Emitted only when growth writes into a partially filled
/// extent.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PageImgEntry {
    pub page_id: PageId,
    pub offset: u32,
    pub length: u32,
}

impl PageImgEntry {
    pub fn encode(&self) -> [u8; PAGE_IMG_LEN] {
        let mut buf = [0u8; PAGE_IMG_LEN];
        buf[0..8].copy_from_slice(&self.page_id.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_IMG_LEN {
            return Err(StoreError::Corruption("page image entry truncated"));
        }
        Ok(Self {
            page_id: PageId(u64::from_be_bytes(src[0..8].try_into().unwrap())),
            offset: u32::from_be_bytes(src[8..12].try_into().unwrap()),
            length: u32::from_be_bytes(src[12..16].try_into().unwrap()),
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TxnState {
    Running,
    Committed,
    Aborted,
}

/// One transaction's view of the blob subsystem.
///
/// Blob operations append to the commit lists; the store consumes them at
/// commit. The WAL buffer is private to the transaction until commit
/// appends it to the shared writer.
pub struct Transaction {
    txn_id: u64,
    wal: Vec<u8>,
    state: TxnState,
    pub(crate) to_flushed_large_pages: Vec<LargePage>,
    pub(crate) to_evicted_extents: Vec<LargePage>,
    pub(crate) to_free_extents: Vec<LargePage>,
    /// Every extent acquired by this transaction, for rollback on abort.
    pub(crate) reserved_extents: Vec<LargePage>,
}

impl Transaction {
    /// Starts a transaction; the start record is logged eagerly.
    pub(crate) fn begin(txn_id: u64) -> Self {
        let mut txn = Self {
            txn_id,
            wal: Vec::new(),
            state: TxnState::Running,
            to_flushed_large_pages: Vec::new(),
            to_evicted_extents: Vec::new(),
            to_free_extents: Vec::new(),
            reserved_extents: Vec::new(),
        };
        txn.append_entry(LogKind::TxStart, &[]);
        txn
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Byte position of the transaction's WAL cursor.
    pub fn wal_cursor(&self) -> u64 {
        self.wal.len() as u64
    }

    /// Extent runs the writer will persist at commit.
    pub fn flushed_large_pages(&self) -> &[LargePage] {
        &self.to_flushed_large_pages
    }

    /// Extent runs released for eviction at commit.
    pub fn evicted_extents(&self) -> &[LargePage] {
        &self.to_evicted_extents
    }

    /// Ranges entering the free-space index at commit.
    pub fn free_extents(&self) -> &[LargePage] {
        &self.to_free_extents
    }

    fn append_entry(&mut self, kind: LogKind, body: &[u8]) {
        let header = LogEntry {
            txn_id: self.txn_id,
            kind,
            len: body.len() as u32,
        };
        self.wal.extend_from_slice(&header.encode());
        self.wal.extend_from_slice(body);
    }

    /// Logs a page-image record for a partial in-place write.
    pub(crate) fn log_page_image(&mut self, page_id: PageId, offset: u32, payload: &[u8]) {
        let img = PageImgEntry {
            page_id,
            offset,
            length: payload.len() as u32,
        };
        let mut body = Vec::with_capacity(PAGE_IMG_LEN + payload.len());
        body.extend_from_slice(&img.encode());
        body.extend_from_slice(payload);
        self.append_entry(LogKind::PageImg, &body);
        trace!(
            txn = self.txn_id,
            pid = page_id.0,
            len = payload.len(),
            "txn.log_page_image"
        );
    }

    pub(crate) fn log_commit(&mut self) {
        self.append_entry(LogKind::TxCommit, &[]);
    }

    pub(crate) fn wal_bytes(&self) -> &[u8] {
        &self.wal
    }

    pub(crate) fn set_state(&mut self, state: TxnState) {
        self.state = state;
    }
}

/// Shared append sink for committed transactions' WAL buffers.
pub struct WalWriter {
    io: Arc<dyn FileIo>,
    offset: Mutex<u64>,
}

impl WalWriter {
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let offset = io.len()?;
        Ok(Self {
            io,
            offset: Mutex::new(offset),
        })
    }

    /// Appends a buffer and returns its start offset in the log.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut offset = self.offset.lock();
        let at = *offset;
        self.io.write_at(at, bytes)?;
        *offset += bytes.len() as u64;
        Ok(at)
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Current append position.
    pub fn cursor(&self) -> u64 {
        *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_roundtrip() {
        let entry = LogEntry {
            txn_id: 42,
            kind: LogKind::PageImg,
            len: 512,
        };
        let buf = entry.encode();
        assert_eq!(LogEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn log_entry_rejects_reserved_bytes() {
        let mut buf = LogEntry {
            txn_id: 1,
            kind: LogKind::TxStart,
            len: 0,
        }
        .encode();
        buf[11] = 1;
        assert!(matches!(
            LogEntry::decode(&buf),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn page_img_entry_roundtrip() {
        let entry = PageImgEntry {
            page_id: PageId(9),
            offset: 2048,
            length: 10240,
        };
        let buf = entry.encode();
        assert_eq!(PageImgEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn begin_logs_the_start_record() {
        let txn = Transaction::begin(7);
        assert_eq!(txn.wal_cursor(), LOG_ENTRY_LEN as u64);
        let header = LogEntry::decode(txn.wal_bytes()).unwrap();
        assert_eq!(header.kind, LogKind::TxStart);
        assert_eq!(header.txn_id, 7);
    }

    #[test]
    fn page_image_advances_cursor_by_record_size() {
        let mut txn = Transaction::begin(1);
        let pre = txn.wal_cursor();
        let payload = vec![0xAB; 10240];
        txn.log_page_image(PageId(4), 2048, &payload);
        assert_eq!(
            txn.wal_cursor() - pre,
            (LOG_ENTRY_LEN + PAGE_IMG_LEN + payload.len()) as u64
        );
    }
}
