//! The store facade: mount, transaction boundaries, and clean shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::blob::BlobManager;
use crate::buffer::BufferManager;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::free_space::FreeSpaceManager;
use crate::io::{FileIo, StdFileIo};
use crate::txn::{Transaction, TxnState, WalWriter};
use crate::types::PAGE_SIZE;

const GIB: u64 = 1 << 30;

const META_MAGIC: [u8; 4] = *b"TPDB";
const META_VERSION: u16 = 1;
const META_LEN: usize = 20;

/// Persisted store metadata living in the reserved page 0.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Meta {
    next_page: u64,
}

impl Meta {
    fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[0..4].copy_from_slice(&META_MAGIC);
        buf[4..6].copy_from_slice(&META_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.next_page.to_be_bytes());
        let crc = crc32fast::hash(&buf[..16]);
        buf[16..20].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < META_LEN {
            return Err(StoreError::Corruption("meta page truncated"));
        }
        if src[0..4] != META_MAGIC {
            return Err(StoreError::Corruption("meta magic mismatch"));
        }
        if u16::from_be_bytes(src[4..6].try_into().unwrap()) != META_VERSION {
            return Err(StoreError::Corruption("meta version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(StoreError::Corruption("meta reserved bytes non-zero"));
        }
        let stored_crc = u32::from_be_bytes(src[16..20].try_into().unwrap());
        if crc32fast::hash(&src[..16]) != stored_crc {
            return Err(StoreError::Corruption("meta crc mismatch"));
        }
        Ok(Self {
            next_page: u64::from_be_bytes(src[8..16].try_into().unwrap()),
        })
    }

    fn write_page(&self, file: &dyn FileIo) -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[..META_LEN].copy_from_slice(&self.encode());
        file.write_at(0, &page)?;
        file.sync_all()
    }
}

fn wal_path(path: &std::path::Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsString::from)
        .unwrap_or_else(|| std::ffi::OsString::from("tidepool"));
    name.push("-wal");
    let mut wal = path.to_path_buf();
    wal.set_file_name(name);
    wal
}

/// An opened store: the page file, its buffer pool, the free-space index,
/// and the WAL append sink.
pub struct Store {
    config: Arc<StoreConfig>,
    file: Arc<dyn FileIo>,
    buffer: Arc<BufferManager>,
    free_space: Arc<Mutex<FreeSpaceManager>>,
    wal: WalWriter,
    next_txn_id: AtomicU64,
}

impl Store {
    /// Opens the page file per the configuration (honoring `trunc` and
    /// `falloc`), restores the persisted free-pages list when present, and
    /// readies the WAL.
    pub fn mount(config: StoreConfig) -> Result<Self> {
        let config = Arc::new(config);
        let file: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&config.ssd_path)?);
        if config.trunc {
            file.truncate(0)?;
        }
        let meta = if file.len()? < PAGE_SIZE as u64 {
            let meta = Meta { next_page: 1 };
            meta.write_page(file.as_ref())?;
            meta
        } else {
            let mut page = vec![0u8; PAGE_SIZE];
            file.read_at(0, &mut page)?;
            Meta::decode(&page)?
        };
        if config.falloc_gib > 0 {
            file.preallocate(config.falloc_gib * GIB)?;
        }
        let free_space = match std::fs::read(&config.free_pages_list_path) {
            Ok(bytes) => FreeSpaceManager::decode(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                FreeSpaceManager::default()
            }
            Err(err) => return Err(StoreError::from(err)),
        };
        let wal_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(wal_path(&config.ssd_path))?);
        let buffer = Arc::new(BufferManager::new(
            Arc::clone(&config),
            Arc::clone(&file),
            meta.next_page,
        )?);
        info!(
            path = %config.ssd_path.display(),
            free_runs = free_space.len(),
            "store.mount"
        );
        Ok(Self {
            config,
            file,
            buffer,
            free_space: Arc::new(Mutex::new(free_space)),
            wal: WalWriter::open(wal_io)?,
            next_txn_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub fn free_space(&self) -> &Arc<Mutex<FreeSpaceManager>> {
        &self.free_space
    }

    /// A blob manager bound to the calling worker.
    pub fn blob_manager(&self) -> BlobManager {
        BlobManager::new(Arc::clone(&self.buffer), Arc::clone(&self.free_space))
    }

    /// Starts a transaction; its start record is logged immediately.
    pub fn begin_txn(&self) -> Transaction {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        Transaction::begin(txn_id)
    }

    /// Commits: appends the transaction's WAL buffer, flushes its large
    /// pages, applies the logging variant to the evictable extents, and
    /// publishes its freed ranges to the free-space index.
    pub fn commit(&self, mut txn: Transaction) -> Result<()> {
        txn.log_commit();
        self.wal.append(txn.wal_bytes())?;
        self.wal.sync()?;
        for run in &txn.to_flushed_large_pages {
            self.buffer.flush_run(*run)?;
        }
        self.buffer.sync()?;
        let variant = self.config.blob_logging_variant;
        for run in &txn.to_evicted_extents {
            self.buffer.evict_extent(*run, variant)?;
        }
        self.free_space
            .lock()
            .publish_free_ranges(&txn.to_free_extents)?;
        txn.set_state(TxnState::Committed);
        debug!(
            txn = txn.txn_id(),
            flushed = txn.to_flushed_large_pages.len(),
            freed = txn.to_free_extents.len(),
            "store.commit"
        );
        Ok(())
    }

    /// Aborts: the acquired extents return to the free index without ever
    /// touching the commit lists; nothing is flushed or logged.
    pub fn abort(&self, mut txn: Transaction) -> Result<()> {
        // drop unflushed frames so resident content never diverges from
        // disk; in-place grow writes reload their durable image on next use
        for run in &txn.to_flushed_large_pages {
            self.buffer.discard_run(*run);
        }
        let mut free_space = self.free_space.lock();
        for run in &txn.reserved_extents {
            self.buffer.discard_run(*run);
            free_space.free(run.start_pid.0, run.page_cnt)?;
        }
        txn.set_state(TxnState::Aborted);
        debug!(
            txn = txn.txn_id(),
            reservations = txn.reserved_extents.len(),
            "store.abort"
        );
        Ok(())
    }

    /// Clean shutdown: persists the metadata page and the free-pages list.
    pub fn shutdown(self) -> Result<()> {
        let meta = Meta {
            next_page: self.buffer.next_page(),
        };
        meta.write_page(self.file.as_ref())?;
        let encoded = self.free_space.lock().encode();
        let tmp = self.config.free_pages_list_path.with_extension("tmp");
        std::fs::write(&tmp, &encoded)?;
        std::fs::rename(&tmp, &self.config.free_pages_list_path)?;
        info!(
            path = %self.config.free_pages_list_path.display(),
            "store.shutdown"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip() {
        let meta = Meta { next_page: 77 };
        let buf = meta.encode();
        assert_eq!(Meta::decode(&buf).unwrap(), meta);
    }

    #[test]
    fn meta_rejects_corruption() {
        let mut buf = Meta { next_page: 77 }.encode();
        buf[9] ^= 0xFF;
        assert!(matches!(
            Meta::decode(&buf),
            Err(StoreError::Corruption(_))
        ));
        let mut bad_magic = Meta { next_page: 1 }.encode();
        bad_magic[0] = b'X';
        assert!(Meta::decode(&bad_magic).is_err());
    }
}
