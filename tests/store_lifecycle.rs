use std::path::Path;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tidepool::{LoggingVariant, PageId, Result, Store, StoreConfig, StoreError, PAGE_SIZE};

fn config_at(dir: &Path) -> StoreConfig {
    StoreConfig {
        ssd_path: dir.join("pages.db"),
        free_pages_list_path: dir.join("pages.free"),
        blob_logging_variant: LoggingVariant::EvictImmediately,
        ..StoreConfig::default()
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn free_list_survives_clean_shutdown() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let store = Store::mount(config_at(dir.path()))?;
    let mut manager = store.blob_manager();
    let mut txn = store.begin_txn();
    let blob = manager.allocate_blob(&mut txn, &payload(18432), None, true)?;
    store.commit(txn)?;
    let mut txn = store.begin_txn();
    manager.remove_blob(&mut txn, &blob)?;
    store.commit(txn)?;
    let runs_before: Vec<_> = store.free_space().lock().entries().collect();
    assert_eq!(runs_before.len(), 3);
    store.shutdown()?;

    let store = Store::mount(config_at(dir.path()))?;
    let runs_after: Vec<_> = store.free_space().lock().entries().collect();
    assert_eq!(runs_after, runs_before);
    // the restored index serves the same extents again
    assert_eq!(store.free_space().lock().request_extent(2), Some(PageId(4)));
    Ok(())
}

#[test]
fn blob_survives_remount() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut rng = StdRng::seed_from_u64(42);
    let data: Vec<u8> = (0..3 * PAGE_SIZE + 17).map(|_| rng.gen()).collect();

    let blob = {
        let store = Store::mount(config_at(dir.path()))?;
        let mut manager = store.blob_manager();
        let mut txn = store.begin_txn();
        let blob = manager.allocate_blob(&mut txn, &data, None, false)?;
        store.commit(txn)?;
        store.shutdown()?;
        blob
    };

    let store = Store::mount(config_at(dir.path()))?;
    let mut manager = store.blob_manager();
    let mut fetched = Vec::new();
    manager.load_blob(&blob, blob.blob_size, 0, |span| {
        fetched.extend_from_slice(span);
    })?;
    assert_eq!(fetched, data);
    manager.unload_all_blobs()?;
    Ok(())
}

#[test]
fn abort_returns_reservations_to_the_free_index() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::mount(config_at(dir.path()))?;
    let mut manager = store.blob_manager();

    let mut txn = store.begin_txn();
    manager.allocate_blob(&mut txn, &payload(18432), None, true)?;
    let resident = store.buffer().physical_used();
    assert_eq!(resident, 7);
    store.abort(txn)?;

    assert_eq!(store.buffer().physical_used(), 0);
    assert_eq!(store.free_space().lock().total_free_pages(), 7);

    // the next allocation is served from the returned runs
    let mut txn = store.begin_txn();
    let blob = manager.allocate_blob(&mut txn, &payload(18432), None, true)?;
    store.commit(txn)?;
    let pids: Vec<u64> = blob.extents.extent_pids.iter().map(|p| p.0).collect();
    assert_eq!(pids, vec![1, 2, 4]);
    Ok(())
}

#[test]
fn exhausted_page_file_reports_out_of_space() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig {
        ssd_gib: 0,
        ..config_at(dir.path())
    };
    let store = Store::mount(config)?;
    let mut manager = store.blob_manager();
    let mut txn = store.begin_txn();
    match manager.allocate_blob(&mut txn, &payload(PAGE_SIZE), None, true) {
        Err(StoreError::OutOfSpace) => {}
        other => panic!("expected out of space, got {other:?}"),
    }
    store.abort(txn)?;
    Ok(())
}

#[test]
fn trunc_discards_previous_page_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let store = Store::mount(config_at(dir.path()))?;
        let mut manager = store.blob_manager();
        let mut txn = store.begin_txn();
        manager.allocate_blob(&mut txn, &payload(18432), None, true)?;
        store.commit(txn)?;
        store.shutdown()?;
    }
    let config = StoreConfig {
        trunc: true,
        ..config_at(dir.path())
    };
    let store = Store::mount(config)?;
    // truncation resets dense allocation to the start of the file
    assert_eq!(store.buffer().alloc_extent(0)?.start_pid, PageId(1));
    Ok(())
}

#[test]
fn falloc_presizes_the_page_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig {
        falloc_gib: 1,
        ..config_at(dir.path())
    };
    let _store = Store::mount(config)?;
    let len = std::fs::metadata(dir.path().join("pages.db"))?.len();
    assert_eq!(len, 1 << 30);
    Ok(())
}
