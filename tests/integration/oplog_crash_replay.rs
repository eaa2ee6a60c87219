#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use sombra_pagelog::cache::FilePageSource;
use sombra_pagelog::page::{KeyCodec, NonLeafEntry};
use sombra_pagelog::primitives::io::{FileIo, StdFileIo};
use sombra_pagelog::{
    recover_from_log, LruPageCache, Lsn, OpLog, OpLogOptions, PageCache, PageEditor, PageKey,
    PageOperation, Result,
};
use tempfile::tempdir;

const PAGE_SIZE: usize = 512;
const SALT: u64 = 0x5EED;

fn edit<C, F>(cache: &mut C, key: PageKey, f: F) -> Result<(Vec<PageOperation>, Vec<u8>)>
where
    C: PageCache + ?Sized,
    F: FnOnce(&mut PageEditor<'_>) -> Result<()>,
{
    let page = cache.load_page(key)?.expect("page exists");
    let ops = {
        let mut guard = page.write();
        let mut editor = PageEditor::new(key, &mut guard[..]);
        f(&mut editor).map(|()| editor.into_operations())
    };
    let image = page.read().to_vec();
    cache.release(page);
    Ok((ops?, image))
}

fn open_source(dir: &Path) -> Result<Arc<FilePageSource>> {
    let source = Arc::new(FilePageSource::new(PAGE_SIZE));
    source.open_file(1, dir.join("pages.db"))?;
    Ok(source)
}

fn open_log(dir: &Path) -> Result<OpLog> {
    let io = StdFileIo::open(dir.join("pages.oplog"))?;
    OpLog::open(Arc::new(io), OpLogOptions::new(SALT, Lsn(1)))
}

fn page_on_disk(dir: &Path, key: PageKey) -> Vec<u8> {
    let bytes = std::fs::read(dir.join("pages.db")).expect("read page file");
    let start = key.page_index as usize * PAGE_SIZE;
    bytes[start..start + PAGE_SIZE].to_vec()
}

#[test]
fn logged_edits_survive_crash_before_page_flush() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (cluster, bucket, expected_cluster, expected_bucket) = {
        let source = open_source(dir.path())?;
        let cluster = source.allocate_page(1)?;
        let bucket = source.allocate_page(1)?;
        let log = open_log(dir.path())?;
        let mut cache = LruPageCache::new(source.clone(), 4, 1);

        let (ops, cluster_image) = edit(&mut cache, cluster, |e| {
            e.init_cluster()?;
            e.append_record(1, b"alpha", None)?;
            e.append_record(1, b"beta-beta", None)?;
            e.replace_record(0, 2, b"ALPHA!")?;
            e.set_next_page(bucket.page_index)?;
            Ok(())
        })?;
        log.append_batch(&ops)?;

        let (ops, bucket_image) = edit(&mut cache, bucket, |e| {
            e.init_bucket(false)?;
            e.add_non_leaf_entries(
                vec![
                    NonLeafEntry {
                        left: 2,
                        right: 3,
                        key: b"m".to_vec(),
                    },
                    NonLeafEntry {
                        left: 3,
                        right: 4,
                        key: b"t".to_vec(),
                    },
                ],
                KeyCodec::Utf8,
            )?;
            e.set_prev_page(cluster.page_index)?;
            Ok(())
        })?;
        log.append_batch(&ops)?;
        log.sync()?;
        // Dropped without flushing the page source.
        (cluster, bucket, cluster_image, bucket_image)
    };
    assert!(page_on_disk(dir.path(), cluster).iter().all(|&b| b == 0));

    let source = open_source(dir.path())?;
    let log = open_log(dir.path())?;
    let mut cache = LruPageCache::new(source.clone(), 4, 1);
    let stats = recover_from_log(&log, &mut cache, Lsn(0))?;
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.pages_touched, 2);
    cache.reset();
    source.flush()?;

    assert_eq!(page_on_disk(dir.path(), cluster), expected_cluster);
    assert_eq!(page_on_disk(dir.path(), bucket), expected_bucket);
    Ok(())
}

#[test]
fn recovery_resumes_after_checkpoint_and_drops_torn_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let (key, checkpoint, expected) = {
        let source = open_source(dir.path())?;
        let key = source.allocate_page(1)?;
        let log = open_log(dir.path())?;
        let mut cache = LruPageCache::new(source.clone(), 2, 1);

        let (ops, _) = edit(&mut cache, key, |e| {
            e.init_bucket(true)?;
            e.add_leaf_entry(0, b"k1", b"v1", 0)?;
            e.add_leaf_entry(1, b"k2", b"v2", 5)?;
            Ok(())
        })?;
        let lsns = log.append_batch(&ops)?;
        log.sync()?;

        // Checkpoint: page images reach disk and the log position is noted.
        cache.reset();
        source.flush()?;
        let checkpoint = *lsns.last().expect("lsn");

        let (ops, image) = edit(&mut cache, key, |e| {
            e.increment_counter(0)?;
            e.increment_counter(0)?;
            e.decrement_counter(1)?;
            e.remove_leaf_entry(1)?;
            Ok(())
        })?;
        log.append_batch(&ops)?;
        log.sync()?;

        let (ops, _) = edit(&mut cache, key, |e| e.increment_counter(0))?;
        log.append(&ops[0])?;
        (key, checkpoint, image)
    };

    // The last append was torn by the crash.
    let log_io = StdFileIo::open(dir.path().join("pages.oplog"))?;
    let len = log_io.len()?;
    log_io.truncate(len - 3)?;
    drop(log_io);

    let source = open_source(dir.path())?;
    let log = open_log(dir.path())?;
    assert!(log.stats().truncated_bytes > 0);
    let mut cache = LruPageCache::new(source.clone(), 2, 1);
    let stats = recover_from_log(&log, &mut cache, checkpoint)?;
    assert_eq!(stats.skipped, 3);
    assert_eq!(stats.applied, 4);
    cache.reset();
    source.flush()?;
    assert_eq!(page_on_disk(dir.path(), key), expected);
    Ok(())
}
