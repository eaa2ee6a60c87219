#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use sombra_pagelog::cache::MemoryPageSource;
use sombra_pagelog::page::{BucketLayout, KeyCodec, NonLeafEntry};
use sombra_pagelog::{
    redo_all, rollback, CachedPage, LoggedOperation, Lsn, OperationType, PageCache, PageEditor,
    PageKey, PageOperation, PageSource, Result, TinyPageCache,
};

const PAGE_SIZE: usize = 4096;

#[derive(Clone, Debug)]
enum Edit {
    Append(u32, Vec<u8>, Option<u32>),
    Delete(u32),
    Replace(u32, u32, Vec<u8>),
    SetLong(u32, i64),
    Next(u64),
    Prev(u64),
    AddLeaf(u32, Vec<u8>, Vec<u8>, u32),
    RemoveLeaf(u32),
    Increment(u32),
    Decrement(u32),
    AddSeparators(Vec<Vec<u8>>),
    Shrink(u32),
    Layout(bool),
}

fn small_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..16)
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<u32>(), small_bytes(), proptest::option::of(0u32..6))
            .prop_map(|(v, p, r)| Edit::Append(v, p, r)),
        (0u32..6).prop_map(Edit::Delete),
        (0u32..6, any::<u32>(), small_bytes()).prop_map(|(pos, v, p)| Edit::Replace(pos, v, p)),
        (0u32..6, any::<i64>()).prop_map(|(pos, v)| Edit::SetLong(pos, v)),
        any::<u64>().prop_map(Edit::Next),
        any::<u64>().prop_map(Edit::Prev),
        (0u32..5, small_bytes(), small_bytes(), 0u32..3)
            .prop_map(|(i, k, v, c)| Edit::AddLeaf(i, k, v, c)),
        (0u32..5).prop_map(Edit::RemoveLeaf),
        (0u32..5).prop_map(Edit::Increment),
        (0u32..5).prop_map(Edit::Decrement),
        proptest::collection::vec(small_bytes(), 0..3).prop_map(Edit::AddSeparators),
        (0u32..4).prop_map(Edit::Shrink),
        any::<bool>().prop_map(Edit::Layout),
    ]
}

struct Pages {
    cluster: PageKey,
    leaf: PageKey,
    inner: PageKey,
}

/// Applies `edit` to the page it targets. Rejected edits leave no trace.
fn apply(
    pages: &Pages,
    edit: &Edit,
    source: &MemoryPageSource,
    cache: &mut dyn PageCache,
) -> Vec<PageOperation> {
    let key = match edit {
        Edit::Append(..)
        | Edit::Delete(_)
        | Edit::Replace(..)
        | Edit::SetLong(..)
        | Edit::Next(_)
        | Edit::Prev(_) => pages.cluster,
        Edit::AddLeaf(..)
        | Edit::RemoveLeaf(_)
        | Edit::Increment(_)
        | Edit::Decrement(_)
        | Edit::Layout(_) => pages.leaf,
        Edit::AddSeparators(_) | Edit::Shrink(_) => pages.inner,
    };
    let before = source.snapshot(key).expect("page");
    let page = cache.load_page(key).expect("load").expect("page");
    let (outcome, ops) = {
        let mut guard = page.write();
        let mut editor = PageEditor::new(key, &mut guard[..]);
        let outcome = match edit {
            Edit::Append(version, payload, requested) => editor
                .append_record(*version, payload, *requested)
                .map(|_| ()),
            Edit::Delete(pos) => editor.delete_record(*pos),
            Edit::Replace(pos, version, payload) => editor.replace_record(*pos, *version, payload),
            Edit::SetLong(pos, value) => editor.set_record_long(*pos, 0, *value),
            Edit::Next(next) => editor.set_next_page(*next),
            Edit::Prev(prev) => editor.set_prev_page(*prev),
            Edit::AddLeaf(index, k, v, counter) => editor.add_leaf_entry(*index, k, v, *counter),
            Edit::RemoveLeaf(index) => editor.remove_leaf_entry(*index),
            Edit::Increment(index) => editor.increment_counter(*index),
            Edit::Decrement(index) => editor.decrement_counter(*index),
            Edit::AddSeparators(keys) => editor.add_non_leaf_entries(
                keys.iter()
                    .enumerate()
                    .map(|(i, key)| NonLeafEntry {
                        left: i as u64,
                        right: i as u64 + 1,
                        key: key.clone(),
                    })
                    .collect(),
                KeyCodec::Bytes,
            ),
            Edit::Shrink(new_size) => editor.shrink_non_leaf_entries(*new_size, KeyCodec::Bytes),
            Edit::Layout(v1) => editor.switch_layout(if *v1 {
                BucketLayout::V1
            } else {
                BucketLayout::V2
            }),
        };
        (outcome, editor.into_operations())
    };
    cache.release(page);
    if outcome.is_err() {
        assert!(ops.is_empty());
        assert_eq!(source.snapshot(key).expect("page"), before);
    }
    ops
}

fn format_pages(source: &MemoryPageSource) -> Result<Pages> {
    let pages = Pages {
        cluster: source.allocate(1),
        leaf: source.allocate(1),
        inner: source.allocate(1),
    };
    for (key, kind) in [(pages.cluster, 0), (pages.leaf, 1), (pages.inner, 2)] {
        let page = source_page(source, key);
        {
            let mut guard = page.write();
            let mut editor = PageEditor::new(key, &mut guard[..]);
            match kind {
                0 => editor.init_cluster()?,
                1 => editor.init_bucket(true)?,
                _ => editor.init_bucket(false)?,
            }
        }
        source.release(page);
    }
    Ok(pages)
}

fn source_page(source: &MemoryPageSource, key: PageKey) -> CachedPage {
    source
        .load(key, false, 1)
        .expect("load")
        .expect("page")
}

fn images(source: &MemoryPageSource, pages: &Pages) -> Vec<Vec<u8>> {
    [pages.cluster, pages.leaf, pages.inner]
        .iter()
        .map(|&key| source.snapshot(key).expect("page"))
        .collect()
}

fn install(source: &MemoryPageSource, pages: &Pages, images: &[Vec<u8>]) {
    for (key, image) in [pages.cluster, pages.leaf, pages.inner].iter().zip(images) {
        let page = source_page(source, *key);
        page.write().copy_from_slice(image);
        source.release(page);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn rollback_restores_exact_images_and_redo_rebuilds_them(
        edits in proptest::collection::vec(edit(), 1..40),
        slots in 1usize..3,
    ) {
        let source = Arc::new(MemoryPageSource::new(PAGE_SIZE));
        let pages = format_pages(&source).unwrap();
        let before = images(&source, &pages);

        let mut cache = TinyPageCache::new(source.clone(), slots);
        let mut records = Vec::new();
        for edit in &edits {
            for op in apply(&pages, edit, &source, &mut cache) {
                let lsn = Lsn(records.len() as u64 + 1);
                records.push(LoggedOperation { lsn, op });
            }
        }
        cache.reset();
        let after = images(&source, &pages);

        // Redo from the pre-edit images reproduces the edited pages.
        let replica = Arc::new(MemoryPageSource::new(PAGE_SIZE));
        let replica_pages = format_pages(&replica).unwrap();
        install(&replica, &replica_pages, &before);
        let mut replica_cache = TinyPageCache::new(replica.clone(), slots);
        redo_all(&records, &mut replica_cache).unwrap();
        replica_cache.reset();
        prop_assert_eq!(images(&replica, &replica_pages), after);

        // Rolling back every record restores the pre-edit images byte for byte.
        let stats = rollback(&records, &mut cache).unwrap();
        prop_assert_eq!(stats.applied, records.len() as u64);
        cache.reset();
        prop_assert_eq!(images(&source, &pages), before);
    }

    #[test]
    fn redo_twice_leaves_the_page_unchanged(
        edits in proptest::collection::vec(edit(), 1..40),
    ) {
        let source = Arc::new(MemoryPageSource::new(PAGE_SIZE));
        let pages = format_pages(&source).unwrap();
        let mut cache = TinyPageCache::new(source.clone(), 3);
        for edit in &edits {
            let ops = apply(&pages, edit, &source, &mut cache);
            let Some(op) = ops.last() else { continue };
            if matches!(
                op.operation_type(),
                OperationType::IncrementCounter | OperationType::DecrementCounter
            ) {
                continue;
            }
            let applied = source.snapshot(op.page).expect("page");
            let mut again = applied.clone();
            op.redo(&mut again).unwrap();
            prop_assert_eq!(again, applied, "{}", op);
        }
        cache.reset();
    }
}
