#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use sombra_pagelog::cache::MemoryPageSource;
use sombra_pagelog::{CachedPage, LruPageCache, PageCache, PageKey, PageSource, TinyPageCache};

#[derive(Clone, Copy, Debug)]
enum Step {
    Load(usize),
    Release(usize),
    /// Purge a page nobody holds and hand it back to the source.
    Purge(usize),
}

fn setup(pages: usize) -> (Arc<MemoryPageSource>, Vec<PageKey>) {
    let source = Arc::new(MemoryPageSource::new(64));
    let keys = (0..pages).map(|_| source.allocate(1)).collect();
    (source, keys)
}

fn load<C: PageCache>(cache: &mut C, key: PageKey) -> CachedPage {
    cache.load_page(key).expect("load").expect("page exists")
}

fn purge_to_source<C: PageCache>(cache: &mut C, source: &MemoryPageSource, key: PageKey) {
    if let Some(page) = cache.purge(key.file_id, key.page_index) {
        source.release(page);
    }
}

#[test]
fn tiny_cache_follows_reference_counts() {
    use Step::{Load, Purge, Release};
    let (source, keys) = setup(6);
    let mut cache = TinyPageCache::new(source.clone(), 2);
    let mut held: Vec<CachedPage> = Vec::new();

    // (step, source loads, source releases) after the step.
    let script: &[(Step, u64, u64)] = &[
        (Load(0), 1, 0),
        (Load(0), 1, 0),
        (Load(1), 2, 0),
        (Load(1), 2, 0),
        (Load(0), 2, 0),
        // Both slots pinned: page 2 is handed out untracked.
        (Load(2), 3, 0),
        (Release(1), 3, 0),
        (Load(2), 4, 0),
        (Release(1), 4, 0),
        // Slot of page 1 is unpinned and gets evicted.
        (Load(2), 5, 1),
        (Release(2), 5, 1),
        (Release(2), 5, 1),
        // Page 2 is evicted with negative usage: settled twice.
        (Load(3), 6, 3),
        (Load(1), 7, 3),
        (Load(2), 8, 3),
        (Load(4), 9, 3),
        (Release(4), 9, 4),
        (Load(5), 10, 4),
        (Release(1), 10, 5),
        // Page 4 was never given a slot, so there is nothing to purge.
        (Purge(4), 10, 5),
    ];

    for (i, &(step, loads, releases)) in script.iter().enumerate() {
        match step {
            Load(page) => held.push(load(&mut cache, keys[page])),
            Release(page) => {
                let idx = held
                    .iter()
                    .position(|p| p.key() == keys[page])
                    .expect("held page");
                cache.release(held.swap_remove(idx));
            }
            Purge(page) => purge_to_source(&mut cache, &source, keys[page]),
        }
        let stats = source.stats();
        assert_eq!(
            (stats.loads, stats.releases),
            (loads, releases),
            "after step {i}: {step:?}"
        );
    }
    assert_eq!(cache.resident(), 2);

    for page in held.drain(..) {
        cache.release(page);
    }
    cache.reset();
    for key in keys {
        assert_eq!(source.pins(key), 0, "page {key}");
    }
}

#[test]
fn single_slot_tiny_cache_always_replaces_unpinned_occupant() {
    let (source, keys) = setup(3);
    let mut cache = TinyPageCache::new(source.clone(), 1);
    for pair in keys.windows(2) {
        let first = load(&mut cache, pair[0]);
        cache.release(first);
        let second = load(&mut cache, pair[1]);
        assert_eq!(source.pins(pair[0]), 0);
        assert!(cache.purge(pair[0].file_id, pair[0].page_index).is_none());
        cache.release(second);
    }
    assert_eq!(cache.resident(), 1);
}

#[test]
fn lru_evicts_least_recent_unpinned_page() {
    let (source, keys) = setup(3);
    let (a, b, c) = (keys[0], keys[1], keys[2]);
    let mut cache = LruPageCache::new(source.clone(), 2, 1);

    let page_a = load(&mut cache, a);
    let page_b = load(&mut cache, b);
    cache.release(page_a);
    let page_c = load(&mut cache, c);

    assert_eq!(cache.usage(a.file_id, a.page_index), None);
    assert_eq!(cache.usage(b.file_id, b.page_index), Some(1));
    assert_eq!(cache.usage(c.file_id, c.page_index), Some(1));
    assert_eq!(source.pins(a), 0);
    assert_eq!(cache.stats().evictions, 1);

    let again = load(&mut cache, b);
    assert!(again.same_buffer(&page_b));
    cache.release(again);
    cache.release(page_b);
    cache.release(page_c);
    cache.reset();
    assert!(keys.iter().all(|&k| source.pins(k) == 0));
}

#[test]
fn purge_hands_back_exactly_one_source_reference() {
    let (source, keys) = setup(1);
    let key = keys[0];

    let mut tiny = TinyPageCache::new(source.clone(), 2);
    let cached = load(&mut tiny, key);
    let direct = source.load(key, false, 1).expect("load").expect("page");
    tiny.release(cached);
    // The slot absorbs this release and owes it to the source.
    tiny.release(direct);
    assert_eq!(source.pins(key), 2);
    let purged = tiny.purge(key.file_id, key.page_index).expect("resident");
    assert_eq!(source.pins(key), 1);
    source.release(purged);
    assert_eq!(source.pins(key), 0);
    assert_eq!(tiny.resident(), 0);

    let mut lru = LruPageCache::new(source.clone(), 2, 1);
    let cached = load(&mut lru, key);
    lru.release(cached);
    let purged = lru.purge(key.file_id, key.page_index).expect("resident");
    source.release(purged);
    assert_eq!(source.pins(key), 0);
    assert_eq!(lru.resident(), 0);
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    proptest::collection::vec(
        prop_oneof![
            4 => (0usize..8).prop_map(Step::Load),
            4 => any::<usize>().prop_map(Step::Release),
            1 => (0usize..8).prop_map(Step::Purge),
        ],
        1..120,
    )
}

/// Applies `step`, keeping `held` in sync. Returns the page just loaded.
fn run_step<C: PageCache>(
    cache: &mut C,
    source: &MemoryPageSource,
    keys: &[PageKey],
    held: &mut Vec<CachedPage>,
    step: Step,
) -> Option<CachedPage> {
    match step {
        Step::Load(page) => {
            let loaded = load(cache, keys[page]);
            held.push(loaded.clone());
            Some(loaded)
        }
        Step::Release(pick) => {
            if !held.is_empty() {
                let page = held.swap_remove(pick % held.len());
                cache.release(page);
            }
            None
        }
        Step::Purge(page) => {
            let key = keys[page];
            if !held.iter().any(|p| p.key() == key) {
                purge_to_source(cache, source, key);
                assert_eq!(source.pins(key), 0, "purged page {key} still pinned");
            }
            None
        }
    }
}

proptest! {
    #[test]
    fn lru_never_evicts_pinned_pages_and_respects_bound(
        capacity in 1usize..4,
        batch in 1usize..3,
        script in steps(),
    ) {
        let (source, keys) = setup(8);
        let mut cache = LruPageCache::new(source.clone(), capacity, batch);
        let mut held = Vec::new();
        for step in script {
            if let Some(page) = run_step(&mut cache, &source, &keys, &mut held, step) {
                let earlier = held.iter().find(|p| p.key() == page.key()).expect("held");
                prop_assert!(earlier.same_buffer(&page));
            }
            let mut pinned = 0;
            for key in &keys {
                let holders = held.iter().filter(|p| p.key() == *key).count() as u32;
                let usage = cache.usage(key.file_id, key.page_index);
                if holders > 0 {
                    prop_assert_eq!(usage, Some(holders));
                    pinned += 1;
                }
            }
            if pinned < cache.resident() {
                prop_assert!(cache.resident() <= capacity + batch);
            }
        }
        for page in held.drain(..) {
            cache.release(page);
        }
        cache.reset();
        for key in &keys {
            prop_assert_eq!(source.pins(*key), 0);
        }
    }

    #[test]
    fn tiny_cache_keeps_held_pages_pinned_at_the_source(
        slots in 1usize..4,
        script in steps(),
    ) {
        let (source, keys) = setup(8);
        let mut cache = TinyPageCache::new(source.clone(), slots);
        let mut held = Vec::new();
        for step in script {
            run_step(&mut cache, &source, &keys, &mut held, step);
            prop_assert!(cache.resident() <= slots);
            for key in &keys {
                if held.iter().any(|p| p.key() == *key) {
                    prop_assert!(source.pins(*key) > 0);
                }
            }
        }
        for page in held.drain(..) {
            cache.release(page);
        }
        cache.reset();
        for key in &keys {
            prop_assert_eq!(source.pins(*key), 0);
        }
    }
}
