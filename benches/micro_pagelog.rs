#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sombra_pagelog::cache::MemoryPageSource;
use sombra_pagelog::ops::{AppendRecord, SetRecordLong};
use sombra_pagelog::primitives::io::MemFileIo;
use sombra_pagelog::{
    LruPageCache, Lsn, OpLog, OpLogOptions, PageCache, PageKey, PageOperation, TinyPageCache,
};

const PAGES: usize = 64;
const RECORDS_PER_BATCH: usize = 32;

fn micro_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/cache");
    let source = Arc::new(MemoryPageSource::new(4096));
    let keys: Vec<PageKey> = (0..PAGES).map(|_| source.allocate(1)).collect();

    group.throughput(Throughput::Elements(PAGES as u64));
    let mut lru = LruPageCache::new(source.clone(), PAGES, 8);
    group.bench_function("lru_hit", |b| b.iter(|| touch_all(&mut lru, &keys)));

    for capacity in [PAGES / 4, PAGES / 2] {
        let mut lru = LruPageCache::new(source.clone(), capacity, 8);
        group.bench_with_input(
            BenchmarkId::new("lru_churn", capacity),
            &capacity,
            |b, _| b.iter(|| touch_all(&mut lru, &keys)),
        );
    }

    let mut tiny = TinyPageCache::new(source.clone(), 4);
    group.bench_function("tiny_churn", |b| b.iter(|| touch_all(&mut tiny, &keys)));
    group.finish();
}

fn touch_all<C: PageCache>(cache: &mut C, keys: &[PageKey]) {
    for &key in keys {
        let page = cache.load_page(key).expect("load").expect("page");
        cache.release(page);
    }
}

fn micro_oplog(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/oplog");
    let batch: Vec<PageOperation> = (0..RECORDS_PER_BATCH)
        .map(|i| {
            let page = PageKey::new(1, i as u64);
            if i % 2 == 0 {
                PageOperation::new(
                    page,
                    AppendRecord {
                        version: 1,
                        payload: vec![0xCD; 96],
                        requested: None,
                        position: i as u32,
                    },
                )
            } else {
                PageOperation::new(
                    page,
                    SetRecordLong {
                        position: 0,
                        offset: 8,
                        new: i as i64,
                        old: 0,
                    },
                )
            }
        })
        .collect();

    group.throughput(Throughput::Elements(RECORDS_PER_BATCH as u64));
    let log = OpLog::open(Arc::new(MemFileIo::new()), OpLogOptions::default()).expect("oplog");
    group.bench_function("append_batch", |b| {
        b.iter(|| {
            if log.len().expect("len") > 64 << 20 {
                log.reset(Lsn(1)).expect("reset");
            }
            log.append_batch(&batch).expect("append")
        })
    });

    let encoded: Vec<Vec<u8>> = batch.iter().map(PageOperation::encode).collect();
    group.bench_function("decode", |b| {
        b.iter(|| {
            for bytes in &encoded {
                PageOperation::decode(bytes).expect("decode");
            }
        })
    });
    group.finish();
}

criterion_group!(benches, micro_cache, micro_oplog);
criterion_main!(benches);
