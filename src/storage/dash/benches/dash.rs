// Copyright 2026 Shardkv Contributors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dash::{DashTable, Layout, UnboundedGrowth};

fn ops(c: &mut Criterion) {
    c.bench_function("insert", |b| {
        let mut table: DashTable<Vec<u8>, u64> = DashTable::new(Layout::DEFAULT);
        let mut counter: u64 = 0;

        b.iter(|| {
            let key = counter.to_be_bytes().to_vec();
            let _ = table.insert(black_box(key), counter, &mut UnboundedGrowth);
            counter = counter.wrapping_add(1);
        });
    });

    c.bench_function("find_hit", |b| {
        let mut table: DashTable<Vec<u8>, u64> = DashTable::new(Layout::DEFAULT);
        for i in 0u64..100_000 {
            let _ = table.insert(i.to_be_bytes().to_vec(), i, &mut UnboundedGrowth);
        }
        let mut counter: u64 = 0;

        b.iter(|| {
            let key = (counter % 100_000).to_be_bytes();
            let found = table.find(black_box(&key));
            counter = counter.wrapping_add(1);
            found
        });
    });

    c.bench_function("find_miss", |b| {
        let mut table: DashTable<Vec<u8>, u64> = DashTable::new(Layout::DEFAULT);
        for i in 0u64..100_000 {
            let _ = table.insert(i.to_be_bytes().to_vec(), i, &mut UnboundedGrowth);
        }
        let mut counter: u64 = 1 << 32;

        b.iter(|| {
            let key = counter.to_be_bytes();
            let found = table.find(black_box(&key));
            counter = counter.wrapping_add(1);
            found
        });
    });
}

criterion_group!(benches, ops);
criterion_main!(benches);
