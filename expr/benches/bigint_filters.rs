// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Benchmarks for IN-list filters (hash table vs. bitmask vs. range)

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quiver_expr::{create_bigint_values, BigintRange, Filter};
use rand::Rng;
use std::hint::black_box;

const BATCH_SIZE: usize = 8192;

fn create_probe_values(max: i64) -> Vec<i64> {
    let mut rng = rand::rng();
    (0..BATCH_SIZE).map(|_| rng.random_range(0..max)).collect()
}

fn bench_bigint_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("bigint_filters");
    let probes = create_probe_values(1 << 20);

    let filters = [
        ("range", Filter::BigintRange(BigintRange::new(1000, 200_000, false))),
        (
            "bitmask",
            create_bigint_values((0..1000).map(|i| i * 3).collect(), false),
        ),
        (
            "hash_table",
            create_bigint_values((0..1000).map(|i| i * 7919).collect(), false),
        ),
    ];

    for (name, filter) in filters {
        group.bench_with_input(BenchmarkId::new("test_values", name), &probes, |b, probes| {
            b.iter(|| {
                let mut result = Vec::with_capacity(probes.len());
                filter.test_values(black_box(probes), &mut result);
                black_box(result)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_bigint_filters);
criterion_main!(benches);
