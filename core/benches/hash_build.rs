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

use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
use quiver::execution::config::{QueryConfig, JOIN_SPILL_ENABLED, SPILL_ENABLED};
use quiver::execution::driver::{execute, DriverCtx, Pipeline};
use quiver::execution::joins::{HashBuild, HashJoinNode, HashProbe, JoinType};
use quiver::execution::memory_pools::GB;
use quiver::execution::operators::{CollectSink, CollectedBatches, Operator, ValuesSource};
use quiver::execution::task::Task;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

const BATCH_SIZE: usize = 8192;

fn schema(names: &[&str]) -> SchemaRef {
    Arc::new(Schema::new(
        names
            .iter()
            .map(|n| Field::new(*n, DataType::Int64, true))
            .collect::<Vec<_>>(),
    ))
}

fn create_batches(schema: &SchemaRef, num_batches: usize, key_range: i64) -> Vec<RecordBatch> {
    let mut rng = rand::rng();
    (0..num_batches)
        .map(|_| {
            let keys: Int64Array = (0..BATCH_SIZE)
                .map(|_| Some(rng.random_range(0..key_range)))
                .collect();
            let values: Int64Array = (0..BATCH_SIZE as i64).map(Some).collect();
            RecordBatch::try_new(
                Arc::clone(schema),
                vec![Arc::new(keys) as ArrayRef, Arc::new(values) as ArrayRef],
            )
            .unwrap()
        })
        .collect()
}

fn run_join(
    node: &Arc<HashJoinNode>,
    build: &[RecordBatch],
    probe: &[RecordBatch],
    num_drivers: usize,
    spill: bool,
) -> usize {
    let config = QueryConfig::default()
        .with(SPILL_ENABLED, spill)
        .with(JOIN_SPILL_ENABLED, spill);
    let task = Task::new(
        "bench",
        config,
        RuntimeEnvBuilder::new().build_arc().unwrap(),
        8 * GB,
    );
    let metrics = Arc::new(ExecutionPlanMetricsSet::new());
    let output = CollectedBatches::default();

    let (build, build_node, build_metrics) =
        (build.to_vec(), Arc::clone(node), Arc::clone(&metrics));
    let build_pipeline = Pipeline {
        factories: vec![
            Box::new(move |ctx: &DriverCtx| {
                Ok(Box::new(ValuesSource::for_driver(
                    "0",
                    &build,
                    ctx.driver_id(),
                    ctx.num_drivers(),
                )) as Box<dyn Operator>)
            }),
            Box::new(move |ctx: &DriverCtx| {
                Ok(Box::new(HashBuild::try_new(
                    ctx,
                    Arc::clone(&build_node),
                    &build_metrics,
                )?) as Box<dyn Operator>)
            }),
        ],
        num_drivers,
    };
    let (probe, probe_node, sink_output) = (probe.to_vec(), Arc::clone(node), Arc::clone(&output));
    let probe_pipeline = Pipeline {
        factories: vec![
            Box::new(move |ctx: &DriverCtx| {
                Ok(Box::new(ValuesSource::for_driver(
                    "1",
                    &probe,
                    ctx.driver_id(),
                    ctx.num_drivers(),
                )) as Box<dyn Operator>)
            }),
            Box::new(move |ctx: &DriverCtx| {
                Ok(Box::new(HashProbe::try_new(ctx, Arc::clone(&probe_node), &metrics)?)
                    as Box<dyn Operator>)
            }),
            Box::new(move |_ctx: &DriverCtx| {
                Ok(Box::new(CollectSink::new("3", Arc::clone(&sink_output))) as Box<dyn Operator>)
            }),
        ],
        num_drivers,
    };
    execute(&task, vec![build_pipeline, probe_pipeline]).unwrap();
    let num_rows = output.lock().iter().map(|b| b.num_rows()).sum();
    num_rows
}

fn criterion_benchmark(c: &mut Criterion) {
    let build_schema = schema(&["k", "v"]);
    let probe_schema = schema(&["p", "q"]);
    let build = create_batches(&build_schema, 16, 1 << 20);
    let probe = create_batches(&probe_schema, 16, 1 << 20);

    let mut group = c.benchmark_group("hash_join");
    for join_type in [JoinType::Inner, JoinType::Left, JoinType::Anti] {
        let node = Arc::new(
            HashJoinNode::try_new(
                "2",
                join_type,
                false,
                Arc::clone(&probe_schema),
                Arc::clone(&build_schema),
                vec![0],
                vec![0],
                None,
            )
            .unwrap(),
        );
        for num_drivers in [1, 4] {
            group.bench_function(format!("{join_type}/{num_drivers} drivers"), |b| {
                b.iter(|| black_box(run_join(&node, &build, &probe, num_drivers, false)))
            });
        }
        group.bench_function(format!("{join_type}/4 drivers/spill enabled"), |b| {
            b.iter(|| black_box(run_join(&node, &build, &probe, 4, true)))
        });
    }
    group.finish();
}

fn config() -> Criterion {
    Criterion::default()
        .measurement_time(Duration::from_millis(500))
        .warm_up_time(Duration::from_millis(500))
}

criterion_group! {
    name = benches;
    config = config();
    targets = criterion_benchmark
}
criterion_main!(benches);
