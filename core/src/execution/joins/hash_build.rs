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

//! Build side of the hash join.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arrow::array::{Array, AsArray, BooleanArray, RecordBatch, UInt32Array};
use arrow::compute::{filter, filter_record_batch, take_record_batch};
use datafusion::physical_plan::metrics::{
    Count, ExecutionPlanMetricsSet, Gauge, MetricBuilder, Time,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use quiver_expr::{filter_propagates_nulls, referenced_columns};
use rayon::prelude::*;

use super::bridge::{HashJoinBridge, SpillInput, TableSpillFunc};
use super::hash_build_spiller::HashBuildSpiller;
use super::hash_table::HashTable;
use super::row_container::RowContainer;
use super::vector_hasher::RANGE_TOO_LARGE;
use super::{hash_keys, HashJoinNode, JoinType};
use crate::errors::{ExecError, ExecResult};
use crate::execution::driver::DriverCtx;
use crate::execution::future::{ContinueFuture, ContinuePromise};
use crate::execution::memory_pools::{MemoryPool, ReclaimerStats};
use crate::execution::operators::{
    BlockingReason, NonReclaimableSectionGuard, Operator, OperatorReclaimer, ReclaimableOperator,
    ReclaimableSectionGuard,
};
use crate::execution::spill::{
    SpillConfig, SpillPartition, SpillPartitionId, SpillPartitionSet, SpillStats,
    UnorderedStreamReader,
};
use crate::execution::task::{BarrierOutcome, Task};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Taking input, either from upstream or from a spilled partition.
    Running = 0,
    /// Gave the thread back while reading a spilled partition.
    Yield = 1,
    /// Input done; waiting for the other build drivers.
    WaitForBuild = 2,
    /// Table published; waiting for the probe to finish a round.
    WaitForProbe = 3,
    Finish = 4,
}

impl BuildState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BuildState::Running,
            1 => BuildState::Yield,
            2 => BuildState::WaitForBuild,
            3 => BuildState::WaitForProbe,
            _ => BuildState::Finish,
        }
    }

    fn blocking_reason(&self) -> BlockingReason {
        match self {
            BuildState::Running | BuildState::Finish => BlockingReason::NotBlocked,
            BuildState::Yield => BlockingReason::Yield,
            BuildState::WaitForBuild => BlockingReason::WaitForJoinBuild,
            BuildState::WaitForProbe => BlockingReason::WaitForJoinProbe,
        }
    }
}

impl Display for BuildState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuildState::Running => "RUNNING",
            BuildState::Yield => "YIELD",
            BuildState::WaitForBuild => "WAIT_FOR_BUILD",
            BuildState::WaitForProbe => "WAIT_FOR_PROBE",
            BuildState::Finish => "FINISH",
        };
        write!(f, "{name}")
    }
}

/// Runtime statistics of one build driver.
struct HashBuildMetrics {
    /// Time spent inserting rows and building the table
    build_time: Time,
    /// Time spent writing spill files
    spill_time: Time,
    /// Number of spill files written
    spill_count: Count,
    spilled_bytes: Count,
    spilled_rows: Count,
    /// Input rows with a null join key
    num_null_keys: Count,
    spill_max_level_exceeded_count: Count,
    num_non_reclaimable_attempts: Count,
    parallel_join_build_count: Count,
    /// Value range and distinct count per key, set by the driver that builds
    /// the table
    key_cardinalities: Vec<(Gauge, Gauge)>,
}

impl HashBuildMetrics {
    fn new(metrics: &ExecutionPlanMetricsSet, partition: usize, num_keys: usize) -> Self {
        Self {
            build_time: MetricBuilder::new(metrics).subset_time("build_time", partition),
            spill_time: MetricBuilder::new(metrics).subset_time("spill_time", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            spilled_rows: MetricBuilder::new(metrics).spilled_rows(partition),
            num_null_keys: MetricBuilder::new(metrics).counter("num_null_keys", partition),
            spill_max_level_exceeded_count: MetricBuilder::new(metrics)
                .counter("spill_max_level_exceeded_count", partition),
            num_non_reclaimable_attempts: MetricBuilder::new(metrics)
                .counter("num_non_reclaimable_attempts", partition),
            parallel_join_build_count: MetricBuilder::new(metrics)
                .counter("parallel_join_build_count", partition),
            key_cardinalities: (0..num_keys)
                .map(|i| {
                    (
                        MetricBuilder::new(metrics).gauge(format!("range_key{i}"), partition),
                        MetricBuilder::new(metrics).gauge(format!("distinct_key{i}"), partition),
                    )
                })
                .collect(),
        }
    }

    fn record_spill_stats(&self, stats: &SpillStats) {
        self.spill_count.add(stats.spilled_files as usize);
        self.spilled_bytes.add(stats.spilled_bytes as usize);
        self.spilled_rows.add(stats.spilled_rows as usize);
    }
}

#[derive(Default)]
struct BuildInner {
    table: Option<HashTable>,
    spiller: Option<HashBuildSpiller>,
}

/// The part of a [`HashBuild`] that other drivers reach: the table and spiller
/// under a mutex, plus the state the memory reclaimer looks at.
pub struct HashBuildShared {
    name: String,
    plan_node_id: String,
    task: Weak<Task>,
    pool: Arc<dyn MemoryPool>,
    spill_config: Option<SpillConfig>,
    inner: Mutex<BuildInner>,
    state: AtomicU8,
    non_reclaimable_section: AtomicBool,
    exceeded_max_spill_level: AtomicBool,
    join_has_null_keys: AtomicBool,
    metrics: HashBuildMetrics,
}

impl HashBuildShared {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BuildState {
        BuildState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BuildState) {
        self.check_state_transition(state);
        self.state.store(state as u8, Ordering::Release);
    }

    fn check_state_transition(&self, to: BuildState) {
        let from = self.state();
        let legal = match (from, to) {
            (
                BuildState::Running,
                BuildState::WaitForBuild
                | BuildState::Yield
                | BuildState::WaitForProbe
                | BuildState::Finish,
            ) => true,
            (BuildState::WaitForBuild, BuildState::Running) => true,
            (BuildState::WaitForProbe | BuildState::Yield, BuildState::Running) => {
                self.spill_config.is_some()
            }
            _ => false,
        };
        assert!(
            legal,
            "Unexpected state transition of {} from {from} to {to}",
            self.name
        );
    }

    pub fn spill_enabled(&self) -> bool {
        self.spill_config.is_some()
    }

    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pool
    }

    pub fn num_rows(&self) -> usize {
        self.inner
            .lock()
            .table
            .as_ref()
            .map_or(0, |table| table.num_rows())
    }

    pub fn join_has_null_keys(&self) -> bool {
        self.join_has_null_keys.load(Ordering::Acquire)
    }

    pub fn spill_triggered(&self) -> bool {
        self.inner
            .lock()
            .spiller
            .as_ref()
            .is_some_and(|s| s.spill_triggered())
    }

    fn take_build_state(&self) -> (Option<HashTable>, Option<HashBuildSpiller>) {
        let mut inner = self.inner.lock();
        (inner.table.take(), inner.spiller.take())
    }

    fn refuse_reclaim(&self, stats: &mut ReclaimerStats, reason: &str) {
        stats.num_non_reclaimable_attempts += 1;
        self.metrics.num_non_reclaimable_attempts.add(1);
        info!("Can't reclaim from hash build operator {}: {reason}", self.name);
    }
}

impl ReclaimableOperator for HashBuildShared {
    fn operator_name(&self) -> &str {
        &self.name
    }

    fn can_reclaim(&self) -> bool {
        self.spill_config.is_some()
    }

    fn non_reclaimable_state(&self) -> bool {
        if self.non_reclaimable_section.load(Ordering::Acquire)
            || self.exceeded_max_spill_level.load(Ordering::Acquire)
        {
            return true;
        }
        if !matches!(
            self.state(),
            BuildState::Running | BuildState::WaitForBuild | BuildState::Yield
        ) {
            return true;
        }
        // The driver only holds the mutex while on thread.
        match self.inner.try_lock() {
            None => true,
            Some(inner) => {
                inner.table.is_none() || inner.spiller.as_ref().is_none_or(|s| s.finalized())
            }
        }
    }

    fn reclaimable_bytes(&self) -> u64 {
        if !self.can_reclaim() {
            return 0;
        }
        self.pool.used_bytes()
    }

    /// Spills the tables of all build drivers of the join, or none of them.
    fn reclaim(&self, target_bytes: u64, stats: &mut ReclaimerStats) -> ExecResult<()> {
        let Some(task) = self.task.upgrade() else {
            return Ok(());
        };
        assert!(
            task.pause_requested(),
            "reclaim from {} while its task is running",
            self.name
        );
        if self.exceeded_max_spill_level.load(Ordering::Acquire) {
            self.refuse_reclaim(stats, "spill level limit exceeded");
            return Ok(());
        }
        let peers = task.find_peer_operators(&self.plan_node_id);
        for peer in &peers {
            if peer.non_reclaimable_state() {
                let reason = format!("peer {} is not reclaimable", peer.operator_name());
                self.refuse_reclaim(stats, &reason);
                return Ok(());
            }
        }
        let start = Instant::now();
        peers.par_iter().try_for_each(|peer| peer.spill())?;
        for peer in &peers {
            peer.clear_spilled();
        }
        info!(
            "Spilled {} hash build operators of join {} in {:?} (target {target_bytes} bytes)",
            peers.len(),
            self.plan_node_id,
            start.elapsed()
        );
        Ok(())
    }

    fn spill(&self) -> ExecResult<()> {
        let start = Instant::now();
        let mut inner = self.inner.lock();
        let BuildInner { table, spiller } = &mut *inner;
        let (Some(table), Some(spiller)) = (table.as_ref(), spiller.as_mut()) else {
            return Ok(());
        };
        spiller.spill(table.rows())?;
        self.metrics.spill_time.add_elapsed(start);
        Ok(())
    }

    fn clear_spilled(&self) {
        {
            let mut inner = self.inner.lock();
            if let Some(table) = inner.table.as_mut() {
                table.clear();
            }
        }
        self.pool.release();
    }

    fn abort(&self, error: &Arc<ExecError>) {
        warn!("Hash build operator {} aborted: {error}", self.name);
    }
}

// ---------------------------------------------------------------------------
// HashBuild
// ---------------------------------------------------------------------------

/// Builds the hash table of a join on one driver.
///
/// Each driver inserts its input into its own table. The last driver to
/// finish merges all tables and publishes the result on the bridge. When
/// spilling is enabled the drivers then stay around to restore the spilled
/// partitions, one round per partition, until the probe side is done.
pub struct HashBuild {
    shared: Arc<HashBuildShared>,
    ctx: DriverCtx,
    node: Arc<HashJoinNode>,
    bridge: Arc<HashJoinBridge>,
    /// Build columns in table order.
    table_columns: Vec<usize>,
    /// Table columns that null out an anti join filter.
    anti_filter_columns: Vec<usize>,
    analyze_keys: bool,
    /// Partition restored by the current round.
    restoring: Option<SpillPartitionId>,
    spill_input: Option<UnorderedStreamReader>,
    future: Option<ContinueFuture>,
    no_more_input: bool,
}

impl HashBuild {
    pub fn try_new(
        ctx: &DriverCtx,
        node: Arc<HashJoinNode>,
        metrics: &ExecutionPlanMetricsSet,
    ) -> ExecResult<Self> {
        let task = ctx.task();
        let spill_config = if node.can_spill() {
            task.config().join_spill_config()?
        } else {
            None
        };
        let name = format!("HashBuild.{}.{}", node.id, ctx.driver_id());
        let (pool_impl, pool) = task.add_operator_pool(&name, None)?;
        let spiller = match &spill_config {
            Some(config) => Some(new_spiller(task, &node, None, config)),
            None => None,
        };
        let shared = Arc::new(HashBuildShared {
            name,
            plan_node_id: node.id.clone(),
            task: Arc::downgrade(task),
            pool,
            spill_config,
            inner: Mutex::new(BuildInner {
                table: Some(new_table(&node)?),
                spiller,
            }),
            state: AtomicU8::new(BuildState::Running as u8),
            non_reclaimable_section: AtomicBool::new(false),
            exceeded_max_spill_level: AtomicBool::new(false),
            join_has_null_keys: AtomicBool::new(false),
            metrics: HashBuildMetrics::new(metrics, ctx.driver_id(), node.build_keys.len()),
        });
        let reclaimable: Arc<dyn ReclaimableOperator> = Arc::clone(&shared) as _;
        pool_impl.set_reclaimer(OperatorReclaimer::new(Arc::downgrade(&reclaimable)));
        task.register_reclaimable(&node.id, Arc::downgrade(&reclaimable));
        let bridge = task.get_or_create_bridge(&node.id);
        bridge.add_builder(Arc::clone(&shared));

        let table_columns: Vec<usize> = node
            .build_keys
            .iter()
            .copied()
            .chain(node.build_dependents())
            .collect();
        let anti_filter_columns = match &node.filter {
            Some(filter) if node.join_type == JoinType::Anti && filter_propagates_nulls(filter) => {
                let num_probe_columns = node.probe_schema.fields().len();
                let build_to_table = node.build_to_table();
                referenced_columns(filter)
                    .into_iter()
                    .filter(|&c| c >= num_probe_columns)
                    .map(|c| build_to_table[c - num_probe_columns])
                    .collect()
            }
            _ => vec![],
        };

        Ok(Self {
            shared,
            ctx: ctx.clone(),
            node,
            bridge,
            table_columns,
            anti_filter_columns,
            analyze_keys: true,
            restoring: None,
            spill_input: None,
            future: None,
            no_more_input: false,
        })
    }

    pub fn shared(&self) -> &Arc<HashBuildShared> {
        &self.shared
    }

    /// Inserts a batch in the table row type. `probed` carries the probed
    /// flags of rows read back from a spill.
    fn add_table_input(
        &mut self,
        batch: RecordBatch,
        probed: Option<BooleanArray>,
        from_spill: bool,
    ) -> ExecResult<()> {
        let _non_reclaimable = NonReclaimableSectionGuard::new(&self.shared.non_reclaimable_section);
        self.ensure_input_fits(&batch)?;

        let num_keys = self.node.build_keys.len();
        let num_rows = batch.num_rows();
        let mut keep = vec![true; num_rows];
        let drop_null_keys = !(self.node.join_type.keeps_null_key_build_rows()
            || self.node.is_null_aware_with_filter());
        let mut num_null_keys = 0;
        for (row, keep_row) in keep.iter_mut().enumerate() {
            if (0..num_keys).any(|k| batch.column(k).is_null(row)) {
                num_null_keys += 1;
                if drop_null_keys {
                    *keep_row = false;
                }
            }
        }
        if num_null_keys > 0 {
            if !from_spill {
                self.shared.metrics.num_null_keys.add(num_null_keys);
            }
            if self.node.null_aware {
                self.shared.join_has_null_keys.store(true, Ordering::Release);
            }
        }
        // A null in a column the filter reads makes the filter null, so the
        // row can never match.
        for &column in &self.anti_filter_columns {
            let array = batch.column(column);
            if array.null_count() == 0 {
                continue;
            }
            for (row, keep_row) in keep.iter_mut().enumerate() {
                if array.is_null(row) {
                    *keep_row = false;
                }
            }
        }

        let (batch, probed) = if keep.iter().all(|k| *k) {
            (batch, probed)
        } else {
            let mask = BooleanArray::from(keep);
            let probed = match probed {
                Some(probed) => Some(filter(&probed, &mask)?.as_boolean().clone()),
                None => None,
            };
            (filter_record_batch(&batch, &mask)?, probed)
        };
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let mut hashes = vec![];
        hash_keys(&batch.columns()[..num_keys], batch.num_rows(), &mut hashes)?;
        if self.spill_rows(&batch, &hashes, probed.as_ref())? {
            return Ok(());
        }

        let track_probed = self.node.join_type.need_right_side_join();
        let bytes = RowContainer::estimate_bytes(&batch, track_probed);
        self.shared.pool.allocate(bytes)?;
        let mut inner = self.shared.inner.lock();
        if inner.spiller.as_ref().is_some_and(|s| s.spill_triggered()) {
            drop(inner);
            self.shared.pool.free(bytes);
            self.spill_rows(&batch, &hashes, probed.as_ref())?;
            return Ok(());
        }
        let Some(table) = inner.table.as_mut() else {
            return Err(ExecError::Internal(format!(
                "hash build operator {} has no table",
                self.shared.name
            )));
        };
        if self.analyze_keys {
            for hasher in table.hashers_mut() {
                let channel = hasher.channel();
                if !hasher.analyze(batch.column(channel))? {
                    self.analyze_keys = false;
                }
            }
        }
        table
            .rows_mut()
            .store(batch, hashes, probed.as_ref(), &self.shared.pool, bytes);
        Ok(())
    }

    /// Routes all rows to the spiller once spilling was triggered. Returns
    /// false if it wasn't.
    fn spill_rows(
        &self,
        batch: &RecordBatch,
        hashes: &[u64],
        probed: Option<&BooleanArray>,
    ) -> ExecResult<bool> {
        let mut inner = self.shared.inner.lock();
        let Some(spiller) = inner.spiller.as_mut().filter(|s| s.spill_triggered()) else {
            return Ok(false);
        };
        let start = Instant::now();
        let spill_batch = spiller.to_spill_batch(batch, probed)?;
        let bits = spiller.hash_bits();
        let mut by_partition: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for (row, &hash) in hashes.iter().enumerate() {
            by_partition
                .entry(bits.partition(hash))
                .or_default()
                .push(row as u32);
        }
        for (partition, rows) in by_partition {
            let id = spiller.partition_id(partition);
            let rows = take_record_batch(&spill_batch, &UInt32Array::from(rows))?;
            spiller.spill_partition(&id, &rows)?;
        }
        self.shared.metrics.spill_time.add_elapsed(start);
        Ok(true)
    }

    /// Reserves memory for `batch` ahead of inserting it, so that a reclaim
    /// triggered by the reservation can still spill this operator.
    fn ensure_input_fits(&self, batch: &RecordBatch) -> ExecResult<()> {
        let Some(config) = &self.shared.spill_config else {
            return Ok(());
        };
        let (num_rows, table_increment) = {
            let inner = self.shared.inner.lock();
            if inner.spiller.as_ref().is_none_or(|s| s.spill_triggered()) {
                return Ok(());
            }
            match inner.table.as_ref() {
                Some(table) => (
                    table.num_rows(),
                    table.hash_table_size_increase(batch.num_rows()),
                ),
                None => return Ok(()),
            }
        };
        let pool = &self.shared.pool;
        let current_usage = pool.used_bytes();
        let increment = RowContainer::estimate_bytes(
            batch,
            self.node.join_type.need_right_side_join(),
        ) + table_increment;
        if num_rows != 0 {
            let min_reservation = current_usage * config.min_spillable_reservation_pct as u64 / 100;
            let available = pool.available_reservation();
            if available >= min_reservation && available > 2 * increment {
                return Ok(());
            }
        }
        let target = (2 * increment)
            .max(current_usage * config.spillable_reservation_growth_pct as u64 / 100);
        {
            let _reclaimable = ReclaimableSectionGuard::new(&self.shared.non_reclaimable_section);
            if pool.maybe_reserve(target)? {
                if self.shared.spill_triggered() {
                    pool.release();
                }
                return Ok(());
            }
        }
        warn!(
            "Failed to reserve {target} bytes for memory pool {}, usage: {}, reservation: {}",
            pool.name(),
            pool.used_bytes(),
            pool.reserved_bytes()
        );
        Ok(())
    }

    fn no_more_input_internal(&mut self) -> ExecResult<()> {
        if !self.finish_hash_build()? {
            return Ok(());
        }
        self.post_hash_build_process()
    }

    /// Returns true on the driver that built the table. The others wait for
    /// it in `WaitForBuild`.
    fn finish_hash_build(&mut self) -> ExecResult<bool> {
        let task = Arc::clone(self.ctx.task());
        let barrier_id = format!("{}.build", self.node.id);
        let promises = match task.all_peers_finished(&barrier_id, self.ctx.num_drivers()) {
            BarrierOutcome::Wait(future) => {
                self.shared.set_state(BuildState::WaitForBuild);
                self.future = Some(future);
                return Ok(false);
            }
            BarrierOutcome::Last(promises) => promises,
        };
        let shared = Arc::clone(&self.shared);
        let _non_reclaimable = NonReclaimableSectionGuard::new(&shared.non_reclaimable_section);
        let _timer = shared.metrics.build_time.timer();
        // On failure the promises are dropped, which also wakes the peers.
        self.build_join_table()?;
        promises.into_iter().for_each(ContinuePromise::set_value);
        Ok(true)
    }

    fn build_join_table(&self) -> ExecResult<()> {
        let peers = self.bridge.builders();
        let join_has_null_keys = peers.iter().any(|peer| peer.join_has_null_keys());
        if self.node.null_aware
            && self.node.join_type == JoinType::Anti
            && self.node.filter.is_none()
            && join_has_null_keys
        {
            for peer in &peers {
                drop(peer.take_build_state());
                peer.pool.release();
            }
            info!(
                "Null-aware anti join {} has null build keys, skipping the table",
                self.node.id
            );
            self.bridge.set_anti_join_has_null_keys();
            return Ok(());
        }

        self.ensure_table_fits(&peers)?;

        let mut own_table = None;
        let mut other_tables = vec![];
        let mut spill_partitions = SpillPartitionSet::new();
        let mut spilled = false;
        for peer in &peers {
            let (table, spiller) = peer.take_build_state();
            if let Some(mut spiller) = spiller {
                spilled |= spiller.spill_triggered();
                spiller.finish_spill(&mut spill_partitions)?;
                let stats = spiller.stats().lock().clone();
                peer.metrics.record_spill_stats(&stats);
                if stats.spilled_rows > 0 {
                    debug!("{} spill stats: {stats}", peer.name);
                }
            }
            match table {
                Some(table) if Arc::ptr_eq(peer, &self.shared) => own_table = Some(table),
                Some(table) => other_tables.push(table),
                None => {}
            }
        }
        let Some(mut table) = own_table else {
            return Err(ExecError::Internal(format!(
                "hash build operator {} has no table to build",
                self.shared.name
            )));
        };

        let num_rows = table.num_rows() + other_tables.iter().map(|t| t.num_rows()).sum::<usize>();
        let min_parallel_rows = self
            .ctx
            .task()
            .config()
            .min_table_rows_for_parallel_join_build()?;
        let parallel = !other_tables.is_empty() && !spilled && num_rows >= min_parallel_rows;
        table.prepare_join_table(other_tables, parallel, &self.shared.pool)?;
        if parallel {
            self.shared.metrics.parallel_join_build_count.add(1);
        }
        for (hasher, (range, distinct)) in table
            .hashers()
            .iter()
            .zip(self.shared.metrics.key_cardinalities.iter())
        {
            let (range_size, num_distinct) = hasher.cardinality();
            if range_size != RANGE_TOO_LARGE {
                range.set(range_size as usize);
            }
            if num_distinct != RANGE_TOO_LARGE {
                distinct.set(num_distinct as usize);
            }
        }
        debug!(
            "Hash build {} built a table of {num_rows} rows{}, {} spilled partitions",
            self.shared.name,
            if parallel { " in parallel" } else { "" },
            spill_partitions.len()
        );
        let spill_func = self.table_spill_func();
        self.bridge
            .set_hash_table(table, spill_partitions, join_has_null_keys, spill_func);
        self.shared.pool.release();
        Ok(())
    }

    /// Reserves memory for the table index before the tables are merged.
    fn ensure_table_fits(&self, peers: &[Arc<HashBuildShared>]) -> ExecResult<()> {
        if self.shared.spill_config.is_none() {
            return Ok(());
        }
        let num_rows: usize = peers.iter().map(|peer| peer.num_rows()).sum();
        let bytes = match self.shared.inner.lock().table.as_ref() {
            Some(table) => table.estimate_hash_table_size(num_rows) * 11 / 10,
            None => 0,
        };
        if bytes == 0 {
            return Ok(());
        }
        let _reclaimable = ReclaimableSectionGuard::new(&self.shared.non_reclaimable_section);
        if !self.shared.pool.maybe_reserve(bytes)? {
            warn!(
                "Failed to reserve {bytes} bytes for the table of join {}",
                self.node.id
            );
        }
        Ok(())
    }

    /// Lets the bridge spill the published table if it can't be probed yet.
    fn table_spill_func(&self) -> Option<TableSpillFunc> {
        let config = self.shared.spill_config.clone()?;
        if self.shared.exceeded_max_spill_level.load(Ordering::Acquire) {
            return None;
        }
        let join_type = self.node.join_type;
        let parent = self.restoring.clone();
        let spill_schema = self.node.spill_schema();
        let disk_manager = Arc::clone(&self.ctx.task().runtime().disk_manager);
        let prefix = format!("HashJoinBridge.{}", self.node.id);
        Some(Box::new(move |table: &HashTable| {
            let mut spiller = HashBuildSpiller::new(
                join_type,
                parent.clone(),
                Arc::clone(&spill_schema),
                &config,
                Arc::clone(&disk_manager),
                prefix.clone(),
            );
            spiller.spill(table.rows())?;
            let mut partitions = SpillPartitionSet::new();
            spiller.finish_spill(&mut partitions)?;
            Ok(partitions)
        }))
    }

    fn post_hash_build_process(&mut self) -> ExecResult<()> {
        if !self.shared.spill_enabled() {
            self.shared.set_state(BuildState::Finish);
            return Ok(());
        }
        match self.bridge.spill_input_or_future() {
            Err(future) => {
                self.shared.set_state(BuildState::WaitForProbe);
                self.future = Some(future);
                Ok(())
            }
            Ok(SpillInput::Finish) => {
                self.shared.set_state(BuildState::Finish);
                Ok(())
            }
            Ok(SpillInput::Partition(partition)) => self.setup_spill_input(partition),
        }
    }

    /// Starts restoring a shard of a spilled partition into a fresh table.
    fn setup_spill_input(&mut self, partition: SpillPartition) -> ExecResult<()> {
        let Some(config) = self.shared.spill_config.clone() else {
            return Err(ExecError::Internal(
                "spill input without spilling enabled".to_string(),
            ));
        };
        let id = partition.id().clone();
        let start_bit = config.start_partition_bit as u32
            + (id.spill_level() as u32 + 1) * config.num_partition_bits as u32;
        let exceeded = start_bit + config.num_partition_bits as u32 > 64
            || config.exceed_spill_level_limit(start_bit as u8);
        let spiller = if exceeded {
            self.shared.metrics.spill_max_level_exceeded_count.add(1);
            warn!(
                "Exceeded spill level limit restoring partition {id} of join {}, \
                 disabling spilling for it",
                self.node.id
            );
            None
        } else {
            Some(new_spiller(
                self.ctx.task(),
                &self.node,
                Some(id.clone()),
                &config,
            ))
        };
        self.shared
            .exceeded_max_spill_level
            .store(exceeded, Ordering::Release);
        {
            let mut inner = self.shared.inner.lock();
            inner.table = Some(new_table(&self.node)?);
            inner.spiller = spiller;
        }
        self.restoring = Some(id);
        self.analyze_keys = true;
        self.spill_input = Some(partition.create_reader(config.read_batch_rows));
        self.process_spill_input()
    }

    /// Reads the restored shard until it is done or the driver should yield.
    fn process_spill_input(&mut self) -> ExecResult<()> {
        let Some(mut reader) = self.spill_input.take() else {
            return Ok(());
        };
        let num_table_columns = self.table_columns.len();
        let has_probed_flag = self.node.join_type.need_right_side_join();
        while let Some(batch) = reader.next() {
            let batch = batch?;
            let table_batch = batch.project(&(0..num_table_columns).collect::<Vec<_>>())?;
            let probed =
                has_probed_flag.then(|| batch.column(num_table_columns).as_boolean().clone());
            {
                let shared = Arc::clone(&self.shared);
                let _timer = shared.metrics.build_time.timer();
                self.add_table_input(table_batch, probed, true)?;
            }
            if self.ctx.should_yield() {
                self.spill_input = Some(reader);
                self.shared.set_state(BuildState::Yield);
                return Ok(());
            }
        }
        let (num_reads, read_bytes) = reader.read_stats();
        debug!(
            "{} restored partition {:?}: {num_reads} batches, {read_bytes} bytes",
            self.shared.name,
            self.restoring.as_ref().map(|id| id.to_string())
        );
        self.no_more_input_internal()
    }
}

fn new_table(node: &HashJoinNode) -> ExecResult<HashTable> {
    HashTable::try_new(
        node.table_schema(),
        node.build_keys.len(),
        node.join_type.allows_duplicate_keys(node.filter.is_some()),
        node.join_type.need_right_side_join(),
    )
}

fn new_spiller(
    task: &Arc<Task>,
    node: &HashJoinNode,
    parent: Option<SpillPartitionId>,
    config: &SpillConfig,
) -> HashBuildSpiller {
    HashBuildSpiller::new(
        node.join_type,
        parent,
        node.spill_schema(),
        config,
        Arc::clone(&task.runtime().disk_manager),
        format!("HashBuild.{}", node.id),
    )
}

impl Operator for HashBuild {
    fn name(&self) -> &str {
        "HashBuild"
    }

    fn plan_node_id(&self) -> &str {
        &self.node.id
    }

    fn needs_input(&self) -> bool {
        self.shared.state() == BuildState::Running
            && !self.no_more_input
            && self.spill_input.is_none()
    }

    fn add_input(&mut self, batch: RecordBatch) -> ExecResult<()> {
        let shared = Arc::clone(&self.shared);
        let _timer = shared.metrics.build_time.timer();
        let batch = batch.project(&self.table_columns)?;
        self.add_table_input(batch, None, false)
    }

    fn no_more_input(&mut self) -> ExecResult<()> {
        self.no_more_input = true;
        self.no_more_input_internal()
    }

    fn get_output(&mut self) -> ExecResult<Option<RecordBatch>> {
        Ok(None)
    }

    fn is_blocked(&mut self) -> ExecResult<(BlockingReason, Option<ContinueFuture>)> {
        match self.shared.state() {
            BuildState::Running => {
                if self.spill_input.is_some() {
                    self.process_spill_input()?;
                }
            }
            BuildState::Yield => {
                self.shared.set_state(BuildState::Running);
                self.process_spill_input()?;
            }
            BuildState::WaitForBuild | BuildState::WaitForProbe => {
                if self.future.is_none() {
                    self.shared.set_state(BuildState::Running);
                    self.post_hash_build_process()?;
                }
            }
            BuildState::Finish => {}
        }
        let reason = self.shared.state().blocking_reason();
        Ok((reason, self.future.take()))
    }

    fn is_finished(&self) -> bool {
        self.shared.state() == BuildState::Finish
    }

    fn close(&mut self) {
        drop(self.shared.take_build_state());
        self.spill_input = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::config::{QueryConfig, JOIN_SPILL_ENABLED, SPILL_ENABLED};
    use crate::execution::driver::{execute, Pipeline};
    use crate::execution::joins::test_util::*;
    use crate::execution::joins::TableOrFuture;
    use crate::execution::memory_pools::GB;
    use crate::execution::operators::ValuesSource;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;

    fn node(join_type: JoinType) -> Arc<HashJoinNode> {
        Arc::new(
            HashJoinNode::try_new(
                "7",
                join_type,
                false,
                int64_schema(&["p"]),
                int64_schema(&["k", "v"]),
                vec![0],
                vec![0],
                None,
            )
            .unwrap(),
        )
    }

    fn task(spill: bool) -> Arc<Task> {
        let config = QueryConfig::default()
            .with(SPILL_ENABLED, spill)
            .with(JOIN_SPILL_ENABLED, spill);
        Task::new("t", config, RuntimeEnvBuilder::new().build_arc().unwrap(), GB)
    }

    fn build_batch(keys: Vec<Option<i64>>) -> RecordBatch {
        let values = keys.iter().map(|k| k.map(|k| k * 10)).collect();
        int64_batch(&int64_schema(&["k", "v"]), vec![keys, values])
    }

    fn run_build(task: &Arc<Task>, node: &Arc<HashJoinNode>, batches: Vec<RecordBatch>, drivers: usize) {
        let metrics = ExecutionPlanMetricsSet::new();
        let build_node = Arc::clone(node);
        let pipeline = Pipeline {
            factories: vec![
                Box::new(move |ctx: &DriverCtx| {
                    Ok(Box::new(ValuesSource::for_driver(
                        "0",
                        &batches,
                        ctx.driver_id(),
                        ctx.num_drivers(),
                    )) as Box<dyn Operator>)
                }),
                Box::new(move |ctx: &DriverCtx| {
                    Ok(Box::new(HashBuild::try_new(ctx, Arc::clone(&build_node), &metrics)?)
                        as Box<dyn Operator>)
                }),
            ],
            num_drivers: drivers,
        };
        execute(task, vec![pipeline]).unwrap();
    }

    #[test]
    fn drivers_merge_into_one_table() {
        let task = task(false);
        let node = node(JoinType::Inner);
        let batches = vec![
            build_batch(vec![Some(1), Some(2)]),
            build_batch(vec![Some(3), None]),
            build_batch(vec![Some(1)]),
        ];
        run_build(&task, &node, batches, 3);
        let bridge = task.get_or_create_bridge(&node.id);
        let TableOrFuture::Table(result) = bridge.table_or_future() else {
            panic!("table expected");
        };
        let table = result.table.unwrap();
        // The null key is dropped for inner joins.
        assert_eq!(table.num_rows(), 4);
        assert!(result.spill_partition_ids.is_empty());
        assert!(bridge
            .builders()
            .iter()
            .all(|b| b.state() == BuildState::Finish));
    }

    #[test]
    fn right_join_keeps_null_keys() {
        let task = task(false);
        let node = node(JoinType::Right);
        run_build(&task, &node, vec![build_batch(vec![Some(1), None])], 1);
        let bridge = task.get_or_create_bridge(&node.id);
        let TableOrFuture::Table(result) = bridge.table_or_future() else {
            panic!("table expected");
        };
        let table = result.table.unwrap();
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.null_key_rows().len(), 1);
    }

    #[test]
    fn null_aware_anti_join_with_null_key_skips_table() {
        let task = task(false);
        let node = Arc::new(
            HashJoinNode::try_new(
                "7",
                JoinType::Anti,
                true,
                int64_schema(&["p"]),
                int64_schema(&["k"]),
                vec![0],
                vec![0],
                None,
            )
            .unwrap(),
        );
        let batches = vec![int64_batch(
            &int64_schema(&["k"]),
            vec![vec![Some(1), Some(2), None]],
        )];
        run_build(&task, &node, batches, 2);
        let bridge = task.get_or_create_bridge(&node.id);
        let TableOrFuture::Table(result) = bridge.table_or_future() else {
            panic!("result expected");
        };
        assert!(result.table.is_none());
        assert!(result.has_null_keys);
    }

    #[test]
    #[should_panic(expected = "Unexpected state transition")]
    fn finish_is_terminal() {
        let task = task(false);
        let node = node(JoinType::Inner);
        let ctx = DriverCtx::new(Arc::clone(&task), 0, 0, 1);
        let build = HashBuild::try_new(&ctx, node, &ExecutionPlanMetricsSet::new()).unwrap();
        build.shared.set_state(BuildState::Finish);
        build.shared.set_state(BuildState::Running);
    }

    #[test]
    #[should_panic(expected = "Unexpected state transition")]
    fn no_restore_without_spilling() {
        let task = task(false);
        let ctx = DriverCtx::new(Arc::clone(&task), 0, 0, 1);
        let build =
            HashBuild::try_new(&ctx, node(JoinType::Inner), &ExecutionPlanMetricsSet::new())
                .unwrap();
        build.shared.set_state(BuildState::WaitForProbe);
        build.shared.set_state(BuildState::Running);
    }

    /// Two build drivers with input in their tables, as a reclaim sees them.
    fn loaded_builds(task: &Arc<Task>) -> (Vec<HashBuild>, ExecutionPlanMetricsSet) {
        let metrics = ExecutionPlanMetricsSet::new();
        let node = node(JoinType::Inner);
        let mut builds: Vec<HashBuild> = (0..2)
            .map(|i| {
                let ctx = DriverCtx::new(Arc::clone(task), 0, i, 2);
                HashBuild::try_new(&ctx, Arc::clone(&node), &metrics).unwrap()
            })
            .collect();
        for (i, build) in builds.iter_mut().enumerate() {
            let keys = (0..100).map(|k| Some(k * 2 + i as i64)).collect();
            build.add_input(build_batch(keys)).unwrap();
        }
        (builds, metrics)
    }

    #[test]
    fn gang_reclaim_spills_all_peers() {
        let task = task(true);
        let (builds, metrics) = loaded_builds(&task);
        assert!(builds.iter().all(|b| b.shared.pool().used_bytes() > 0));

        assert!(task.request_pause(None));
        let mut stats = ReclaimerStats::default();
        builds[1].shared.reclaim(0, &mut stats).unwrap();
        task.resume();

        assert_eq!(stats.num_non_reclaimable_attempts, 0);
        for build in &builds {
            assert!(build.shared.spill_triggered());
            assert_eq!(build.shared.num_rows(), 0);
            assert_eq!(build.shared.pool().used_bytes(), 0);
        }
        let spilled_rows: usize = builds
            .iter()
            .map(|b| {
                let inner = b.shared.inner.lock();
                let stats = inner.spiller.as_ref().unwrap().stats();
                let rows = stats.lock().spilled_rows as usize;
                rows
            })
            .sum();
        assert_eq!(spilled_rows, 200);
        assert!(metrics.clone_inner().sum_by_name("spill_time").is_some());
    }

    #[test]
    fn gang_reclaim_refused_if_any_peer_busy() {
        let task = task(true);
        let (builds, metrics) = loaded_builds(&task);

        let busy = NonReclaimableSectionGuard::new(&builds[0].shared.non_reclaimable_section);
        assert!(task.request_pause(None));
        let mut stats = ReclaimerStats::default();
        builds[1].shared.reclaim(0, &mut stats).unwrap();
        task.resume();
        drop(busy);

        assert_eq!(stats.num_non_reclaimable_attempts, 1);
        for build in &builds {
            assert!(!build.shared.spill_triggered());
            assert_eq!(build.shared.num_rows(), 100);
        }
        assert_eq!(
            metrics
                .clone_inner()
                .sum_by_name("num_non_reclaimable_attempts")
                .map(|v| v.as_usize()),
            Some(1)
        );
    }

    #[test]
    fn input_after_spill_goes_to_disk() {
        let task = task(true);
        let (mut builds, _metrics) = loaded_builds(&task);
        assert!(task.request_pause(None));
        builds[0]
            .shared
            .reclaim(0, &mut ReclaimerStats::default())
            .unwrap();
        task.resume();

        builds[0]
            .add_input(build_batch((0..10).map(Some).collect()))
            .unwrap();
        assert_eq!(builds[0].shared.num_rows(), 0);
        let inner = builds[0].shared.inner.lock();
        let stats = inner.spiller.as_ref().unwrap().stats();
        assert_eq!(stats.lock().spilled_rows, 110);
    }
}
