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

//! Probe side of the hash join.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, RecordBatch, RecordBatchOptions, UInt32Array,
};
use arrow::compute::{take_arrays, take_record_batch};
use arrow::datatypes::SchemaRef;
use datafusion::physical_expr::PhysicalExpr;
use datafusion::physical_plan::metrics::{
    Count, ExecutionPlanMetricsSet, MetricBuilder, Time,
};
use log::{debug, warn};
use quiver_expr::evaluate_filter;

use super::bridge::{HashJoinBridge, TableOrFuture};
use super::hash_table::HashTable;
use super::row_container::RowId;
use super::{hash_keys, HashJoinNode, JoinType};
use crate::errors::{ExecError, ExecResult};
use crate::execution::driver::DriverCtx;
use crate::execution::future::{ContinueFuture, ContinuePromise};
use crate::execution::memory_pools::{MemoryPool, ReclaimerStats};
use crate::execution::operators::{
    BlockingReason, Operator, OperatorReclaimer, ReclaimableOperator,
};
use crate::execution::spill::{
    merge_partition_sets, HashBitRange, SpillConfig, SpillPartitionId, SpillPartitionSet,
    SpillState, UnorderedStreamReader,
};
use crate::execution::task::BarrierOutcome;

/// Rows per batch when build rows are emitted after probing.
const BUILD_OUTPUT_BATCH_ROWS: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Waiting for the table of the next round.
    WaitForBuild,
    Running,
    /// Done with the round; waiting for the other probe drivers.
    WaitForPeers,
    Finish,
}

struct HashProbeMetrics {
    probe_time: Time,
    input_rows: Count,
    output_rows: Count,
    spill_time: Time,
    spill_count: Count,
    spilled_bytes: Count,
    spilled_rows: Count,
}

impl HashProbeMetrics {
    fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            probe_time: MetricBuilder::new(metrics).subset_time("probe_time", partition),
            input_rows: MetricBuilder::new(metrics).counter("input_rows", partition),
            output_rows: MetricBuilder::new(metrics).output_rows(partition),
            spill_time: MetricBuilder::new(metrics).subset_time("probe_spill_time", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            spilled_rows: MetricBuilder::new(metrics).spilled_rows(partition),
        }
    }
}

/// State of one round, from the table being published to the barrier.
struct ProbeRound {
    /// `None` if a null-aware anti join found a null build key.
    table: Option<Arc<HashTable>>,
    has_null_keys: bool,
    restored: Option<SpillPartitionId>,
    spill_ids: BTreeSet<SpillPartitionId>,
    spill_bits: Option<HashBitRange>,
    spill: Option<SpillState>,
    /// Probe rows spilled for `restored` in earlier rounds.
    input: Option<UnorderedStreamReader>,
}

/// Spills a published table that no probe started on yet. Installed as the
/// reclaimer of the probe operator's pool.
struct TableReclaimer {
    name: String,
    bridge: Arc<HashJoinBridge>,
    enabled: bool,
}

impl ReclaimableOperator for TableReclaimer {
    fn operator_name(&self) -> &str {
        &self.name
    }

    fn can_reclaim(&self) -> bool {
        self.enabled
    }

    fn non_reclaimable_state(&self) -> bool {
        false
    }

    fn reclaimable_bytes(&self) -> u64 {
        self.bridge.reclaimable_table_bytes()
    }

    fn reclaim(&self, _target_bytes: u64, stats: &mut ReclaimerStats) -> ExecResult<()> {
        if self.bridge.reclaim_table()? == 0 {
            stats.num_non_reclaimable_attempts += 1;
        }
        Ok(())
    }

    fn spill(&self) -> ExecResult<()> {
        self.bridge.reclaim_table().map(|_| ())
    }

    fn clear_spilled(&self) {}

    fn abort(&self, error: &Arc<ExecError>) {
        warn!("Hash probe operator {} aborted: {error}", self.name);
    }
}

/// Probes the join table with its input and produces the join result.
///
/// In the first round the input comes from upstream. Rows that hash into a
/// partition the build side spilled are spilled too, and probed again in the
/// round that restores that partition.
pub struct HashProbe {
    ctx: DriverCtx,
    node: Arc<HashJoinNode>,
    bridge: Arc<HashJoinBridge>,
    pool: Arc<dyn MemoryPool>,
    table_reclaimer: Arc<TableReclaimer>,
    spill_config: Option<SpillConfig>,
    output_schema: SchemaRef,
    filter_schema: SchemaRef,
    build_to_table: Vec<usize>,
    state: ProbeState,
    future: Option<ContinueFuture>,
    round: Option<ProbeRound>,
    spilled_inputs: SpillPartitionSet,
    output: VecDeque<RecordBatch>,
    no_more_input: bool,
    metrics: HashProbeMetrics,
}

impl HashProbe {
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
        let name = format!("HashProbe.{}.{}", node.id, ctx.driver_id());
        let bridge = task.get_or_create_bridge(&node.id);
        let (pool_impl, pool) = task.add_operator_pool(&name, None)?;
        let table_reclaimer = Arc::new(TableReclaimer {
            name,
            bridge: Arc::clone(&bridge),
            enabled: spill_config.is_some(),
        });
        let reclaimable: Arc<dyn ReclaimableOperator> = Arc::clone(&table_reclaimer) as _;
        pool_impl.set_reclaimer(OperatorReclaimer::new(Arc::downgrade(&reclaimable)));

        Ok(Self {
            ctx: ctx.clone(),
            output_schema: node.output_schema(),
            filter_schema: node.filter_schema(),
            build_to_table: node.build_to_table(),
            node,
            bridge,
            pool,
            table_reclaimer,
            spill_config,
            state: ProbeState::WaitForBuild,
            future: None,
            round: None,
            spilled_inputs: SpillPartitionSet::new(),
            output: VecDeque::new(),
            no_more_input: false,
            metrics: HashProbeMetrics::new(metrics, ctx.driver_id()),
        })
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pool
    }

    fn start_round(&mut self, result: super::HashBuildResult) -> ExecResult<()> {
        let restored = result.restored_partition_id;
        let (spill_bits, spill) = if result.spill_partition_ids.is_empty() {
            (None, None)
        } else {
            let Some(config) = &self.spill_config else {
                return Err(ExecError::Internal(format!(
                    "join {} spilled without spilling enabled on the probe side",
                    self.node.id
                )));
            };
            let state = SpillState::new(
                Arc::clone(&self.node.probe_schema),
                Arc::clone(&self.ctx.task().runtime().disk_manager),
                format!("HashProbe.{}", self.node.id),
                config.max_file_size,
            );
            (Some(config.hash_bits(restored.as_ref())), Some(state))
        };
        let input = match (&restored, &self.spill_config) {
            (Some(id), Some(config)) => self
                .spilled_inputs
                .remove(id)
                .map(|partition| partition.create_reader(config.read_batch_rows)),
            _ => None,
        };
        debug!(
            "HashProbe.{}.{} starts round {:?} with {} spilled partitions",
            self.node.id,
            self.ctx.driver_id(),
            restored.as_ref().map(|id| id.to_string()),
            result.spill_partition_ids.len()
        );
        self.round = Some(ProbeRound {
            table: result.table,
            has_null_keys: result.has_null_keys,
            restored,
            spill_ids: result.spill_partition_ids,
            spill_bits,
            spill,
            input,
        });
        self.state = ProbeState::Running;
        Ok(())
    }

    fn round_input_done(&self) -> bool {
        match &self.round {
            Some(round) if round.restored.is_some() => round.input.is_none(),
            Some(_) => self.no_more_input,
            None => false,
        }
    }

    /// Closes the round's probe spill and meets the other probe drivers. The
    /// last one to arrive emits the build side rows and moves the bridge to
    /// the next round.
    fn finish_round(&mut self) -> ExecResult<()> {
        let Some(mut round) = self.round.take() else {
            return Ok(());
        };
        if let Some(mut spill) = round.spill.take() {
            let partitions = spill.finish()?;
            let stats = spill.stats().lock().clone();
            self.metrics.spill_count.add(stats.spilled_files as usize);
            self.metrics.spilled_bytes.add(stats.spilled_bytes as usize);
            self.metrics.spilled_rows.add(stats.spilled_rows as usize);
            merge_partition_sets(&mut self.spilled_inputs, partitions);
        }

        let task = Arc::clone(self.ctx.task());
        let barrier_id = format!("{}.probe", self.node.id);
        match task.all_peers_finished(&barrier_id, self.ctx.num_drivers()) {
            BarrierOutcome::Wait(future) => {
                self.state = ProbeState::WaitForPeers;
                self.future = Some(future);
            }
            BarrierOutcome::Last(promises) => {
                if self.node.join_type.need_right_side_join() {
                    if let Some(table) = &round.table {
                        self.emit_build_side(table)?;
                    }
                }
                drop(round);
                self.bridge.probe_finished();
                promises.into_iter().for_each(ContinuePromise::set_value);
                self.state = ProbeState::WaitForBuild;
            }
        }
        Ok(())
    }

    fn probe_keys(&self, batch: &RecordBatch) -> Vec<ArrayRef> {
        self.node
            .probe_keys
            .iter()
            .map(|&k| Arc::clone(batch.column(k)))
            .collect()
    }

    fn probe_batch(&mut self, batch: RecordBatch) -> ExecResult<()> {
        let start = Instant::now();
        let num_rows = batch.num_rows();
        let mut hashes = vec![];
        hash_keys(&self.probe_keys(&batch), num_rows, &mut hashes)?;
        let (batch, hashes) = self.spill_rows(batch, hashes)?;
        if batch.num_rows() == 0 {
            self.metrics.probe_time.add_elapsed(start);
            return Ok(());
        }
        let Some(table) = self.round.as_ref().and_then(|r| r.table.clone()) else {
            // A null build key makes every NOT IN unknown.
            return Ok(());
        };
        let has_null_keys = self.round.as_ref().is_some_and(|r| r.has_null_keys);
        let keys = self.probe_keys(&batch);
        let num_rows = batch.num_rows();
        let key_rows = table.key_converter().convert_columns(&keys)?;
        let null_key: Vec<bool> = (0..num_rows)
            .map(|r| keys.iter().any(|k| k.is_null(r)))
            .collect();

        let mut probe_idx: Vec<u32> = vec![];
        let mut build_rows: Vec<RowId> = vec![];
        let mut matches = vec![];
        for row in 0..num_rows {
            if null_key[row] {
                continue;
            }
            matches.clear();
            table.find_matches(hashes[row], key_rows.row(row), &mut matches);
            for &m in &matches {
                probe_idx.push(row as u32);
                build_rows.push(m);
            }
        }
        let passed = match &self.node.filter {
            Some(filter) => self.evaluate_pairs(filter, &batch, &table, &probe_idx, &build_rows)?,
            None => vec![true; probe_idx.len()],
        };

        let join_type = self.node.join_type;
        let track_probed = table.rows().track_probed();
        let mut matched = vec![false; num_rows];
        let mut out_probe: Vec<u32> = vec![];
        let mut out_build: Vec<RowId> = vec![];
        for ((&p, &b), &pass) in probe_idx.iter().zip(build_rows.iter()).zip(passed.iter()) {
            if !pass {
                continue;
            }
            matched[p as usize] = true;
            if track_probed {
                table.rows().set_probed(b);
            }
            if matches!(
                join_type,
                JoinType::Inner | JoinType::Left | JoinType::Right | JoinType::Full
            ) {
                out_probe.push(p);
                out_build.push(b);
            }
        }

        let unknown = if self.node.null_aware {
            self.null_aware_unknown(&batch, &table, &null_key, &matched, has_null_keys)?
        } else {
            vec![false; num_rows]
        };

        if !out_probe.is_empty() {
            let pairs = self.join_rows(&batch, &table, &out_probe, &out_build)?;
            self.push_output(pairs);
        }
        match join_type {
            JoinType::Left | JoinType::Full => {
                let rows: Vec<u32> = (0..num_rows as u32)
                    .filter(|&r| !matched[r as usize])
                    .collect();
                let unmatched = self.probe_rows_with_null_build(&batch, &rows)?;
                self.push_output(unmatched);
            }
            JoinType::LeftSemiFilter => {
                let rows: Vec<u32> = (0..num_rows as u32)
                    .filter(|&r| matched[r as usize])
                    .collect();
                let semi = self.probe_rows(&batch, &rows, None)?;
                self.push_output(semi);
            }
            JoinType::LeftSemiProject => {
                let flags: BooleanArray = (0..num_rows)
                    .map(|r| {
                        if matched[r] {
                            Some(true)
                        } else if unknown[r] {
                            None
                        } else {
                            Some(false)
                        }
                    })
                    .collect();
                let rows: Vec<u32> = (0..num_rows as u32).collect();
                let project = self.probe_rows(&batch, &rows, Some(Arc::new(flags)))?;
                self.push_output(project);
            }
            JoinType::Anti => {
                let rows: Vec<u32> = (0..num_rows as u32)
                    .filter(|&r| !matched[r as usize] && !unknown[r as usize])
                    .collect();
                let anti = self.probe_rows(&batch, &rows, None)?;
                self.push_output(anti);
            }
            JoinType::Inner
            | JoinType::Right
            | JoinType::RightSemiFilter
            | JoinType::RightSemiProject => {}
        }
        self.metrics.probe_time.add_elapsed(start);
        Ok(())
    }

    /// Spills the rows that fall into a partition spilled by the build side
    /// of this round and returns the rest.
    fn spill_rows(
        &mut self,
        batch: RecordBatch,
        hashes: Vec<u64>,
    ) -> ExecResult<(RecordBatch, Vec<u64>)> {
        let Some(round) = self.round.as_mut() else {
            return Ok((batch, hashes));
        };
        let (Some(bits), Some(spill)) = (round.spill_bits, round.spill.as_mut()) else {
            return Ok((batch, hashes));
        };
        let start = Instant::now();
        let mut keep = vec![];
        let mut spilled: BTreeMap<SpillPartitionId, Vec<u32>> = BTreeMap::new();
        for (row, &hash) in hashes.iter().enumerate() {
            let id = SpillPartitionId::with_parent(round.restored.as_ref(), bits.partition(hash));
            if round.spill_ids.contains(&id) {
                spilled.entry(id).or_default().push(row as u32);
            } else {
                keep.push(row as u32);
            }
        }
        if spilled.is_empty() {
            return Ok((batch, hashes));
        }
        for (id, rows) in spilled {
            let rows = take_record_batch(&batch, &UInt32Array::from(rows))?;
            if !spill.is_partition_spilled(&id) {
                spill.set_partition_spilled(id.clone());
            }
            spill.append_to_partition(&id, &rows)?;
        }
        self.metrics.spill_time.add_elapsed(start);
        let kept_hashes = keep.iter().map(|&r| hashes[r as usize]).collect();
        let kept = take_record_batch(&batch, &UInt32Array::from(keep))?;
        Ok((kept, kept_hashes))
    }

    /// Evaluates the join filter over candidate pairs. Null counts as false.
    fn evaluate_pairs(
        &self,
        filter: &Arc<dyn PhysicalExpr>,
        batch: &RecordBatch,
        table: &HashTable,
        probe_idx: &[u32],
        build_rows: &[RowId],
    ) -> ExecResult<Vec<bool>> {
        if probe_idx.is_empty() {
            return Ok(vec![]);
        }
        let indices = UInt32Array::from(probe_idx.to_vec());
        let mut columns = take_arrays(batch.columns(), &indices, None)?;
        columns.extend(
            table
                .rows()
                .extract_columns(build_rows, &self.build_to_table)?,
        );
        let pairs = RecordBatch::try_new_with_options(
            Arc::clone(&self.filter_schema),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(probe_idx.len())),
        )?;
        let result = evaluate_filter(filter, &pairs)?;
        Ok((0..result.len())
            .map(|i| result.is_valid(i) && result.value(i))
            .collect())
    }

    /// Rows of a null-aware join whose match is unknown: a null on either
    /// side of the key comparison that could have matched.
    fn null_aware_unknown(
        &self,
        batch: &RecordBatch,
        table: &HashTable,
        null_key: &[bool],
        matched: &[bool],
        has_null_keys: bool,
    ) -> ExecResult<Vec<bool>> {
        let num_rows = batch.num_rows();
        let Some(filter) = &self.node.filter else {
            let table_empty = table.num_rows() == 0 && !has_null_keys;
            return Ok((0..num_rows)
                .map(|r| !matched[r] && ((null_key[r] && !table_empty) || has_null_keys))
                .collect());
        };
        // With a filter, only rows passing it count.
        let all_rows: Vec<RowId> = table.rows().row_ids().collect();
        let mut probe_idx = vec![];
        let mut build_rows = vec![];
        for row in 0..num_rows {
            if matched[row] {
                continue;
            }
            let candidates = if null_key[row] {
                &all_rows[..]
            } else {
                table.null_key_rows()
            };
            for &b in candidates {
                probe_idx.push(row as u32);
                build_rows.push(b);
            }
        }
        let passed = self.evaluate_pairs(filter, batch, table, &probe_idx, &build_rows)?;
        let mut unknown = vec![false; num_rows];
        for (&p, pass) in probe_idx.iter().zip(passed) {
            if pass {
                unknown[p as usize] = true;
            }
        }
        Ok(unknown)
    }

    fn join_rows(
        &self,
        batch: &RecordBatch,
        table: &HashTable,
        probe_idx: &[u32],
        build_rows: &[RowId],
    ) -> ExecResult<RecordBatch> {
        let indices = UInt32Array::from(probe_idx.to_vec());
        let mut columns = take_arrays(batch.columns(), &indices, None)?;
        columns.extend(
            table
                .rows()
                .extract_columns(build_rows, &self.build_to_table)?,
        );
        Ok(RecordBatch::try_new(Arc::clone(&self.output_schema), columns)?)
    }

    fn probe_rows_with_null_build(
        &self,
        batch: &RecordBatch,
        rows: &[u32],
    ) -> ExecResult<RecordBatch> {
        let indices = UInt32Array::from(rows.to_vec());
        let mut columns = take_arrays(batch.columns(), &indices, None)?;
        columns.extend(
            self.node
                .build_schema
                .fields()
                .iter()
                .map(|f| new_null_array(f.data_type(), rows.len())),
        );
        Ok(RecordBatch::try_new(Arc::clone(&self.output_schema), columns)?)
    }

    fn probe_rows(
        &self,
        batch: &RecordBatch,
        rows: &[u32],
        match_column: Option<ArrayRef>,
    ) -> ExecResult<RecordBatch> {
        let indices = UInt32Array::from(rows.to_vec());
        let mut columns = take_arrays(batch.columns(), &indices, None)?;
        columns.extend(match_column);
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&self.output_schema),
            columns,
            &RecordBatchOptions::new().with_row_count(Some(rows.len())),
        )?)
    }

    /// Emits the build rows decided by the probe: unmatched rows of right and
    /// full joins, matched rows of right semi filter joins and all rows with
    /// their match flag for right semi project joins.
    fn emit_build_side(&mut self, table: &HashTable) -> ExecResult<()> {
        let join_type = self.node.join_type;
        let container = table.rows();
        let rows: Vec<RowId> = container
            .row_ids()
            .filter(|&r| match join_type {
                JoinType::Right | JoinType::Full => !container.is_probed(r),
                JoinType::RightSemiFilter => container.is_probed(r),
                _ => true,
            })
            .collect();
        for chunk in rows.chunks(BUILD_OUTPUT_BATCH_ROWS) {
            let mut columns: Vec<ArrayRef> = vec![];
            if join_type.outputs_probe_columns() {
                columns.extend(
                    self.node
                        .probe_schema
                        .fields()
                        .iter()
                        .map(|f| new_null_array(f.data_type(), chunk.len())),
                );
            }
            columns.extend(container.extract_columns(chunk, &self.build_to_table)?);
            if join_type == JoinType::RightSemiProject {
                columns.push(Arc::new(container.extract_probed_flags(chunk)));
            }
            let batch = RecordBatch::try_new(Arc::clone(&self.output_schema), columns)?;
            self.push_output(batch);
        }
        Ok(())
    }

    fn push_output(&mut self, batch: RecordBatch) {
        if batch.num_rows() > 0 {
            self.metrics.output_rows.add(batch.num_rows());
            self.output.push_back(batch);
        }
    }
}

impl Operator for HashProbe {
    fn name(&self) -> &str {
        "HashProbe"
    }

    fn plan_node_id(&self) -> &str {
        &self.node.id
    }

    fn needs_input(&self) -> bool {
        self.state == ProbeState::Running
            && !self.no_more_input
            && self.round.as_ref().is_some_and(|r| r.restored.is_none())
    }

    fn add_input(&mut self, batch: RecordBatch) -> ExecResult<()> {
        self.metrics.input_rows.add(batch.num_rows());
        self.probe_batch(batch)
    }

    fn no_more_input(&mut self) -> ExecResult<()> {
        self.no_more_input = true;
        if self.state == ProbeState::Running && self.round_input_done() {
            self.finish_round()?;
        }
        Ok(())
    }

    fn get_output(&mut self) -> ExecResult<Option<RecordBatch>> {
        while self.output.is_empty() && self.state == ProbeState::Running {
            let next = self
                .round
                .as_mut()
                .and_then(|r| r.input.as_mut())
                .and_then(|reader| reader.next());
            match next {
                Some(batch) => self.probe_batch(batch?)?,
                None => {
                    if let Some(round) = self.round.as_mut() {
                        round.input = None;
                    }
                    break;
                }
            }
        }
        Ok(self.output.pop_front())
    }

    fn is_blocked(&mut self) -> ExecResult<(BlockingReason, Option<ContinueFuture>)> {
        if let Some(future) = self.future.take() {
            let reason = match self.state {
                ProbeState::WaitForPeers => BlockingReason::WaitForJoinProbe,
                _ => BlockingReason::WaitForJoinBuild,
            };
            return Ok((reason, Some(future)));
        }
        if self.state == ProbeState::WaitForPeers {
            self.state = ProbeState::WaitForBuild;
        }
        if self.state == ProbeState::WaitForBuild {
            match self.bridge.table_or_future() {
                TableOrFuture::Table(result) => self.start_round(result)?,
                TableOrFuture::Future(future) => {
                    return Ok((BlockingReason::WaitForJoinBuild, Some(future)));
                }
                TableOrFuture::Done => self.state = ProbeState::Finish,
            }
        }
        if self.state == ProbeState::Running && self.round_input_done() {
            self.finish_round()?;
            if let Some(future) = self.future.take() {
                return Ok((BlockingReason::WaitForJoinProbe, Some(future)));
            }
        }
        Ok((BlockingReason::NotBlocked, None))
    }

    fn is_finished(&self) -> bool {
        self.state == ProbeState::Finish && self.output.is_empty()
    }

    fn close(&mut self) {
        self.round = None;
        self.output.clear();
        self.spilled_inputs.clear();
    }
}
