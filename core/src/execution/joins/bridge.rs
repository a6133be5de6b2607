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

//! Hand-off between the build and probe sides of one hash join.
//!
//! A join runs in rounds. Round one joins the rows that stayed in memory.
//! Every later round restores one spilled partition: the build drivers each
//! read a shard of its files into a new table, and the probe drivers read back
//! the probe rows they spilled for it.

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use super::hash_build::HashBuildShared;
use super::hash_table::HashTable;
use crate::errors::ExecResult;
use crate::execution::future::{make_continue_future, ContinueFuture, ContinuePromise};
use crate::execution::spill::{
    merge_partition_sets, SpillPartition, SpillPartitionId, SpillPartitionSet,
};

/// Spills a published table that no probe has started on.
pub type TableSpillFunc = Box<dyn Fn(&HashTable) -> ExecResult<SpillPartitionSet> + Send + Sync>;

/// The table of one round, as seen by the probe.
#[derive(Debug, Clone)]
pub struct HashBuildResult {
    /// `None` when a null-aware anti join saw a null build key: the join
    /// produces nothing.
    pub table: Option<Arc<HashTable>>,
    /// The spilled partition this round restores, `None` in the first round.
    pub restored_partition_id: Option<SpillPartitionId>,
    /// Partitions spilled while building this round's table. Probe rows that
    /// fall into one of them are spilled too.
    pub spill_partition_ids: BTreeSet<SpillPartitionId>,
    pub has_null_keys: bool,
}

pub enum TableOrFuture {
    Table(HashBuildResult),
    Future(ContinueFuture),
    /// All rounds are done.
    Done,
}

#[derive(Debug)]
pub enum SpillInput {
    /// A shard of the partition to restore.
    Partition(SpillPartition),
    /// Nothing left to restore.
    Finish,
}

#[derive(Default)]
struct BridgeState {
    build_result: Option<HashBuildResult>,
    spill_func: Option<TableSpillFunc>,
    /// Spilled partitions not restored yet, smallest id first.
    pending: SpillPartitionSet,
    restoring_id: Option<SpillPartitionId>,
    restoring_shards: Vec<SpillPartition>,
    probe_started: bool,
    probe_done: bool,
    cancelled: bool,
    build_promises: Vec<ContinuePromise>,
    probe_promises: Vec<ContinuePromise>,
}

pub struct HashJoinBridge {
    plan_node_id: String,
    state: Mutex<BridgeState>,
    builders: Mutex<Vec<Arc<HashBuildShared>>>,
}

impl Debug for HashJoinBridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HashJoinBridge")
            .field("plan_node_id", &self.plan_node_id)
            .field("has_table", &state.build_result.is_some())
            .field("num_pending", &state.pending.len())
            .field("restoring_id", &state.restoring_id)
            .field("probe_done", &state.probe_done)
            .finish()
    }
}

impl HashJoinBridge {
    pub fn new(plan_node_id: &str) -> Self {
        Self {
            plan_node_id: plan_node_id.to_string(),
            state: Mutex::new(BridgeState::default()),
            builders: Mutex::new(vec![]),
        }
    }

    pub fn add_builder(&self, builder: Arc<HashBuildShared>) {
        self.builders.lock().push(builder);
    }

    pub fn builders(&self) -> Vec<Arc<HashBuildShared>> {
        self.builders.lock().clone()
    }

    pub fn num_builders(&self) -> usize {
        self.builders.lock().len()
    }

    /// Publishes the table of the current round. `spill_partitions` were
    /// spilled while building it.
    pub fn set_hash_table(
        &self,
        table: HashTable,
        spill_partitions: SpillPartitionSet,
        has_null_keys: bool,
        spill_func: Option<TableSpillFunc>,
    ) {
        let promises = {
            let mut state = self.state.lock();
            assert!(
                state.build_result.is_none(),
                "hash table of join {} set twice",
                self.plan_node_id
            );
            let spill_partition_ids: BTreeSet<SpillPartitionId> =
                spill_partitions.keys().cloned().collect();
            merge_partition_sets(&mut state.pending, spill_partitions);
            debug!(
                "Join {} publishes a table of {} rows, {} spilled partitions, {} pending",
                self.plan_node_id,
                table.num_rows(),
                spill_partition_ids.len(),
                state.pending.len()
            );
            state.build_result = Some(HashBuildResult {
                table: Some(Arc::new(table)),
                restored_partition_id: state.restoring_id.take(),
                spill_partition_ids,
                has_null_keys,
            });
            state.restoring_shards.clear();
            state.spill_func = spill_func;
            state.probe_started = false;
            std::mem::take(&mut state.probe_promises)
        };
        promises.into_iter().for_each(ContinuePromise::set_value);
    }

    /// Publishes the empty result of a null-aware anti join that found a null
    /// build key. Nothing is restored after it.
    pub fn set_anti_join_has_null_keys(&self) {
        let promises = {
            let mut state = self.state.lock();
            state.build_result = Some(HashBuildResult {
                table: None,
                restored_partition_id: state.restoring_id.take(),
                spill_partition_ids: BTreeSet::new(),
                has_null_keys: true,
            });
            state.pending.clear();
            state.restoring_shards.clear();
            state.spill_func = None;
            state.probe_started = false;
            std::mem::take(&mut state.probe_promises)
        };
        promises.into_iter().for_each(ContinuePromise::set_value);
    }

    /// The current round's table, a future that completes when it is
    /// published, or `Done` after the last round.
    pub fn table_or_future(&self) -> TableOrFuture {
        let mut state = self.state.lock();
        if state.cancelled {
            return TableOrFuture::Future(ContinueFuture::ready());
        }
        if let Some(result) = &state.build_result {
            let result = result.clone();
            state.probe_started = true;
            return TableOrFuture::Table(result);
        }
        if state.probe_done {
            return TableOrFuture::Done;
        }
        let (promise, future) = make_continue_future("HashJoinBridge::table_or_future");
        state.probe_promises.push(promise);
        TableOrFuture::Future(future)
    }

    /// Called by the last probe driver of a round. Starts restoring the next
    /// spilled partition, or ends the join.
    pub fn probe_finished(&self) {
        let promises = {
            let mut state = self.state.lock();
            state.build_result = None;
            state.spill_func = None;
            state.probe_started = false;
            match state.pending.pop_first() {
                Some((id, partition)) => {
                    let num_builders = self.num_builders().max(1);
                    info!(
                        "Join {} restores spill partition {id}: {} rows in {} files",
                        self.plan_node_id,
                        partition.num_rows(),
                        partition.num_files()
                    );
                    state.restoring_shards = partition.split(num_builders);
                    state.restoring_id = Some(id);
                }
                None => {
                    state.probe_done = true;
                }
            }
            std::mem::take(&mut state.build_promises)
        };
        promises.into_iter().for_each(ContinuePromise::set_value);
    }

    /// Next shard to restore for a build driver, or a future to wait on
    /// until the probe side is done with the current round.
    pub fn spill_input_or_future(&self) -> Result<SpillInput, ContinueFuture> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(ContinueFuture::ready());
        }
        if state.restoring_id.is_none() {
            // Spilled partitions may still be added until the probe side is
            // done, by a reclaim of the published table.
            if state.probe_done {
                return Ok(SpillInput::Finish);
            }
        } else if let Some(shard) = state.restoring_shards.pop() {
            return Ok(SpillInput::Partition(shard));
        }
        let (promise, future) = make_continue_future("HashJoinBridge::spill_input_or_future");
        state.build_promises.push(promise);
        Err(future)
    }

    /// Bytes of a published table that could still be spilled.
    pub fn reclaimable_table_bytes(&self) -> u64 {
        let state = self.state.lock();
        if state.probe_started || state.spill_func.is_none() {
            return 0;
        }
        state
            .build_result
            .as_ref()
            .and_then(|r| r.table.as_ref())
            .map_or(0, |t| t.allocated_bytes())
    }

    /// Spills the published table if no probe has taken it yet. Returns the
    /// number of bytes released.
    pub fn reclaim_table(&self) -> ExecResult<u64> {
        let mut state = self.state.lock();
        if state.probe_started {
            return Ok(0);
        }
        let Some(table) = state
            .build_result
            .as_ref()
            .and_then(|r| r.table.as_ref())
            .map(Arc::clone)
        else {
            return Ok(0);
        };
        let Some(spill_func) = state.spill_func.as_ref() else {
            return Ok(0);
        };
        if table.num_rows() == 0 {
            return Ok(0);
        }
        let spilled = spill_func(&table)?;
        let empty = table.new_empty_like()?;
        let bytes = table.allocated_bytes();
        drop(table);
        let ids: Vec<SpillPartitionId> = spilled.keys().cloned().collect();
        merge_partition_sets(&mut state.pending, spilled);
        if let Some(result) = state.build_result.as_mut() {
            result.table = Some(Arc::new(empty));
            result.spill_partition_ids.extend(ids);
        }
        info!(
            "Join {} spilled its unprobed table, releasing {bytes} bytes",
            self.plan_node_id
        );
        Ok(bytes)
    }

    /// Wakes all waiters. They must check the task state.
    pub fn cancel(&self) {
        let (build, probe) = {
            let mut state = self.state.lock();
            state.cancelled = true;
            (
                std::mem::take(&mut state.build_promises),
                std::mem::take(&mut state.probe_promises),
            )
        };
        drop(build);
        drop(probe);
    }
}
