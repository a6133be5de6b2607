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

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, RecordBatch, RecordBatchOptions};
use arrow::datatypes::SchemaRef;
use datafusion::execution::disk_manager::DiskManager;
use log::info;
use parking_lot::Mutex;

use super::join_type::JoinType;
use super::row_container::{RowContainer, RowId};
use crate::errors::ExecResult;
use crate::execution::spill::{
    merge_partition_sets, HashBitRange, SpillConfig, SpillPartitionId, SpillPartitionSet,
    SpillState, SpillStats,
};

/// Spills the rows of one build operator to hash partitions.
///
/// Once [`HashBuildSpiller::spill`] ran, every partition of the spiller's bit
/// range is spilled and the operator routes all further input here.
pub struct HashBuildSpiller {
    join_type: JoinType,
    parent_id: Option<SpillPartitionId>,
    bits: HashBitRange,
    state: SpillState,
    max_spill_run_rows: usize,
    spill_probed_flag: bool,
    spill_triggered: bool,
    finalized: bool,
}

impl HashBuildSpiller {
    /// `parent_id` is the partition being restored, if any. `spill_schema` is
    /// the table row type, plus the probed flag for right side joins.
    pub fn new(
        join_type: JoinType,
        parent_id: Option<SpillPartitionId>,
        spill_schema: SchemaRef,
        config: &SpillConfig,
        disk_manager: Arc<DiskManager>,
        file_prefix: impl Into<String>,
    ) -> Self {
        let bits = config.hash_bits(parent_id.as_ref());
        let spill_probed_flag = join_type.need_right_side_join();
        Self {
            join_type,
            parent_id,
            bits,
            state: SpillState::new(spill_schema, disk_manager, file_prefix, config.max_file_size),
            max_spill_run_rows: config.max_spill_run_rows,
            spill_probed_flag,
            spill_triggered: false,
            finalized: false,
        }
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn hash_bits(&self) -> HashBitRange {
        self.bits
    }

    pub fn parent_id(&self) -> Option<&SpillPartitionId> {
        self.parent_id.as_ref()
    }

    pub fn partition_id(&self, partition_number: u32) -> SpillPartitionId {
        SpillPartitionId::with_parent(self.parent_id.as_ref(), partition_number)
    }

    pub fn partition_of(&self, hash: u64) -> SpillPartitionId {
        self.partition_id(self.bits.partition(hash))
    }

    pub fn spill_triggered(&self) -> bool {
        self.spill_triggered
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_partition_spilled(&self, id: &SpillPartitionId) -> bool {
        self.state.is_partition_spilled(id)
    }

    pub fn stats(&self) -> Arc<Mutex<SpillStats>> {
        self.state.stats()
    }

    /// Spills all rows of `rows` and marks every partition of the bit range
    /// spilled.
    pub fn spill(&mut self, rows: &RowContainer) -> ExecResult<()> {
        assert!(!self.finalized, "spill after the spiller was finalized");
        self.spill_triggered = true;
        let num_partitions = self.bits.num_partitions();
        for p in 0..num_partitions {
            self.state.set_partition_spilled(self.partition_id(p as u32));
        }
        let mut by_partition: Vec<Vec<RowId>> = vec![vec![]; num_partitions];
        for row in rows.row_ids() {
            by_partition[self.bits.partition(rows.hash(row)) as usize].push(row);
        }
        for (p, ids) in by_partition.iter().enumerate() {
            let id = self.partition_id(p as u32);
            for run in ids.chunks(self.max_spill_run_rows) {
                let batch = self.extract_spill(rows, run)?;
                self.state.append_to_partition(&id, &batch)?;
            }
        }
        info!(
            "Spilled {} rows into partitions {:?} of hash bits [{}, {})",
            rows.num_rows(),
            self.parent_id.as_ref().map(|id| id.to_string()),
            self.bits.begin(),
            self.bits.end()
        );
        Ok(())
    }

    /// Appends `batch`, whose rows all belong to partition `id`.
    pub fn spill_partition(&mut self, id: &SpillPartitionId, batch: &RecordBatch) -> ExecResult<()> {
        assert!(self.spill_triggered, "spill_partition before spill was triggered");
        assert!(!self.finalized, "spill_partition after the spiller was finalized");
        if !self.state.is_partition_spilled(id) {
            self.state.set_partition_spilled(id.clone());
        }
        self.state.append_to_partition(id, batch)
    }

    /// Materializes `ids` in the spill row type.
    pub fn extract_spill(&self, rows: &RowContainer, ids: &[RowId]) -> ExecResult<RecordBatch> {
        let columns: Vec<usize> = (0..rows.schema().fields().len()).collect();
        let mut arrays = rows.extract_columns(ids, &columns)?;
        if self.spill_probed_flag {
            arrays.push(Arc::new(rows.extract_probed_flags(ids)) as ArrayRef);
        }
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(self.state.schema()),
            arrays,
            &RecordBatchOptions::new().with_row_count(Some(ids.len())),
        )?)
    }

    /// Converts a batch in the table row type to the spill row type.
    /// `probed` carries the flags of rows read back from a spill.
    pub fn to_spill_batch(
        &self,
        batch: &RecordBatch,
        probed: Option<&BooleanArray>,
    ) -> ExecResult<RecordBatch> {
        if !self.spill_probed_flag {
            return Ok(batch.clone());
        }
        let mut arrays = batch.columns().to_vec();
        let flags = match probed {
            Some(probed) => probed.clone(),
            None => BooleanArray::from(vec![false; batch.num_rows()]),
        };
        arrays.push(Arc::new(flags));
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(self.state.schema()),
            arrays,
            &RecordBatchOptions::new().with_row_count(Some(batch.num_rows())),
        )?)
    }

    /// Closes all files and adds the spilled partitions to `partitions`.
    pub fn finish_spill(&mut self, partitions: &mut SpillPartitionSet) -> ExecResult<()> {
        assert!(!self.finalized, "spiller finalized twice");
        self.finalized = true;
        merge_partition_sets(partitions, self.state.finish()?);
        Ok(())
    }
}
