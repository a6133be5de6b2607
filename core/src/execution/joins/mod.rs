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

//! Hash join with spilling.
//!
//! The build side runs one [`HashBuild`] per driver. Each fills its own
//! table; the last driver to finish merges them and publishes the result on
//! the plan node's [`HashJoinBridge`], from which every [`HashProbe`] driver
//! reads. Under memory pressure the build spills its rows to hash partitions
//! on disk. Probe rows that fall into a spilled partition are spilled too, and
//! the partitions are then joined one at a time, each restored into a fresh
//! table by the build drivers.

pub mod bridge;
pub mod hash_build;
pub mod hash_build_spiller;
pub mod hash_probe;
pub mod hash_table;
pub mod join_type;
pub mod row_container;
pub mod vector_hasher;

pub use bridge::{HashBuildResult, HashJoinBridge, SpillInput, TableOrFuture, TableSpillFunc};
pub use hash_build::{BuildState, HashBuild, HashBuildShared};
pub use hash_build_spiller::HashBuildSpiller;
pub use hash_probe::HashProbe;
pub use hash_table::HashTable;
pub use join_type::JoinType;
pub use row_container::{RowContainer, RowId};
pub use vector_hasher::VectorHasher;

use std::sync::Arc;

use ahash::RandomState;
use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::common::hash_utils::create_hashes;
use datafusion::physical_expr::PhysicalExpr;

use crate::errors::{ExecError, ExecResult};
use crate::execution::task::PlanNodeId;

/// Name of the trailing column that carries probed flags in spilled build rows.
pub const PROBED_FLAG_COLUMN: &str = "__probed";

/// Name of the match column of semi project joins.
pub const MATCH_COLUMN: &str = "match";

/// Hash function shared by the table, the spill partitioning of both sides,
/// and the probe. Partition bits are taken from the high end of the hash, so
/// spill levels and table lookups stay independent.
pub(crate) fn join_random_state() -> RandomState {
    RandomState::with_seeds(
        0x2d358dccaa6c78a5,
        0x8bb84b93962eacc9,
        0x4b33a62ed433d4a3,
        0x4d5a2da51de1aa47,
    )
}

/// Hashes the key columns of `num_rows` rows into `hashes`.
pub(crate) fn hash_keys(keys: &[ArrayRef], num_rows: usize, hashes: &mut Vec<u64>) -> ExecResult<()> {
    hashes.clear();
    hashes.resize(num_rows, 0);
    create_hashes(keys, &join_random_state(), hashes)?;
    Ok(())
}

/// The hash join plan node. The probe side is the left side.
#[derive(Debug)]
pub struct HashJoinNode {
    pub id: PlanNodeId,
    pub join_type: JoinType,
    /// `NOT IN` semantics for anti joins and semi project joins: a null on
    /// either side makes the comparison unknown.
    pub null_aware: bool,
    pub probe_schema: SchemaRef,
    pub build_schema: SchemaRef,
    pub probe_keys: Vec<usize>,
    pub build_keys: Vec<usize>,
    /// Residual filter over the probe columns followed by the build columns.
    pub filter: Option<Arc<dyn PhysicalExpr>>,
}

impl HashJoinNode {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        id: impl Into<PlanNodeId>,
        join_type: JoinType,
        null_aware: bool,
        probe_schema: SchemaRef,
        build_schema: SchemaRef,
        probe_keys: Vec<usize>,
        build_keys: Vec<usize>,
        filter: Option<Arc<dyn PhysicalExpr>>,
    ) -> ExecResult<Self> {
        if probe_keys.is_empty() || probe_keys.len() != build_keys.len() {
            return Err(ExecError::Internal(format!(
                "hash join needs the same non-zero number of keys on both sides, got {} and {}",
                probe_keys.len(),
                build_keys.len()
            )));
        }
        for (&p, &b) in probe_keys.iter().zip(build_keys.iter()) {
            if p >= probe_schema.fields().len() || b >= build_schema.fields().len() {
                return Err(ExecError::Internal(format!(
                    "join key channel out of range: probe {p}, build {b}"
                )));
            }
            let (pt, bt) = (
                probe_schema.field(p).data_type(),
                build_schema.field(b).data_type(),
            );
            if pt != bt {
                return Err(ExecError::Internal(format!(
                    "join key types differ: probe {pt} vs build {bt}"
                )));
            }
        }
        let mut sorted = build_keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != build_keys.len() {
            return Err(ExecError::Internal(
                "build keys must be distinct columns".to_string(),
            ));
        }
        if null_aware && (!join_type.can_be_null_aware() || build_keys.len() != 1) {
            return Err(ExecError::Internal(format!(
                "null-aware {join_type} join is not supported with {} keys",
                build_keys.len()
            )));
        }
        Ok(Self {
            id: id.into(),
            join_type,
            null_aware,
            probe_schema,
            build_schema,
            probe_keys,
            build_keys,
            filter,
        })
    }

    /// Build columns that are not keys, in schema order.
    pub fn build_dependents(&self) -> Vec<usize> {
        (0..self.build_schema.fields().len())
            .filter(|c| !self.build_keys.contains(c))
            .collect()
    }

    /// Position in the table row of each build column.
    pub fn build_to_table(&self) -> Vec<usize> {
        let mut mapping = vec![0; self.build_schema.fields().len()];
        for (pos, &c) in self
            .build_keys
            .iter()
            .chain(self.build_dependents().iter())
            .enumerate()
        {
            mapping[c] = pos;
        }
        mapping
    }

    /// Build rows as stored in the table: keys first, then dependents.
    pub fn table_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .build_keys
            .iter()
            .chain(self.build_dependents().iter())
            .map(|&c| self.build_schema.field(c).clone())
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// Table rows plus the probed flag when the join type tracks it.
    pub fn spill_schema(&self) -> SchemaRef {
        let table = self.table_schema();
        if !self.join_type.need_right_side_join() {
            return table;
        }
        let mut fields: Vec<Field> = table.fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.push(Field::new(PROBED_FLAG_COLUMN, DataType::Boolean, false));
        Arc::new(Schema::new(fields))
    }

    /// Probe columns followed by build columns, the input of the filter.
    pub fn filter_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .probe_schema
            .fields()
            .iter()
            .chain(self.build_schema.fields().iter())
            .map(|f| f.as_ref().clone())
            .collect();
        Arc::new(Schema::new(fields))
    }

    pub fn output_schema(&self) -> SchemaRef {
        let join_type = self.join_type;
        let mut fields = vec![];
        if join_type.outputs_probe_columns() {
            let nullable = matches!(join_type, JoinType::Right | JoinType::Full);
            fields.extend(self.probe_schema.fields().iter().map(|f| {
                f.as_ref()
                    .clone()
                    .with_nullable(f.is_nullable() || nullable)
            }));
        }
        if join_type.outputs_build_columns() {
            let nullable = matches!(join_type, JoinType::Left | JoinType::Full);
            fields.extend(self.build_schema.fields().iter().map(|f| {
                f.as_ref()
                    .clone()
                    .with_nullable(f.is_nullable() || nullable)
            }));
        }
        if matches!(
            join_type,
            JoinType::LeftSemiProject | JoinType::RightSemiProject
        ) {
            fields.push(Field::new(MATCH_COLUMN, DataType::Boolean, self.null_aware));
        }
        Arc::new(Schema::new(fields))
    }

    /// Null-aware joins with a filter need the null-key build rows in the
    /// table.
    pub fn is_null_aware_with_filter(&self) -> bool {
        self.null_aware && self.filter.is_some()
    }

    /// Null-aware joins need a global view of both sides, so they never
    /// spill.
    pub fn can_spill(&self) -> bool {
        !self.null_aware
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use arrow::array::{Array, AsArray, Int64Array, RecordBatch};
    use arrow::datatypes::Int64Type;

    pub fn int64_schema(names: &[&str]) -> SchemaRef {
        Arc::new(Schema::new(
            names
                .iter()
                .map(|n| Field::new(*n, DataType::Int64, true))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn int64_batch(schema: &SchemaRef, columns: Vec<Vec<Option<i64>>>) -> RecordBatch {
        RecordBatch::try_new(
            Arc::clone(schema),
            columns
                .into_iter()
                .map(|c| Arc::new(Int64Array::from(c)) as ArrayRef)
                .collect(),
        )
        .unwrap()
    }

    /// Rows of all batches as sorted vectors of nullable values. Boolean
    /// columns become 0 and 1.
    pub fn sorted_rows(batches: &[RecordBatch]) -> Vec<Vec<Option<i64>>> {
        let mut rows = vec![];
        for batch in batches {
            for r in 0..batch.num_rows() {
                let row = batch
                    .columns()
                    .iter()
                    .map(|c| {
                        if c.is_null(r) {
                            None
                        } else if let Some(b) = c.as_boolean_opt() {
                            Some(b.value(r) as i64)
                        } else {
                            Some(c.as_primitive::<Int64Type>().value(r))
                        }
                    })
                    .collect();
                rows.push(row);
            }
        }
        rows.sort();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn table_layout_puts_keys_first() {
        let build = int64_schema(&["a", "b", "c"]);
        let probe = int64_schema(&["x", "y"]);
        let node = HashJoinNode::try_new(
            "1",
            JoinType::Right,
            false,
            probe,
            build,
            vec![1],
            vec![2],
            None,
        )
        .unwrap();
        let names: Vec<String> = node
            .table_schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(node.build_to_table(), vec![1, 2, 0]);
        assert_eq!(node.spill_schema().fields().len(), 4);
        assert_eq!(node.output_schema().fields().len(), 5);
    }

    #[test]
    fn rejects_bad_keys() {
        let build = int64_schema(&["a"]);
        let probe = int64_schema(&["x"]);
        assert!(HashJoinNode::try_new(
            "1",
            JoinType::Inner,
            false,
            Arc::clone(&probe),
            Arc::clone(&build),
            vec![0],
            vec![],
            None
        )
        .is_err());
        assert!(HashJoinNode::try_new(
            "1",
            JoinType::Inner,
            true,
            probe,
            build,
            vec![0],
            vec![0],
            None
        )
        .is_err());
    }

    #[test]
    fn hashes_are_stable() {
        let a: ArrayRef = Arc::new(arrow::array::Int64Array::from(vec![1, 2, 1]));
        let mut hashes = vec![];
        hash_keys(&[a], 3, &mut hashes).unwrap();
        assert_eq!(hashes[0], hashes[2]);
        assert_ne!(hashes[0], hashes[1]);
    }
}
