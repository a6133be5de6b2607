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

//! Columnar storage of build rows.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch};
use arrow::compute::interleave;
use arrow::datatypes::SchemaRef;

use crate::errors::ExecResult;
use crate::execution::memory_pools::MemoryPool;

/// Address of a row: batch number and row within the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    pub batch: u32,
    pub row: u32,
}

impl RowId {
    pub fn new(batch: usize, row: usize) -> Self {
        Self {
            batch: batch as u32,
            row: row as u32,
        }
    }
}

struct StoredBatch {
    batch: RecordBatch,
    hashes: Vec<u64>,
    probed: Option<Box<[AtomicBool]>>,
}

/// Append-only row storage. Batches are kept as they were inserted, along
/// with their key hashes and, for joins that need them, per row probed flags
/// that probe drivers may set concurrently.
///
/// Memory is allocated by the caller before a batch is stored and is freed
/// by the container, to whichever pool it came from, when the container is
/// cleared or dropped.
pub struct RowContainer {
    schema: SchemaRef,
    num_keys: usize,
    track_probed: bool,
    batches: Vec<StoredBatch>,
    num_rows: usize,
    reservations: Vec<(Arc<dyn MemoryPool>, u64)>,
}

impl Debug for RowContainer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowContainer")
            .field("num_keys", &self.num_keys)
            .field("num_batches", &self.batches.len())
            .field("num_rows", &self.num_rows)
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

impl RowContainer {
    pub fn new(schema: SchemaRef, num_keys: usize, track_probed: bool) -> Self {
        assert!(num_keys <= schema.fields().len());
        Self {
            schema,
            num_keys,
            track_probed,
            batches: vec![],
            num_rows: 0,
            reservations: vec![],
        }
    }

    /// Bytes to allocate before storing `batch`.
    pub fn estimate_bytes(batch: &RecordBatch, track_probed: bool) -> u64 {
        let per_row = std::mem::size_of::<u64>() + if track_probed { 1 } else { 0 };
        (batch.get_array_memory_size() + batch.num_rows() * per_row) as u64
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_keys(&self) -> usize {
        self.num_keys
    }

    pub fn track_probed(&self) -> bool {
        self.track_probed
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn batch(&self, i: usize) -> &RecordBatch {
        &self.batches[i].batch
    }

    pub fn hashes(&self, i: usize) -> &[u64] {
        &self.batches[i].hashes
    }

    pub fn hash(&self, row: RowId) -> u64 {
        self.batches[row.batch as usize].hashes[row.row as usize]
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.reservations.iter().map(|(_, bytes)| bytes).sum()
    }

    /// Stores `batch`, whose `bytes` have already been allocated from `pool`.
    /// `probed` restores the flags of rows read back from a spill.
    pub fn store(
        &mut self,
        batch: RecordBatch,
        hashes: Vec<u64>,
        probed: Option<&BooleanArray>,
        pool: &Arc<dyn MemoryPool>,
        bytes: u64,
    ) {
        assert_eq!(batch.num_rows(), hashes.len());
        assert_eq!(batch.num_columns(), self.schema.fields().len());
        if bytes > 0 {
            match self
                .reservations
                .iter_mut()
                .find(|(p, _)| Arc::ptr_eq(p, pool))
            {
                Some((_, reserved)) => *reserved += bytes,
                None => self.reservations.push((Arc::clone(pool), bytes)),
            }
        }
        if batch.num_rows() == 0 {
            return;
        }
        let probed = self.track_probed.then(|| {
            (0..batch.num_rows())
                .map(|i| AtomicBool::new(probed.is_some_and(|p| p.is_valid(i) && p.value(i))))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        self.num_rows += batch.num_rows();
        self.batches.push(StoredBatch {
            batch,
            hashes,
            probed,
        });
    }

    /// Takes over the rows and memory of `other`. Row ids of `other` are
    /// shifted by this container's batch count.
    pub fn merge(&mut self, mut other: RowContainer) {
        assert_eq!(self.schema.fields().len(), other.schema.fields().len());
        self.num_rows += other.num_rows;
        self.batches.append(&mut other.batches);
        for (pool, bytes) in other.reservations.drain(..) {
            match self
                .reservations
                .iter_mut()
                .find(|(p, _)| Arc::ptr_eq(p, &pool))
            {
                Some((_, reserved)) => *reserved += bytes,
                None => self.reservations.push((pool, bytes)),
            }
        }
        other.num_rows = 0;
    }

    pub fn row_ids(&self) -> impl Iterator<Item = RowId> + '_ {
        self.batches
            .iter()
            .enumerate()
            .flat_map(|(b, stored)| (0..stored.batch.num_rows()).map(move |r| RowId::new(b, r)))
    }

    /// True if any key column of the row is null.
    pub fn has_null_key(&self, row: RowId) -> bool {
        let batch = &self.batches[row.batch as usize].batch;
        (0..self.num_keys).any(|k| batch.column(k).is_null(row.row as usize))
    }

    pub fn set_probed(&self, row: RowId) {
        if let Some(probed) = &self.batches[row.batch as usize].probed {
            probed[row.row as usize].store(true, Ordering::Relaxed);
        }
    }

    pub fn is_probed(&self, row: RowId) -> bool {
        self.batches[row.batch as usize]
            .probed
            .as_ref()
            .is_some_and(|p| p[row.row as usize].load(Ordering::Relaxed))
    }

    /// Gathers `columns` of `rows` into arrays.
    pub fn extract_columns(&self, rows: &[RowId], columns: &[usize]) -> ExecResult<Vec<ArrayRef>> {
        let indices: Vec<(usize, usize)> = rows
            .iter()
            .map(|r| (r.batch as usize, r.row as usize))
            .collect();
        columns
            .iter()
            .map(|&c| {
                if rows.is_empty() {
                    return Ok(arrow::array::new_empty_array(
                        self.schema.field(c).data_type(),
                    ));
                }
                let values: Vec<&dyn Array> = self
                    .batches
                    .iter()
                    .map(|b| b.batch.column(c).as_ref())
                    .collect();
                Ok(interleave(&values, &indices)?)
            })
            .collect()
    }

    /// All columns of `rows` as a batch in the container's schema.
    pub fn extract(&self, rows: &[RowId]) -> ExecResult<RecordBatch> {
        let columns: Vec<usize> = (0..self.schema.fields().len()).collect();
        let arrays = self.extract_columns(rows, &columns)?;
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&self.schema),
            arrays,
            &arrow::array::RecordBatchOptions::new().with_row_count(Some(rows.len())),
        )?)
    }

    pub fn extract_probed_flags(&self, rows: &[RowId]) -> BooleanArray {
        rows.iter().map(|&r| Some(self.is_probed(r))).collect()
    }

    /// Drops all rows and frees their memory.
    pub fn clear(&mut self) {
        self.batches.clear();
        self.num_rows = 0;
        for (pool, bytes) in self.reservations.drain(..) {
            pool.free(bytes);
        }
    }
}

impl Drop for RowContainer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::joins::test_util::*;
    use crate::execution::memory_pools::{MemoryPoolImpl, GB};

    fn pool() -> (Arc<MemoryPoolImpl>, Arc<dyn MemoryPool>) {
        let root = MemoryPoolImpl::new_root("q", GB, None);
        let leaf: Arc<dyn MemoryPool> = root.add_leaf_child("op", None);
        (root, leaf)
    }

    #[test]
    fn store_extract_and_free() {
        let (root, pool) = pool();
        let schema = int64_schema(&["k", "v"]);
        let mut container = RowContainer::new(Arc::clone(&schema), 1, true);
        for (base, n) in [(0i64, 3usize), (10, 2)] {
            let batch = int64_batch(
                &schema,
                vec![
                    (0..n as i64).map(|i| Some(base + i)).collect(),
                    (0..n as i64).map(|i| Some(base + i + 100)).collect(),
                ],
            );
            let bytes = RowContainer::estimate_bytes(&batch, true);
            pool.allocate(bytes).unwrap();
            container.store(batch, vec![0; n], None, &pool, bytes);
        }
        assert_eq!(container.num_rows(), 5);
        assert_eq!(pool.used_bytes(), container.allocated_bytes());

        let rows = [RowId::new(1, 1), RowId::new(0, 0)];
        container.set_probed(rows[0]);
        let out = container.extract(&rows).unwrap();
        assert_eq!(
            sorted_rows(&[out]),
            vec![vec![Some(0), Some(100)], vec![Some(11), Some(111)]]
        );
        let flags = container.extract_probed_flags(&rows);
        assert!(flags.value(0));
        assert!(!flags.value(1));
        assert_eq!(container.extract(&[]).unwrap().num_rows(), 0);

        drop(container);
        assert_eq!(pool.used_bytes(), 0);
        assert_eq!(root.reserved_bytes(), 0);
    }

    #[test]
    fn merge_keeps_memory_of_both_pools() {
        let (root, a) = pool();
        let b: Arc<dyn MemoryPool> = root.add_leaf_child("op2", None);
        let schema = int64_schema(&["k"]);
        let batch = int64_batch(&schema, vec![vec![Some(1), None]]);
        let mut left = RowContainer::new(Arc::clone(&schema), 1, false);
        let mut right = RowContainer::new(Arc::clone(&schema), 1, false);
        a.allocate(10).unwrap();
        b.allocate(20).unwrap();
        left.store(batch.clone(), vec![1, 2], None, &a, 10);
        right.store(batch, vec![3, 4], None, &b, 20);
        left.merge(right);
        assert_eq!(left.num_rows(), 4);
        assert_eq!(left.hash(RowId::new(1, 1)), 4);
        assert!(left.has_null_key(RowId::new(1, 1)));
        assert_eq!(left.row_ids().count(), 4);
        left.clear();
        assert_eq!(a.used_bytes(), 0);
        assert_eq!(b.used_bytes(), 0);
    }
}
