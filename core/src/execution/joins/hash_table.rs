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

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::row::{Row, RowConverter, Rows, SortField};
use log::debug;
use rayon::prelude::*;

use super::row_container::{RowContainer, RowId};
use super::vector_hasher::VectorHasher;
use crate::errors::ExecResult;
use crate::execution::memory_pools::MemoryPool;

type Bucket = HashMap<u64, Vec<RowId>>;

/// Memory held by the index, freed on drop.
struct IndexReservation {
    pool: Arc<dyn MemoryPool>,
    bytes: u64,
}

impl Drop for IndexReservation {
    fn drop(&mut self) {
        self.pool.free(self.bytes);
    }
}

/// Join hash table: a [`RowContainer`] plus an index from key hash to rows.
///
/// Rows are inserted while the build runs; the index is only built once, by
/// [`HashTable::prepare_join_table`], after the tables of all build drivers
/// have been merged. Lookups compare keys in Arrow row format, so the probe
/// must convert its keys with [`HashTable::key_converter`].
pub struct HashTable {
    rows: RowContainer,
    allow_duplicates: bool,
    hashers: Vec<VectorHasher>,
    key_converter: RowConverter,
    key_rows: Vec<Rows>,
    buckets: Vec<Bucket>,
    null_key_rows: Vec<RowId>,
    reservation: Option<IndexReservation>,
}

impl Debug for HashTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("rows", &self.rows)
            .field("allow_duplicates", &self.allow_duplicates)
            .field("num_distinct", &self.num_distinct())
            .field("num_null_key_rows", &self.null_key_rows.len())
            .finish()
    }
}

impl HashTable {
    /// `schema` is the table row type, with the `num_keys` keys first.
    pub fn try_new(
        schema: SchemaRef,
        num_keys: usize,
        allow_duplicates: bool,
        track_probed: bool,
    ) -> ExecResult<Self> {
        let key_converter = RowConverter::new(
            schema.fields()[..num_keys]
                .iter()
                .map(|f| SortField::new(f.data_type().clone()))
                .collect(),
        )?;
        let hashers = schema.fields()[..num_keys]
            .iter()
            .enumerate()
            .map(|(i, f)| VectorHasher::new(i, f.data_type()))
            .collect();
        Ok(Self {
            rows: RowContainer::new(schema, num_keys, track_probed),
            allow_duplicates,
            hashers,
            key_converter,
            key_rows: vec![],
            buckets: vec![Bucket::new()],
            null_key_rows: vec![],
            reservation: None,
        })
    }

    /// An empty table of the same shape.
    pub fn new_empty_like(&self) -> ExecResult<Self> {
        Self::try_new(
            Arc::clone(self.rows.schema()),
            self.rows.num_keys(),
            self.allow_duplicates,
            self.rows.track_probed(),
        )
    }

    pub fn rows(&self) -> &RowContainer {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut RowContainer {
        &mut self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.num_rows()
    }

    pub fn hashers(&self) -> &[VectorHasher] {
        &self.hashers
    }

    pub fn hashers_mut(&mut self) -> &mut [VectorHasher] {
        &mut self.hashers
    }

    pub fn key_converter(&self) -> &RowConverter {
        &self.key_converter
    }

    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    /// Number of distinct key hashes in the index.
    pub fn num_distinct(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn null_key_rows(&self) -> &[RowId] {
        &self.null_key_rows
    }

    /// Bytes of the container plus the index.
    pub fn allocated_bytes(&self) -> u64 {
        self.rows.allocated_bytes() + self.reservation.as_ref().map_or(0, |r| r.bytes)
    }

    /// Estimated index size for `num_rows` rows.
    pub fn estimate_hash_table_size(&self, num_rows: usize) -> u64 {
        let per_row = std::mem::size_of::<RowId>()
            + 2 * std::mem::size_of::<u64>()
            + 16 * self.rows.num_keys();
        (num_rows * per_row) as u64
    }

    /// Growth of the index estimate when `num_new_rows` are added.
    pub fn hash_table_size_increase(&self, num_new_rows: usize) -> u64 {
        self.estimate_hash_table_size(self.num_rows() + num_new_rows)
            - self.estimate_hash_table_size(self.num_rows())
    }

    /// Merges the rows of `others` into this table and builds the index. The
    /// index is built on the rayon pool, one bucket set per thread, when
    /// `parallel` is set. Index memory is allocated from `pool`.
    pub fn prepare_join_table(
        &mut self,
        others: Vec<HashTable>,
        parallel: bool,
        pool: &Arc<dyn MemoryPool>,
    ) -> ExecResult<()> {
        for other in others {
            for (hasher, other_hasher) in self.hashers.iter_mut().zip(other.hashers.iter()) {
                hasher.merge(other_hasher);
            }
            self.rows.merge(other.rows);
        }

        let num_keys = self.rows.num_keys();
        self.key_rows = (0..self.rows.num_batches())
            .map(|b| {
                self.key_converter
                    .convert_columns(&self.rows.batch(b).columns()[..num_keys])
            })
            .collect::<Result<Vec<_>, _>>()?;
        let key_bytes: usize = self.key_rows.iter().map(|r| r.size()).sum();
        let bytes = self.estimate_hash_table_size(self.num_rows()) + key_bytes as u64;
        pool.allocate(bytes)?;
        self.reservation = Some(IndexReservation {
            pool: Arc::clone(pool),
            bytes,
        });

        self.null_key_rows = self
            .rows
            .row_ids()
            .filter(|&r| self.rows.has_null_key(r))
            .collect();

        let num_buckets = if parallel {
            rayon::current_num_threads().clamp(1, 64)
        } else {
            1
        };
        let buckets: Vec<Bucket> = if num_buckets > 1 {
            (0..num_buckets)
                .into_par_iter()
                .map(|b| self.build_bucket(b, num_buckets))
                .collect()
        } else {
            vec![self.build_bucket(0, 1)]
        };
        self.buckets = buckets;
        debug!(
            "Prepared join table with {} rows, {} distinct keys, {} buckets",
            self.num_rows(),
            self.num_distinct(),
            num_buckets
        );
        Ok(())
    }

    fn build_bucket(&self, bucket: usize, num_buckets: usize) -> Bucket {
        let mut map = Bucket::new();
        for b in 0..self.rows.num_batches() {
            let hashes = self.rows.hashes(b);
            for (r, &hash) in hashes.iter().enumerate() {
                if (hash % num_buckets as u64) as usize != bucket {
                    continue;
                }
                let row = RowId::new(b, r);
                if self.rows.has_null_key(row) {
                    continue;
                }
                let entry = map.entry(hash).or_default();
                if !self.allow_duplicates {
                    let key = self.key_row(row);
                    if entry.iter().any(|&other| self.key_row(other) == key) {
                        continue;
                    }
                }
                entry.push(row);
            }
        }
        map
    }

    fn key_row(&self, row: RowId) -> Row<'_> {
        self.key_rows[row.batch as usize].row(row.row as usize)
    }

    /// Appends the rows whose key equals `key` to `out`.
    pub fn find_matches(&self, hash: u64, key: Row<'_>, out: &mut Vec<RowId>) {
        let bucket = &self.buckets[(hash % self.buckets.len() as u64) as usize];
        if let Some(candidates) = bucket.get(&hash) {
            out.extend(
                candidates
                    .iter()
                    .copied()
                    .filter(|&r| self.key_row(r) == key),
            );
        }
    }

    /// Drops all rows and the index, freeing their memory.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.key_rows.clear();
        self.buckets = vec![Bucket::new()];
        self.null_key_rows.clear();
        self.reservation = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::joins::hash_keys;
    use crate::execution::joins::test_util::*;
    use crate::execution::memory_pools::{MemoryPoolImpl, GB};
    use arrow::array::{ArrayRef, RecordBatch};

    fn insert(table: &mut HashTable, pool: &Arc<dyn MemoryPool>, batch: RecordBatch) {
        let mut hashes = vec![];
        hash_keys(&batch.columns()[..1], batch.num_rows(), &mut hashes).unwrap();
        let bytes = RowContainer::estimate_bytes(&batch, false);
        pool.allocate(bytes).unwrap();
        table
            .rows_mut()
            .store(batch, hashes, None, pool, bytes);
    }

    fn lookup(table: &HashTable, key: i64) -> Vec<RowId> {
        let array: ArrayRef = Arc::new(arrow::array::Int64Array::from(vec![key]));
        let mut hashes = vec![];
        hash_keys(&[Arc::clone(&array)], 1, &mut hashes).unwrap();
        let rows = table.key_converter().convert_columns(&[array]).unwrap();
        let mut out = vec![];
        table.find_matches(hashes[0], rows.row(0), &mut out);
        out
    }

    fn build(parallel: bool, allow_duplicates: bool) -> (Arc<MemoryPoolImpl>, HashTable) {
        let root = MemoryPoolImpl::new_root("q", GB, None);
        let a: Arc<dyn MemoryPool> = root.add_leaf_child("a", None);
        let b: Arc<dyn MemoryPool> = root.add_leaf_child("b", None);
        let schema = int64_schema(&["k", "v"]);
        let mut table = HashTable::try_new(Arc::clone(&schema), 1, allow_duplicates, false).unwrap();
        let mut other = table.new_empty_like().unwrap();
        insert(
            &mut table,
            &a,
            int64_batch(
                &schema,
                vec![vec![Some(1), Some(1), None], vec![Some(10), Some(11), Some(12)]],
            ),
        );
        insert(
            &mut other,
            &b,
            int64_batch(&schema, vec![vec![Some(2), Some(1)], vec![Some(20), Some(13)]]),
        );
        table.prepare_join_table(vec![other], parallel, &a).unwrap();
        (root, table)
    }

    #[test]
    fn lookup_after_merge() {
        for parallel in [false, true] {
            let (_root, table) = build(parallel, true);
            assert_eq!(table.num_rows(), 5);
            assert_eq!(lookup(&table, 1).len(), 3);
            assert_eq!(lookup(&table, 2), vec![RowId::new(1, 0)]);
            assert!(lookup(&table, 3).is_empty());
            assert_eq!(table.null_key_rows(), &[RowId::new(0, 2)]);
            assert_eq!(table.num_distinct(), 2);
        }
    }

    #[test]
    fn duplicates_dropped_from_index() {
        let (_root, table) = build(false, false);
        assert_eq!(lookup(&table, 1), vec![RowId::new(0, 0)]);
    }

    #[test]
    fn clear_frees_memory() {
        let (root, mut table) = build(true, true);
        assert!(root.reserved_bytes() > 0);
        assert!(table.allocated_bytes() > 0);
        table.clear();
        assert_eq!(table.allocated_bytes(), 0);
        assert_eq!(root.reserved_bytes(), 0);
        assert!(lookup(&table, 1).is_empty());
    }
}
