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

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use datafusion::execution::disk_manager::RefCountedTempFile;

use super::state::SPILL_IO_BUFFER_SIZE;
use super::SpillPartitionId;
use crate::errors::{ExecError, ExecResult};

/// A finished spill file. The file is deleted once the last handle is dropped.
#[derive(Debug, Clone)]
pub struct SpillFile {
    pub file: Arc<RefCountedTempFile>,
    pub schema: SchemaRef,
    pub num_rows: usize,
    /// In-memory size of the batches written to the file.
    pub size: u64,
}

/// All files spilled for one partition, possibly by several writers.
#[derive(Debug, Clone)]
pub struct SpillPartition {
    id: SpillPartitionId,
    files: Vec<SpillFile>,
    num_rows: usize,
    size: u64,
}

impl SpillPartition {
    pub fn new(id: SpillPartitionId, files: Vec<SpillFile>) -> Self {
        let num_rows = files.iter().map(|f| f.num_rows).sum();
        let size = files.iter().map(|f| f.size).sum();
        Self {
            id,
            files,
            num_rows,
            size,
        }
    }

    pub fn id(&self) -> &SpillPartitionId {
        &self.id
    }

    pub fn files(&self) -> &[SpillFile] {
        &self.files
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn add_files(&mut self, files: Vec<SpillFile>) {
        for file in files {
            self.num_rows += file.num_rows;
            self.size += file.size;
            self.files.push(file);
        }
    }

    /// Splits the files into `num_shards` partitions with the same id. Files
    /// are dealt out round robin, so trailing shards may be empty.
    pub fn split(self, num_shards: usize) -> Vec<SpillPartition> {
        assert!(num_shards > 0, "cannot split a spill partition into 0 shards");
        let mut shards: Vec<Vec<SpillFile>> = (0..num_shards).map(|_| Vec::new()).collect();
        for (i, file) in self.files.into_iter().enumerate() {
            shards[i % num_shards].push(file);
        }
        shards
            .into_iter()
            .map(|files| SpillPartition::new(self.id.clone(), files))
            .collect()
    }

    pub fn create_reader(&self, read_batch_rows: usize) -> UnorderedStreamReader {
        UnorderedStreamReader::new(self.files.clone(), read_batch_rows)
    }
}

pub type SpillPartitionSet = BTreeMap<SpillPartitionId, SpillPartition>;

/// Merges `from` into `into`, combining the files of partitions that were
/// spilled by more than one writer.
pub fn merge_partition_sets(into: &mut SpillPartitionSet, from: SpillPartitionSet) {
    for (id, partition) in from {
        match into.get_mut(&id) {
            Some(existing) => existing.add_files(partition.files),
            None => {
                into.insert(id, partition);
            }
        }
    }
}

/// Reads the batches of a set of spill files one file after another,
/// coalescing small batches up to `read_batch_rows`. Row order across files
/// is not preserved.
pub struct UnorderedStreamReader {
    files: VecDeque<SpillFile>,
    current: Option<(SpillFile, StreamReader<BufReader<File>>)>,
    read_batch_rows: usize,
    num_reads: u64,
    read_bytes: u64,
}

impl UnorderedStreamReader {
    pub fn new(files: Vec<SpillFile>, read_batch_rows: usize) -> Self {
        Self {
            files: files.into(),
            current: None,
            read_batch_rows: read_batch_rows.max(1),
            num_reads: 0,
            read_bytes: 0,
        }
    }

    /// Number of batches and bytes read so far.
    pub fn read_stats(&self) -> (u64, u64) {
        (self.num_reads, self.read_bytes)
    }

    fn next_raw(&mut self) -> ExecResult<Option<(SchemaRef, RecordBatch)>> {
        loop {
            if let Some((spill_file, reader)) = self.current.as_mut() {
                match reader.next() {
                    Some(batch) => {
                        let batch = batch?;
                        if batch.num_rows() == 0 {
                            continue;
                        }
                        self.num_reads += 1;
                        self.read_bytes += batch.get_array_memory_size() as u64;
                        return Ok(Some((spill_file.schema.clone(), batch)));
                    }
                    None => {
                        self.current = None;
                    }
                }
            }
            let Some(spill_file) = self.files.pop_front() else {
                return Ok(None);
            };
            let file = File::open(spill_file.file.path()).map_err(|e| {
                ExecError::Spill(format!(
                    "Failed to open spill file {}: {e}",
                    spill_file.file.path().display()
                ))
            })?;
            let reader =
                StreamReader::try_new(BufReader::with_capacity(SPILL_IO_BUFFER_SIZE, file), None)?;
            self.current = Some((spill_file, reader));
        }
    }
}

impl Iterator for UnorderedStreamReader {
    type Item = ExecResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut pending: Vec<RecordBatch> = Vec::new();
        let mut pending_rows = 0usize;
        let mut schema = None;
        while pending_rows < self.read_batch_rows {
            match self.next_raw() {
                Ok(Some((file_schema, batch))) => {
                    pending_rows += batch.num_rows();
                    pending.push(batch);
                    schema.get_or_insert(file_schema);
                }
                Ok(None) => break,
                Err(e) => return Some(Err(e)),
            }
        }
        match (pending.len(), schema) {
            (0, _) | (_, None) => None,
            (1, _) => pending.pop().map(Ok),
            (_, Some(schema)) => Some(concat_batches(&schema, &pending).map_err(ExecError::from)),
        }
    }
}
