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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::Instant;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use datafusion::execution::disk_manager::{DiskManager, RefCountedTempFile};
use log::debug;
use parking_lot::Mutex;

use super::{SpillFile, SpillPartition, SpillPartitionId, SpillPartitionSet, SpillStats};
use crate::errors::{ExecError, ExecResult};

pub(crate) const SPILL_IO_BUFFER_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// SpillWriter: incremental append to an Arrow IPC spill file
// ---------------------------------------------------------------------------

/// Keeps an Arrow IPC `StreamWriter` open over a temp file so batches can be
/// appended without rewriting the file.
pub struct SpillWriter {
    writer: StreamWriter<BufWriter<File>>,
    temp_file: RefCountedTempFile,
    schema: SchemaRef,
    bytes_written: u64,
    num_rows: usize,
}

impl SpillWriter {
    pub fn new(temp_file: RefCountedTempFile, schema: &SchemaRef) -> ExecResult<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_file.path())
            .map_err(|e| ExecError::Spill(format!("Failed to open spill file: {e}")))?;
        let buf_writer = BufWriter::with_capacity(SPILL_IO_BUFFER_SIZE, file);
        let write_options =
            IpcWriteOptions::default().try_with_compression(Some(CompressionType::LZ4_FRAME))?;
        let writer = StreamWriter::try_new_with_options(buf_writer, schema, write_options)?;
        Ok(Self {
            writer,
            temp_file,
            schema: Arc::clone(schema),
            bytes_written: 0,
            num_rows: 0,
        })
    }

    pub fn write_batch(&mut self, batch: &RecordBatch) -> ExecResult<()> {
        if batch.num_rows() > 0 {
            self.bytes_written += batch.get_array_memory_size() as u64;
            self.num_rows += batch.num_rows();
            self.writer.write(batch)?;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Must be called before the file is read back.
    pub fn finish(mut self) -> ExecResult<SpillFile> {
        self.writer.finish()?;
        Ok(SpillFile {
            file: Arc::new(self.temp_file),
            schema: self.schema,
            num_rows: self.num_rows,
            size: self.bytes_written,
        })
    }
}

// ---------------------------------------------------------------------------
// SpillState: per partition spill files of one spiller
// ---------------------------------------------------------------------------

/// Tracks which partitions have been spilled and appends batches to them.
/// Rows of a partition that has not been spilled stay in memory.
pub struct SpillState {
    schema: SchemaRef,
    disk_manager: Arc<DiskManager>,
    file_prefix: String,
    max_file_size: u64,
    spilled: BTreeSet<SpillPartitionId>,
    writers: HashMap<SpillPartitionId, SpillWriter>,
    files: BTreeMap<SpillPartitionId, Vec<SpillFile>>,
    stats: Arc<Mutex<SpillStats>>,
}

impl SpillState {
    pub fn new(
        schema: SchemaRef,
        disk_manager: Arc<DiskManager>,
        file_prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Self {
        Self {
            schema,
            disk_manager,
            file_prefix: file_prefix.into(),
            max_file_size,
            spilled: BTreeSet::new(),
            writers: HashMap::new(),
            files: BTreeMap::new(),
            stats: Arc::new(Mutex::new(SpillStats::default())),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Shared handle to the stats, so they can be read while the owner is
    /// busy.
    pub fn stats(&self) -> Arc<Mutex<SpillStats>> {
        Arc::clone(&self.stats)
    }

    pub fn is_partition_spilled(&self, id: &SpillPartitionId) -> bool {
        self.spilled.contains(id)
    }

    pub fn is_any_partition_spilled(&self) -> bool {
        !self.spilled.is_empty()
    }

    pub fn spilled_partitions(&self) -> &BTreeSet<SpillPartitionId> {
        &self.spilled
    }

    pub fn set_partition_spilled(&mut self, id: SpillPartitionId) {
        if self.spilled.insert(id) {
            self.stats.lock().spilled_partitions += 1;
        }
    }

    /// Appends `batch` to the spill file of partition `id`, rolling over to a
    /// new file once the current one reaches the size limit.
    pub fn append_to_partition(
        &mut self,
        id: &SpillPartitionId,
        batch: &RecordBatch,
    ) -> ExecResult<()> {
        assert!(
            self.is_partition_spilled(id),
            "partition {id} is not spilled"
        );
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let start = Instant::now();
        if !self.writers.contains_key(id) {
            let temp_file = self
                .disk_manager
                .create_tmp_file(&format!("{} spill partition {id}", self.file_prefix))?;
            let writer = SpillWriter::new(temp_file, &self.schema)?;
            self.writers.insert(id.clone(), writer);
        }
        let Some(writer) = self.writers.get_mut(id) else {
            return Err(ExecError::Internal(format!(
                "no spill writer for partition {id}"
            )));
        };
        writer.write_batch(batch)?;
        let roll_over = self.max_file_size > 0 && writer.bytes_written() >= self.max_file_size;
        {
            let mut stats = self.stats.lock();
            stats.spill_runs += 1;
            stats.spilled_rows += batch.num_rows() as u64;
            stats.spilled_input_bytes += batch.get_array_memory_size() as u64;
        }
        if roll_over {
            self.close_writer(id)?;
        }
        self.stats.lock().spill_write_time += start.elapsed();
        Ok(())
    }

    fn close_writer(&mut self, id: &SpillPartitionId) -> ExecResult<()> {
        if let Some(writer) = self.writers.remove(id) {
            let file = writer.finish()?;
            debug!(
                "Finished spill file for partition {id}: {} rows, {} bytes",
                file.num_rows, file.size
            );
            {
                let mut stats = self.stats.lock();
                stats.spilled_files += 1;
                stats.spilled_bytes += file.size;
            }
            self.files.entry(id.clone()).or_default().push(file);
        }
        Ok(())
    }

    /// Closes all open files and hands over every spilled partition that has
    /// at least one file.
    pub fn finish(&mut self) -> ExecResult<SpillPartitionSet> {
        let open: Vec<SpillPartitionId> = self.writers.keys().cloned().collect();
        for id in open {
            self.close_writer(&id)?;
        }
        Ok(std::mem::take(&mut self.files)
            .into_iter()
            .map(|(id, files)| (id.clone(), SpillPartition::new(id, files)))
            .collect())
    }
}
