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

//! Hash partitioned spilling to Arrow IPC files.
//!
//! Rows are assigned to partitions by a range of bits of their key hash. A
//! partition that is spilled again while being restored is split on the next
//! range of bits, so partitions form a tree addressed by [`SpillPartitionId`].

mod partition;
mod state;

pub use partition::{
    merge_partition_sets, SpillFile, SpillPartition, SpillPartitionSet, UnorderedStreamReader,
};
pub use state::{SpillState, SpillWriter};

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::errors::{ExecError, ExecResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillConfig {
    /// Number of hash bits used per spill level.
    pub num_partition_bits: u8,
    /// First hash bit used at spill level 0.
    pub start_partition_bit: u8,
    /// Deepest level a partition may be spilled at; -1 means unlimited.
    pub max_spill_level: i32,
    /// A spill file is closed once it reaches this size; 0 means unlimited.
    pub max_file_size: u64,
    /// Rows extracted per write while spilling a table.
    pub max_spill_run_rows: usize,
    pub min_spillable_reservation_pct: u32,
    pub spillable_reservation_growth_pct: u32,
    /// Target rows per batch when reading spilled data back.
    pub read_batch_rows: usize,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            num_partition_bits: 3,
            start_partition_bit: 48,
            max_spill_level: 1,
            max_file_size: 0,
            max_spill_run_rows: 12 * 1024 * 1024,
            min_spillable_reservation_pct: 5,
            spillable_reservation_growth_pct: 10,
            read_batch_rows: 8192,
        }
    }
}

impl SpillConfig {
    pub fn validate(&self) -> ExecResult<()> {
        if self.num_partition_bits == 0 || self.num_partition_bits > 16 {
            return Err(ExecError::Config(format!(
                "spill num_partition_bits must be in [1, 16], got {}",
                self.num_partition_bits
            )));
        }
        if self.start_partition_bit as u32 + self.num_partition_bits as u32 > 64 {
            return Err(ExecError::Config(format!(
                "spill start_partition_bit {} leaves no room for {} partition bits",
                self.start_partition_bit, self.num_partition_bits
            )));
        }
        if self.max_spill_level < -1 {
            return Err(ExecError::Config(format!(
                "max_spill_level must be -1 or non-negative, got {}",
                self.max_spill_level
            )));
        }
        if self.max_spill_run_rows == 0 || self.read_batch_rows == 0 {
            return Err(ExecError::Config(
                "max_spill_run_rows and spill_read_batch_rows must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Spill level of a partition whose bits start at `start_bit`.
    pub fn spill_level(&self, start_bit: u8) -> u8 {
        assert!(
            start_bit >= self.start_partition_bit,
            "start bit {start_bit} below the first spill bit {}",
            self.start_partition_bit
        );
        (start_bit - self.start_partition_bit) / self.num_partition_bits
    }

    /// True if spilling at `start_bit` would go past the configured depth or
    /// run out of hash bits.
    pub fn exceed_spill_level_limit(&self, start_bit: u8) -> bool {
        if start_bit as u32 + self.num_partition_bits as u32 > 64 {
            return true;
        }
        if self.max_spill_level == -1 {
            return false;
        }
        self.spill_level(start_bit) as i32 > self.max_spill_level
    }

    /// Hash bits used to partition a table restored from `parent`, or the top
    /// level range when not restoring.
    pub fn hash_bits(&self, parent: Option<&SpillPartitionId>) -> HashBitRange {
        let level = parent.map_or(0, |id| id.spill_level() + 1);
        let begin = self.start_partition_bit + level * self.num_partition_bits;
        HashBitRange::new(begin, begin + self.num_partition_bits)
    }
}

/// A half-open range `[begin, end)` of hash bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashBitRange {
    begin: u8,
    end: u8,
}

impl HashBitRange {
    pub fn new(begin: u8, end: u8) -> Self {
        assert!(
            begin < end && end <= 64,
            "invalid hash bit range [{begin}, {end})"
        );
        Self { begin, end }
    }

    pub fn begin(&self) -> u8 {
        self.begin
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    pub fn num_partitions(&self) -> usize {
        1 << (self.end - self.begin)
    }

    #[inline]
    pub fn partition(&self, hash: u64) -> u32 {
        let mask = (1u64 << (self.end - self.begin)) - 1;
        ((hash >> self.begin) & mask) as u32
    }
}

/// Path from the top spill level down to a partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpillPartitionId {
    path: Vec<u32>,
}

impl SpillPartitionId {
    pub fn new(partition_number: u32) -> Self {
        Self {
            path: vec![partition_number],
        }
    }

    pub fn child(&self, partition_number: u32) -> Self {
        let mut path = self.path.clone();
        path.push(partition_number);
        Self { path }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.path.len() <= 1 {
            return None;
        }
        Some(Self {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    pub fn partition_number(&self) -> u32 {
        self.path[self.path.len() - 1]
    }

    pub fn spill_level(&self) -> u8 {
        (self.path.len() - 1) as u8
    }

    /// Id of partition `partition_number` one level below `parent`, or at the
    /// top level.
    pub fn with_parent(parent: Option<&SpillPartitionId>, partition_number: u32) -> Self {
        match parent {
            Some(parent) => parent.child(partition_number),
            None => Self::new(partition_number),
        }
    }
}

impl Display for SpillPartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, p) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, "]")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub spill_runs: u64,
    pub spilled_input_bytes: u64,
    pub spilled_bytes: u64,
    pub spilled_rows: u64,
    pub spilled_partitions: u64,
    pub spilled_files: u64,
    pub spill_write_time: Duration,
    pub spill_read_bytes: u64,
    pub spill_reads: u64,
    pub spill_max_level_exceeded_count: u64,
}

impl Display for SpillStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "spill_runs {} spilled_input_bytes {} spilled_bytes {} spilled_rows {} \
             spilled_partitions {} spilled_files {} spill_write_time {:?} \
             spill_reads {} spill_read_bytes {} spill_max_level_exceeded_count {}",
            self.spill_runs,
            self.spilled_input_bytes,
            self.spilled_bytes,
            self.spilled_rows,
            self.spilled_partitions,
            self.spilled_files,
            self.spill_write_time,
            self.spill_reads,
            self.spill_read_bytes,
            self.spill_max_level_exceeded_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_levels() {
        let config = SpillConfig {
            num_partition_bits: 3,
            start_partition_bit: 48,
            max_spill_level: 1,
            ..Default::default()
        };
        assert_eq!(config.spill_level(48), 0);
        assert_eq!(config.spill_level(54), 2);
        assert!(!config.exceed_spill_level_limit(51));
        assert!(config.exceed_spill_level_limit(54));
        assert!(config.exceed_spill_level_limit(62));

        let unlimited = SpillConfig {
            max_spill_level: -1,
            ..config.clone()
        };
        assert!(!unlimited.exceed_spill_level_limit(60));
        assert!(unlimited.exceed_spill_level_limit(62));
    }

    #[test]
    fn validate_rejects_bad_bits() {
        let config = SpillConfig {
            num_partition_bits: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = SpillConfig {
            start_partition_bit: 62,
            num_partition_bits: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(SpillConfig::default().validate().is_ok());
    }

    #[test]
    fn hash_bits_follow_level() {
        let config = SpillConfig::default();
        let top = config.hash_bits(None);
        assert_eq!((top.begin(), top.end()), (48, 51));
        assert_eq!(top.num_partitions(), 8);
        let id = SpillPartitionId::new(5);
        let next = config.hash_bits(Some(&id));
        assert_eq!((next.begin(), next.end()), (51, 54));

        let hash = 0b101u64 << 48 | 0b011u64 << 51;
        assert_eq!(top.partition(hash), 5);
        assert_eq!(next.partition(hash), 3);
    }

    #[test]
    fn partition_ids_form_a_tree() {
        let id = SpillPartitionId::new(2);
        let child = id.child(7);
        assert_eq!(child.spill_level(), 1);
        assert_eq!(child.partition_number(), 7);
        assert_eq!(child.parent(), Some(id.clone()));
        assert_eq!(id.parent(), None);
        assert_eq!(child.to_string(), "[2,7]");
        assert!(id < child);
        assert!(child < SpillPartitionId::new(3));
        assert_eq!(SpillPartitionId::with_parent(Some(&id), 7), child);
    }
}
