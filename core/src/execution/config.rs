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

//! String-keyed query configuration, as handed over by the embedding engine.

use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::{ExecError, ExecResult};
use crate::execution::spill::SpillConfig;

pub const SPILL_ENABLED: &str = "spill_enabled";
pub const JOIN_SPILL_ENABLED: &str = "join_spill_enabled";
pub const SPILLER_NUM_PARTITION_BITS: &str = "spiller_num_partition_bits";
pub const SPILLER_START_PARTITION_BIT: &str = "spiller_start_partition_bit";
pub const MAX_SPILL_LEVEL: &str = "max_spill_level";
pub const MAX_SPILL_FILE_SIZE: &str = "max_spill_file_size";
pub const MAX_SPILL_RUN_ROWS: &str = "max_spill_run_rows";
pub const MIN_SPILLABLE_RESERVATION_PCT: &str = "min_spillable_reservation_pct";
pub const SPILLABLE_RESERVATION_GROWTH_PCT: &str = "spillable_reservation_growth_pct";
pub const MIN_TABLE_ROWS_FOR_PARALLEL_JOIN_BUILD: &str = "min_table_rows_for_parallel_join_build";
pub const SPILL_READ_BATCH_ROWS: &str = "spill_read_batch_rows";
pub const DEBUG_MEMORY: &str = "debug_memory";

#[derive(Debug, Clone, Default)]
pub struct QueryConfig {
    conf: HashMap<String, String>,
}

impl QueryConfig {
    pub fn new(conf: HashMap<String, String>) -> Self {
        Self { conf }
    }

    /// Builder-style setter, mostly for tests.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.conf.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.conf.get(key).map(String::as_str)
    }

    pub fn parse_bool(&self, name: &str, default: bool) -> ExecResult<bool> {
        self.parse_or(name, default)
    }

    pub fn parse_or<T>(&self, name: &str, default: T) -> ExecResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.conf.get(name) {
            None => Ok(default),
            Some(value) => value.trim().parse::<T>().map_err(|e| {
                ExecError::Config(format!("Failed to parse config {name}={value}: {e}"))
            }),
        }
    }

    pub fn spill_enabled(&self) -> ExecResult<bool> {
        self.parse_bool(SPILL_ENABLED, false)
    }

    pub fn join_spill_enabled(&self) -> ExecResult<bool> {
        Ok(self.spill_enabled()? && self.parse_bool(JOIN_SPILL_ENABLED, true)?)
    }

    pub fn min_table_rows_for_parallel_join_build(&self) -> ExecResult<usize> {
        self.parse_or(MIN_TABLE_ROWS_FOR_PARALLEL_JOIN_BUILD, 1000)
    }

    pub fn debug_memory(&self) -> ExecResult<bool> {
        self.parse_bool(DEBUG_MEMORY, false)
    }

    /// Spill settings for hash joins, or `None` if join spilling is disabled.
    pub fn join_spill_config(&self) -> ExecResult<Option<SpillConfig>> {
        if !self.join_spill_enabled()? {
            return Ok(None);
        }
        let config = SpillConfig {
            num_partition_bits: self.parse_or(SPILLER_NUM_PARTITION_BITS, 3)?,
            start_partition_bit: self.parse_or(SPILLER_START_PARTITION_BIT, 48)?,
            max_spill_level: self.parse_or(MAX_SPILL_LEVEL, 1)?,
            max_file_size: self.parse_or(MAX_SPILL_FILE_SIZE, 0)?,
            max_spill_run_rows: self.parse_or(MAX_SPILL_RUN_ROWS, 12 * 1024 * 1024)?,
            min_spillable_reservation_pct: self.parse_or(MIN_SPILLABLE_RESERVATION_PCT, 5)?,
            spillable_reservation_growth_pct: self
                .parse_or(SPILLABLE_RESERVATION_GROWTH_PCT, 10)?,
            read_batch_rows: self.parse_or(SPILL_READ_BATCH_ROWS, 8192)?,
        };
        config.validate()?;
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_disabled_by_default() {
        let config = QueryConfig::default();
        assert!(!config.spill_enabled().unwrap());
        assert!(config.join_spill_config().unwrap().is_none());
    }

    #[test]
    fn join_spill_config_defaults() {
        let config = QueryConfig::default().with(SPILL_ENABLED, true);
        let spill = config.join_spill_config().unwrap().unwrap();
        assert_eq!(spill.num_partition_bits, 3);
        assert_eq!(spill.start_partition_bit, 48);
        assert_eq!(spill.max_spill_level, 1);
        assert_eq!(spill.spillable_reservation_growth_pct, 10);

        let disabled = config.with(JOIN_SPILL_ENABLED, false);
        assert!(disabled.join_spill_config().unwrap().is_none());
    }

    #[test]
    fn bad_values_are_config_errors() {
        let config = QueryConfig::default()
            .with(SPILL_ENABLED, "yes")
            .with(MAX_SPILL_LEVEL, "two");
        assert!(matches!(config.spill_enabled(), Err(ExecError::Config(_))));

        let config = QueryConfig::default()
            .with(SPILL_ENABLED, true)
            .with(MAX_SPILL_LEVEL, "two");
        assert!(matches!(
            config.join_spill_config(),
            Err(ExecError::Config(msg)) if msg.contains(MAX_SPILL_LEVEL)
        ));

        let config = QueryConfig::default()
            .with(SPILL_ENABLED, true)
            .with(SPILLER_NUM_PARTITION_BITS, 0);
        assert!(config.join_spill_config().is_err());
    }
}
