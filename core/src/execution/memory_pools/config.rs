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

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::errors::{ExecError, ExecResult};
use crate::execution::config::QueryConfig;
use crate::execution::memory_pools::pool::MB;

pub const ARBITRATOR_CAPACITY: &str = "arbitrator_capacity";
pub const MEMORY_POOL_INITIAL_CAPACITY: &str = "memory_pool_initial_capacity";
pub const MEMORY_POOL_RESERVED_CAPACITY: &str = "memory_pool_reserved_capacity";
pub const FAST_EXPONENTIAL_GROWTH_CAPACITY_LIMIT: &str = "fast_exponential_growth_capacity_limit";
pub const SLOW_CAPACITY_GROW_RATIO: &str = "slow_capacity_grow_ratio";
pub const MEMORY_POOL_MIN_FREE_CAPACITY: &str = "memory_pool_min_free_capacity";
pub const MEMORY_POOL_MIN_FREE_CAPACITY_RATIO: &str = "memory_pool_min_free_capacity_ratio";
pub const MEMORY_POOL_MIN_RECLAIM_BYTES: &str = "memory_pool_min_reclaim_bytes";
pub const MEMORY_POOL_MIN_RECLAIM_PCT: &str = "memory_pool_min_reclaim_pct";
pub const MAX_MEMORY_ARBITRATION_TIME_MS: &str = "max_memory_arbitration_time_ms";
pub const GLOBAL_ARBITRATION_ABORT_ENABLED: &str = "global_arbitration_abort_enabled";

/// Capacity policy applied to every query pool registered with the arbitrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrationParticipantConfig {
    /// Capacity granted when the pool is registered.
    pub initial_capacity: u64,
    /// Capacity the arbitrator won't reclaim below while the pool is active.
    pub min_capacity: u64,
    /// Capacity doubles while it stays under this limit.
    pub fast_exponential_growth_capacity_limit: u64,
    /// Past the fast limit capacity grows by this fraction of itself.
    pub slow_capacity_grow_ratio: f64,
    pub min_free_capacity: u64,
    pub min_free_capacity_ratio: f64,
    pub min_reclaim_bytes: u64,
    pub min_reclaim_pct: f64,
}

impl ArbitrationParticipantConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        initial_capacity: u64,
        min_capacity: u64,
        fast_exponential_growth_capacity_limit: u64,
        slow_capacity_grow_ratio: f64,
        min_free_capacity: u64,
        min_free_capacity_ratio: f64,
        min_reclaim_bytes: u64,
        min_reclaim_pct: f64,
    ) -> ExecResult<Self> {
        let config = Self {
            initial_capacity,
            min_capacity,
            fast_exponential_growth_capacity_limit,
            slow_capacity_grow_ratio,
            min_free_capacity,
            min_free_capacity_ratio,
            min_reclaim_bytes,
            min_reclaim_pct,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ExecResult<()> {
        if self.slow_capacity_grow_ratio < 0.0 {
            return Err(ExecError::Config(format!(
                "slow_capacity_grow_ratio {} must not be negative",
                self.slow_capacity_grow_ratio
            )));
        }
        if (self.fast_exponential_growth_capacity_limit == 0)
            != (self.slow_capacity_grow_ratio == 0.0)
        {
            return Err(ExecError::Config(format!(
                "fast_exponential_growth_capacity_limit {} and slow_capacity_grow_ratio {} \
                 both need to be set (non-zero) at the same time to enable growth capacity adjustment",
                self.fast_exponential_growth_capacity_limit, self.slow_capacity_grow_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.min_free_capacity_ratio) {
            return Err(ExecError::Config(format!(
                "min_free_capacity_ratio {} must be in [0, 1]",
                self.min_free_capacity_ratio
            )));
        }
        if (self.min_free_capacity == 0) != (self.min_free_capacity_ratio == 0.0) {
            return Err(ExecError::Config(format!(
                "min_free_capacity {} and min_free_capacity_ratio {} both need to be set \
                 (non-zero) at the same time to enable shrink capacity adjustment",
                self.min_free_capacity, self.min_free_capacity_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.min_reclaim_pct) {
            return Err(ExecError::Config(format!(
                "min_reclaim_pct {} must be in [0, 1]",
                self.min_reclaim_pct
            )));
        }
        Ok(())
    }
}

impl Default for ArbitrationParticipantConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 256 * MB,
            min_capacity: 0,
            fast_exponential_growth_capacity_limit: 512 * MB,
            slow_capacity_grow_ratio: 0.25,
            min_free_capacity: 128 * MB,
            min_free_capacity_ratio: 0.25,
            min_reclaim_bytes: 128 * MB,
            min_reclaim_pct: 0.25,
        }
    }
}

impl Display for ArbitrationParticipantConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "initial_capacity {}, min_capacity {}, fast_exponential_growth_capacity_limit {}, \
             slow_capacity_grow_ratio {}, min_free_capacity {}, min_free_capacity_ratio {}, \
             min_reclaim_bytes {}, min_reclaim_pct {}",
            self.initial_capacity,
            self.min_capacity,
            self.fast_exponential_growth_capacity_limit,
            self.slow_capacity_grow_ratio,
            self.min_free_capacity,
            self.min_free_capacity_ratio,
            self.min_reclaim_bytes,
            self.min_reclaim_pct
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArbitratorConfig {
    /// Total memory shared by all query pools.
    pub capacity: u64,
    pub participant: ArbitrationParticipantConfig,
    pub max_arbitration_time: Duration,
    /// Abort the largest query when reclaiming could not satisfy a request.
    pub global_arbitration_abort_enabled: bool,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            capacity: i64::MAX as u64,
            participant: ArbitrationParticipantConfig::default(),
            max_arbitration_time: Duration::from_secs(300),
            global_arbitration_abort_enabled: false,
        }
    }
}

pub(crate) fn parse_arbitrator_config(conf: &QueryConfig) -> ExecResult<ArbitratorConfig> {
    let defaults = ArbitratorConfig::default();
    let participant = ArbitrationParticipantConfig::try_new(
        conf.parse_or(
            MEMORY_POOL_INITIAL_CAPACITY,
            defaults.participant.initial_capacity,
        )?,
        conf.parse_or(
            MEMORY_POOL_RESERVED_CAPACITY,
            defaults.participant.min_capacity,
        )?,
        conf.parse_or(
            FAST_EXPONENTIAL_GROWTH_CAPACITY_LIMIT,
            defaults.participant.fast_exponential_growth_capacity_limit,
        )?,
        conf.parse_or(
            SLOW_CAPACITY_GROW_RATIO,
            defaults.participant.slow_capacity_grow_ratio,
        )?,
        conf.parse_or(
            MEMORY_POOL_MIN_FREE_CAPACITY,
            defaults.participant.min_free_capacity,
        )?,
        conf.parse_or(
            MEMORY_POOL_MIN_FREE_CAPACITY_RATIO,
            defaults.participant.min_free_capacity_ratio,
        )?,
        conf.parse_or(
            MEMORY_POOL_MIN_RECLAIM_BYTES,
            defaults.participant.min_reclaim_bytes,
        )?,
        conf.parse_or(
            MEMORY_POOL_MIN_RECLAIM_PCT,
            defaults.participant.min_reclaim_pct,
        )?,
    )?;
    let capacity = conf.parse_or(ARBITRATOR_CAPACITY, defaults.capacity)?;
    if capacity == 0 {
        return Err(ExecError::Config(format!(
            "{ARBITRATOR_CAPACITY} must be positive"
        )));
    }
    let max_arbitration_time_ms = conf.parse_or(
        MAX_MEMORY_ARBITRATION_TIME_MS,
        defaults.max_arbitration_time.as_millis() as u64,
    )?;
    Ok(ArbitratorConfig {
        capacity,
        participant,
        max_arbitration_time: Duration::from_millis(max_arbitration_time_ms),
        global_arbitration_abort_enabled: conf.parse_bool(
            GLOBAL_ARBITRATION_ABORT_ENABLED,
            defaults.global_arbitration_abort_enabled,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() {
        let config = parse_arbitrator_config(&QueryConfig::default()).unwrap();
        assert_eq!(config, ArbitratorConfig::default());
    }

    #[test]
    fn parse_overrides() {
        let conf = QueryConfig::default()
            .with(ARBITRATOR_CAPACITY, 1024 * MB)
            .with(MEMORY_POOL_INITIAL_CAPACITY, 32 * MB)
            .with(MAX_MEMORY_ARBITRATION_TIME_MS, 100)
            .with(GLOBAL_ARBITRATION_ABORT_ENABLED, true);
        let config = parse_arbitrator_config(&conf).unwrap();
        assert_eq!(config.capacity, 1024 * MB);
        assert_eq!(config.participant.initial_capacity, 32 * MB);
        assert_eq!(config.max_arbitration_time, Duration::from_millis(100));
        assert!(config.global_arbitration_abort_enabled);
    }

    #[test]
    fn growth_settings_must_be_paired() {
        let conf = QueryConfig::default().with(SLOW_CAPACITY_GROW_RATIO, 0);
        assert!(matches!(
            parse_arbitrator_config(&conf),
            Err(ExecError::Config(msg)) if msg.contains("slow_capacity_grow_ratio")
        ));

        let both_off = QueryConfig::default()
            .with(SLOW_CAPACITY_GROW_RATIO, 0)
            .with(FAST_EXPONENTIAL_GROWTH_CAPACITY_LIMIT, 0);
        assert!(parse_arbitrator_config(&both_off).is_ok());
    }

    #[test]
    fn ratios_are_bounded() {
        let result = ArbitrationParticipantConfig::try_new(0, 0, 0, 0.0, 0, 0.0, 0, 1.5);
        assert!(result.is_err());
        let result = ArbitrationParticipantConfig::try_new(0, 0, 0, 0.0, MB, 2.0, 0, 0.0);
        assert!(result.is_err());
        let result = ArbitrationParticipantConfig::try_new(0, 0, 0, -1.0, 0, 0.0, 0, 0.0);
        assert!(result.is_err());
    }
}
