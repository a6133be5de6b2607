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

pub mod arbitrator;
pub mod config;
mod logging_pool;
pub mod participant;
pub mod pool;

pub use arbitrator::{ArbitratorStats, SharedArbitrator};
pub use config::{ArbitrationParticipantConfig, ArbitratorConfig};
pub use participant::{
    ArbitrationCandidate, ArbitrationOperation, ArbitrationParticipant, ParticipantStats,
    ReclaimOutcome, ScopedArbitrationParticipant,
};
pub use pool::{
    quantized_size, reclaim_children, MemoryPool, MemoryPoolImpl, MemoryPoolKind,
    MemoryReclaimer, ReclaimerStats, GB, KB, MB,
};

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::errors::ExecResult;
use crate::execution::config::QueryConfig;
use logging_pool::LoggingPool;

/// The process-wide arbitrator. Its configuration is taken from the first
/// query that asks for it.
pub fn global_arbitrator(conf: &QueryConfig) -> ExecResult<Arc<SharedArbitrator>> {
    static GLOBAL_ARBITRATOR: OnceCell<Arc<SharedArbitrator>> = OnceCell::new();
    GLOBAL_ARBITRATOR
        .get_or_try_init(|| SharedArbitrator::new(config::parse_arbitrator_config(conf)?))
        .map(Arc::clone)
}

/// Creates an operator pool under `root`, wrapped in a [`LoggingPool`] when
/// memory debugging is on. The concrete leaf is returned too so callers can
/// install a reclaimer later.
pub fn create_leaf_pool(
    root: &Arc<MemoryPoolImpl>,
    name: impl Into<String>,
    reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    debug_memory: bool,
) -> (Arc<MemoryPoolImpl>, Arc<dyn MemoryPool>) {
    let leaf = root.add_leaf_child(name, reclaimer);
    let pool: Arc<dyn MemoryPool> = if debug_memory {
        Arc::new(LoggingPool::new(Arc::clone(&leaf) as Arc<dyn MemoryPool>))
    } else {
        Arc::clone(&leaf) as Arc<dyn MemoryPool>
    };
    (leaf, pool)
}
