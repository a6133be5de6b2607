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

use log::info;

use crate::errors::{ExecError, ExecResult};
use crate::execution::memory_pools::pool::{MemoryPool, MemoryPoolKind, ReclaimerStats};

/// Logs every reservation change of the wrapped pool.
#[derive(Debug)]
pub(crate) struct LoggingPool {
    pool: Arc<dyn MemoryPool>,
}

impl LoggingPool {
    pub fn new(pool: Arc<dyn MemoryPool>) -> Self {
        Self { pool }
    }
}

impl MemoryPool for LoggingPool {
    fn name(&self) -> &str {
        self.pool.name()
    }

    fn kind(&self) -> MemoryPoolKind {
        self.pool.kind()
    }

    fn capacity(&self) -> u64 {
        self.pool.capacity()
    }

    fn max_capacity(&self) -> u64 {
        self.pool.max_capacity()
    }

    fn reserved_bytes(&self) -> u64 {
        self.pool.reserved_bytes()
    }

    fn used_bytes(&self) -> u64 {
        self.pool.used_bytes()
    }

    fn peak_bytes(&self) -> u64 {
        self.pool.peak_bytes()
    }

    fn free_bytes(&self) -> u64 {
        self.pool.free_bytes()
    }

    fn available_reservation(&self) -> u64 {
        self.pool.available_reservation()
    }

    fn reclaimable_bytes(&self) -> Option<u64> {
        self.pool.reclaimable_bytes()
    }

    fn maybe_reserve(&self, bytes: u64) -> ExecResult<bool> {
        let result = self.pool.maybe_reserve(bytes);
        match &result {
            Ok(true) => info!(
                "MemoryPool[{}].maybe_reserve({bytes}) returning Ok, reserved {}",
                self.name(),
                self.reserved_bytes()
            ),
            Ok(false) => info!(
                "MemoryPool[{}].maybe_reserve({bytes}) returning false",
                self.name()
            ),
            Err(e) => info!(
                "MemoryPool[{}].maybe_reserve({bytes}) returning Err: {e}",
                self.name()
            ),
        }
        result
    }

    fn release(&self) {
        info!(
            "MemoryPool[{}].release() with {} reserved",
            self.name(),
            self.reserved_bytes()
        );
        self.pool.release();
    }

    fn allocate(&self, bytes: u64) -> ExecResult<()> {
        let result = self.pool.allocate(bytes);
        if result.is_ok() {
            info!(
                "MemoryPool[{}].allocate({bytes}) returning Ok, used {}",
                self.name(),
                self.used_bytes()
            );
        } else {
            info!(
                "MemoryPool[{}].allocate({bytes}) returning Err",
                self.name()
            );
        }
        result
    }

    fn free(&self, bytes: u64) {
        info!("MemoryPool[{}].free({bytes})", self.name());
        self.pool.free(bytes);
    }

    fn grow(&self, grow_bytes: u64, reservation_bytes: u64) -> bool {
        let success = self.pool.grow(grow_bytes, reservation_bytes);
        info!(
            "MemoryPool[{}].grow({grow_bytes}, {reservation_bytes}) returning {success}",
            self.name()
        );
        success
    }

    fn shrink(&self, target_bytes: u64) -> u64 {
        let freed = self.pool.shrink(target_bytes);
        info!(
            "MemoryPool[{}].shrink({target_bytes}) freed {freed}",
            self.name()
        );
        freed
    }

    fn reclaim(
        &self,
        target_bytes: u64,
        max_wait_ms: u64,
        stats: &mut ReclaimerStats,
    ) -> ExecResult<u64> {
        let result = self.pool.reclaim(target_bytes, max_wait_ms, stats);
        info!(
            "MemoryPool[{}].reclaim({target_bytes}) returning {result:?}",
            self.name()
        );
        result
    }

    fn abort(&self, error: Arc<ExecError>) -> ExecResult<()> {
        info!("MemoryPool[{}].abort({error})", self.name());
        self.pool.abort(error)
    }

    fn aborted(&self) -> bool {
        self.pool.aborted()
    }

    fn track_usage(&self) -> bool {
        self.pool.track_usage()
    }

    fn enter_arbitration(&self) {
        self.pool.enter_arbitration()
    }

    fn leave_arbitration(&self) {
        self.pool.leave_arbitration()
    }
}
