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

//! Operators

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arrow::array::RecordBatch;

use crate::errors::{ExecError, ExecResult};
use crate::execution::future::ContinueFuture;
use crate::execution::memory_pools::{MemoryPoolImpl, MemoryReclaimer, ReclaimerStats};

mod values;
pub use values::{CollectSink, CollectedBatches, ValuesSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingReason {
    NotBlocked,
    WaitForJoinBuild,
    WaitForJoinProbe,
    Yield,
}

impl Display for BlockingReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockingReason::NotBlocked => "NotBlocked",
            BlockingReason::WaitForJoinBuild => "WaitForJoinBuild",
            BlockingReason::WaitForJoinProbe => "WaitForJoinProbe",
            BlockingReason::Yield => "Yield",
        };
        write!(f, "{name}")
    }
}

/// A push based operator driven by a [`crate::execution::driver::Driver`].
///
/// A driver moves batches from each operator to the next one. An operator
/// that can't make progress returns a future from [`Operator::is_blocked`];
/// the driver parks on it off the task's thread count, so the task can be
/// paused while it waits.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn plan_node_id(&self) -> &str;

    fn needs_input(&self) -> bool;

    fn add_input(&mut self, batch: RecordBatch) -> ExecResult<()>;

    /// Called once after the last `add_input`.
    fn no_more_input(&mut self) -> ExecResult<()>;

    fn get_output(&mut self) -> ExecResult<Option<RecordBatch>>;

    fn is_blocked(&mut self) -> ExecResult<(BlockingReason, Option<ContinueFuture>)>;

    fn is_finished(&self) -> bool;

    fn close(&mut self) {}
}

/// Creates the operator for one driver of a pipeline.
pub type OperatorFactory = Box<
    dyn Fn(&crate::execution::driver::DriverCtx) -> ExecResult<Box<dyn Operator>> + Send + Sync,
>;

// ---------------------------------------------------------------------------
// Reclaim support
// ---------------------------------------------------------------------------

/// Operator side of memory reclaim. Operators of one plan node reach each
/// other through the task's registry, which hands out this trait.
pub trait ReclaimableOperator: Send + Sync {
    fn operator_name(&self) -> &str;

    /// Whether the operator is able to free memory at all.
    fn can_reclaim(&self) -> bool;

    /// True while the operator can't be reclaimed from right now.
    fn non_reclaimable_state(&self) -> bool;

    fn reclaimable_bytes(&self) -> u64;

    /// Frees memory, possibly together with its peers. Only called while the
    /// owning task is paused.
    fn reclaim(&self, target_bytes: u64, stats: &mut ReclaimerStats) -> ExecResult<()>;

    /// Spills all in-memory state. Part of a gang reclaim started by a peer.
    fn spill(&self) -> ExecResult<()>;

    /// Drops the spilled in-memory state and releases the reservation.
    fn clear_spilled(&self);

    /// Fails the operator. Must not wait for the operator's driver.
    fn abort(&self, error: &Arc<ExecError>);
}

/// Adapts a [`ReclaimableOperator`] to the reclaimer interface of its leaf
/// pool. The pool must not keep the operator alive.
pub struct OperatorReclaimer {
    operator: Weak<dyn ReclaimableOperator>,
}

impl OperatorReclaimer {
    pub fn new(operator: Weak<dyn ReclaimableOperator>) -> Arc<Self> {
        Arc::new(Self { operator })
    }
}

impl MemoryReclaimer for OperatorReclaimer {
    fn reclaimable_bytes(&self, _pool: &MemoryPoolImpl) -> Option<u64> {
        let operator = self.operator.upgrade()?;
        if !operator.can_reclaim() {
            return None;
        }
        Some(operator.reclaimable_bytes())
    }

    fn reclaim(
        &self,
        _pool: &MemoryPoolImpl,
        target_bytes: u64,
        _max_wait_ms: u64,
        stats: &mut ReclaimerStats,
    ) -> ExecResult<()> {
        match self.operator.upgrade() {
            Some(operator) => operator.reclaim(target_bytes, stats),
            None => Ok(()),
        }
    }

    fn abort(&self, _pool: &MemoryPoolImpl, error: &Arc<ExecError>) -> ExecResult<()> {
        if let Some(operator) = self.operator.upgrade() {
            operator.abort(error);
        }
        Ok(())
    }
}

/// Marks an operator non-reclaimable for the guard's lifetime.
pub struct NonReclaimableSectionGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> NonReclaimableSectionGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Self {
        let previous = flag.swap(true, Ordering::AcqRel);
        Self { flag, previous }
    }
}

impl Drop for NonReclaimableSectionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::Release);
    }
}

/// Opens a reclaimable window inside a non-reclaimable section, typically
/// around a reservation that may trigger arbitration.
pub struct ReclaimableSectionGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> ReclaimableSectionGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Self {
        let previous = flag.swap(false, Ordering::AcqRel);
        Self { flag, previous }
    }
}

impl Drop for ReclaimableSectionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_guards_nest() {
        let flag = AtomicBool::new(false);
        {
            let _outer = NonReclaimableSectionGuard::new(&flag);
            assert!(flag.load(Ordering::Acquire));
            {
                let _inner = ReclaimableSectionGuard::new(&flag);
                assert!(!flag.load(Ordering::Acquire));
            }
            assert!(flag.load(Ordering::Acquire));
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
