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

//! A query pool as seen by the arbitrator.
//!
//! [`ArbitrationParticipant`] serializes the arbitration operations issued on
//! behalf of one query pool, computes how much that pool may grow or give back,
//! and performs the actual grow, shrink, reclaim and abort calls on the pool.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::errors::{ExecError, ExecResult};
use crate::execution::future::{make_continue_future, ContinuePromise};
use crate::execution::memory_pools::config::ArbitrationParticipantConfig;
use crate::execution::memory_pools::pool::{MemoryPool, ReclaimerStats};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Init,
    Waiting,
    Running,
    Finished,
}

/// One capacity growth request being arbitrated for a participant.
#[derive(Debug)]
pub struct ArbitrationOperation {
    id: u64,
    request_bytes: u64,
    max_arbitration_time: Duration,
    state: Mutex<OperationState>,
    created: Instant,
}

impl ArbitrationOperation {
    pub fn new(request_bytes: u64, max_arbitration_time: Duration) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            request_bytes,
            max_arbitration_time,
            state: Mutex::new(OperationState::Init),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request_bytes(&self) -> u64 {
        self.request_bytes
    }

    pub fn state(&self) -> OperationState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: OperationState) {
        *self.state.lock() = state;
    }

    /// Time left before the operation should give up.
    pub fn time_remaining(&self) -> Duration {
        self.max_arbitration_time
            .saturating_sub(self.created.elapsed())
    }

    pub fn has_timed_out(&self) -> bool {
        self.time_remaining().is_zero()
    }
}

/// Result of [`ArbitrationParticipant::reclaim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Capacity given back after reclaiming.
    Reclaimed(u64),
    /// Reclaim failed and the participant was aborted, freeing this much.
    Aborted(u64),
    /// The reclaim lock could not be acquired in time. Nothing was touched.
    TimedOut { timeout: Duration },
}

impl ReclaimOutcome {
    pub fn reclaimed_bytes(&self) -> u64 {
        match self {
            ReclaimOutcome::Reclaimed(bytes) | ReclaimOutcome::Aborted(bytes) => *bytes,
            ReclaimOutcome::TimedOut { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantStats {
    pub num_requests: u64,
    pub num_reclaims: u64,
    pub num_shrinks: u64,
    pub num_grows: u64,
    pub reclaimed_bytes: u64,
    pub grow_bytes: u64,
    pub aborted: bool,
    pub duration: Duration,
}

impl Display for ParticipantStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "num_requests: {}, num_reclaims: {}, num_shrinks: {}, num_grows: {}, \
             reclaimed_bytes: {}, grow_bytes: {}, aborted: {}, duration: {:?}",
            self.num_requests,
            self.num_reclaims,
            self.num_shrinks,
            self.num_grows,
            self.reclaimed_bytes,
            self.grow_bytes,
            self.aborted,
            self.duration
        )
    }
}

struct WaitOp {
    op_id: u64,
    promise: ContinuePromise,
}

#[derive(Default)]
struct ParticipantState {
    running_op: Option<u64>,
    wait_ops: VecDeque<WaitOp>,
    num_requests: u64,
    num_shrinks: u64,
    num_grows: u64,
    reclaimed_bytes: u64,
    grow_bytes: u64,
    aborted: bool,
}

pub struct ArbitrationParticipant {
    id: u64,
    name: String,
    pool: Weak<dyn MemoryPool>,
    config: Arc<ArbitrationParticipantConfig>,
    max_capacity: u64,
    created: Instant,
    state: Mutex<ParticipantState>,
    /// Serializes reclaim and abort.
    reclaim_mutex: Mutex<()>,
    num_reclaims: AtomicU64,
}

impl std::fmt::Debug for ArbitrationParticipant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitrationParticipant")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

impl ArbitrationParticipant {
    pub fn create(
        id: u64,
        pool: &Arc<dyn MemoryPool>,
        config: Arc<ArbitrationParticipantConfig>,
    ) -> ExecResult<Arc<Self>> {
        let max_capacity = pool.max_capacity();
        if config.min_capacity > max_capacity {
            return Err(ExecError::Config(format!(
                "The min capacity {} is larger than the max capacity {max_capacity} for memory pool {}",
                config.min_capacity,
                pool.name()
            )));
        }
        Ok(Arc::new(Self {
            id,
            name: pool.name().to_string(),
            pool: Arc::downgrade(pool),
            config,
            max_capacity,
            created: Instant::now(),
            state: Mutex::new(ParticipantState::default()),
            reclaim_mutex: Mutex::new(()),
            num_reclaims: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ArbitrationParticipantConfig {
        &self.config
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Pins the pool for the duration of an arbitration step. Returns `None`
    /// once the pool has been dropped.
    pub fn lock(self: &Arc<Self>) -> Option<ScopedArbitrationParticipant> {
        let pool = self.pool.upgrade()?;
        Some(ScopedArbitrationParticipant {
            participant: Arc::clone(self),
            pool,
        })
    }

    fn pool(&self) -> Option<Arc<dyn MemoryPool>> {
        self.pool.upgrade()
    }

    pub fn capacity(&self) -> u64 {
        self.pool().map_or(0, |pool| pool.capacity())
    }

    pub fn max_grow_capacity(&self) -> u64 {
        let capacity = self.capacity();
        assert!(
            capacity <= self.max_capacity,
            "capacity {capacity} of {} exceeds max capacity {}",
            self.name,
            self.max_capacity
        );
        self.max_capacity - capacity
    }

    pub fn min_grow_capacity(&self) -> u64 {
        self.config.min_capacity.saturating_sub(self.capacity())
    }

    /// A pool that reserved memory before but holds none now. Its min
    /// capacity and free capacity floors no longer apply.
    fn inactive_pool(pool: &dyn MemoryPool) -> bool {
        pool.reserved_bytes() == 0 && pool.peak_bytes() != 0
    }

    pub fn max_reclaimable_capacity(&self) -> u64 {
        let Some(pool) = self.pool() else {
            return 0;
        };
        if Self::inactive_pool(pool.as_ref()) {
            return pool.capacity();
        }
        pool.capacity().saturating_sub(self.config.min_capacity)
    }

    pub fn max_shrink_capacity(&self) -> u64 {
        let Some(pool) = self.pool() else {
            return 0;
        };
        let capacity = pool.capacity();
        let free_bytes = pool.free_bytes();
        if self.config.min_free_capacity != 0 && !Self::inactive_pool(pool.as_ref()) {
            let min_free_bytes = ((capacity as f64 * self.config.min_free_capacity_ratio) as u64)
                .min(self.config.min_free_capacity);
            free_bytes.saturating_sub(min_free_bytes)
        } else {
            free_bytes
        }
    }

    pub fn reclaimable_free_capacity(&self) -> u64 {
        self.max_shrink_capacity()
            .min(self.max_reclaimable_capacity())
    }

    pub fn reclaimable_used_capacity(&self) -> u64 {
        let reclaimable = self
            .pool()
            .and_then(|pool| pool.reclaimable_bytes())
            .unwrap_or(0);
        self.max_reclaimable_capacity().min(reclaimable)
    }

    pub fn check_capacity_growth(&self, request_bytes: u64) -> bool {
        self.max_grow_capacity() >= request_bytes
    }

    /// Returns `(max_grow_bytes, min_grow_bytes)` for a request. The caller
    /// must have checked the request with [`Self::check_capacity_growth`].
    pub fn get_grow_targets(&self, request_bytes: u64) -> (u64, u64) {
        let capacity = self.capacity();
        let mut max_grow_bytes = if self.config.fast_exponential_growth_capacity_limit == 0
            && self.config.slow_capacity_grow_ratio == 0.0
        {
            request_bytes
        } else if capacity * 2 <= self.config.fast_exponential_growth_capacity_limit {
            capacity
        } else {
            (capacity as f64 * self.config.slow_capacity_grow_ratio) as u64
        };
        max_grow_bytes = max_grow_bytes.max(request_bytes);
        let min_grow_bytes = self.min_grow_capacity();
        max_grow_bytes = max_grow_bytes.max(min_grow_bytes);
        max_grow_bytes = max_grow_bytes.min(self.max_grow_capacity());

        assert!(
            min_grow_bytes <= max_grow_bytes,
            "min grow bytes {min_grow_bytes} exceeds max grow bytes {max_grow_bytes} for {}",
            self.name
        );
        assert!(
            request_bytes <= max_grow_bytes,
            "request bytes {request_bytes} exceeds max grow bytes {max_grow_bytes} for {}",
            self.name
        );
        (max_grow_bytes, min_grow_bytes)
    }

    /// Admits `op` as the running operation, blocking the calling thread
    /// behind earlier operations until they finish.
    pub fn start_arbitration(&self, op: &ArbitrationOperation) {
        let wait_future = {
            let mut state = self.state.lock();
            state.num_requests += 1;
            if state.running_op.is_some() {
                op.set_state(OperationState::Waiting);
                let (promise, future) = make_continue_future("wait for arbitration");
                state.wait_ops.push_back(WaitOp {
                    op_id: op.id(),
                    promise,
                });
                Some(future)
            } else {
                state.running_op = Some(op.id());
                None
            }
        };
        if let Some(future) = wait_future {
            future.wait();
        }
        op.set_state(OperationState::Running);
    }

    /// Hands the participant to the oldest waiter, if any.
    pub fn finish_arbitration(&self, op: &ArbitrationOperation) {
        let resume = {
            let mut state = self.state.lock();
            assert_eq!(
                state.running_op,
                Some(op.id()),
                "operation {} is not running on {}",
                op.id(),
                self.name
            );
            match state.wait_ops.pop_front() {
                Some(next) => {
                    state.running_op = Some(next.op_id);
                    Some(next.promise)
                }
                None => {
                    state.running_op = None;
                    None
                }
            }
        };
        op.set_state(OperationState::Finished);
        if let Some(promise) = resume {
            promise.set_value();
        }
    }

    pub fn has_running_op(&self) -> bool {
        self.state.lock().running_op.is_some()
    }

    pub fn num_waiting_ops(&self) -> usize {
        self.state.lock().wait_ops.len()
    }

    /// Reclaims memory from the pool and shrinks away what was freed. Never
    /// fails: any error or panic while reclaiming aborts the participant.
    pub fn reclaim(
        &self,
        target_bytes: u64,
        max_wait: Duration,
        stats: &mut ReclaimerStats,
    ) -> ReclaimOutcome {
        let min_reclaim_bytes = self
            .config
            .min_reclaim_bytes
            .max((self.capacity() as f64 * self.config.min_reclaim_pct) as u64);
        let target_bytes = target_bytes.max(min_reclaim_bytes);
        if target_bytes == 0 {
            return ReclaimOutcome::Reclaimed(0);
        }

        #[cfg(feature = "tsan")]
        let _guard = self.reclaim_mutex.lock();
        #[cfg(not(feature = "tsan"))]
        let Some(_guard) = self.reclaim_mutex.try_lock_for(max_wait) else {
            warn!(
                "Timed out after {max_wait:?} waiting to reclaim from memory pool {}",
                self.name
            );
            return ReclaimOutcome::TimedOut { timeout: max_wait };
        };

        self.num_reclaims.fetch_add(1, Ordering::Relaxed);
        let Some(pool) = self.pool() else {
            return ReclaimOutcome::Reclaimed(0);
        };
        info!(
            "Reclaiming from memory pool {} with target {target_bytes}",
            self.name
        );
        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.reclaim(target_bytes, max_wait.as_millis() as u64, stats)
        }))
        .unwrap_or_else(|payload| Err(ExecError::from(payload)));
        match result {
            Ok(reclaimed_bytes) => {
                let reclaimed_capacity = self.shrink(false);
                info!(
                    "Reclaimed from memory pool {} reserved memory {reclaimed_bytes}, capacity {reclaimed_capacity}",
                    self.name
                );
                ReclaimOutcome::Reclaimed(reclaimed_capacity)
            }
            Err(e) => {
                error!(
                    "Failed to reclaim from memory pool {}, aborting it: {e}",
                    self.name
                );
                ReclaimOutcome::Aborted(self.abort_locked(pool.as_ref(), Arc::new(e)))
            }
        }
    }

    pub fn grow(&self, grow_bytes: u64, reservation_bytes: u64) -> bool {
        let mut state = self.state.lock();
        state.num_grows += 1;
        let Some(pool) = self.pool() else {
            return false;
        };
        let success = pool.grow(grow_bytes, reservation_bytes);
        if success {
            state.grow_bytes += grow_bytes;
        }
        success
    }

    /// Gives free capacity back. With `reclaim_all` every free byte goes,
    /// otherwise only what [`Self::reclaimable_free_capacity`] allows.
    pub fn shrink(&self, reclaim_all: bool) -> u64 {
        let mut state = self.state.lock();
        self.shrink_locked(&mut state, reclaim_all)
    }

    fn shrink_locked(&self, state: &mut ParticipantState, reclaim_all: bool) -> u64 {
        state.num_shrinks += 1;
        let Some(pool) = self.pool() else {
            return 0;
        };
        let reclaimed_bytes = if reclaim_all {
            pool.shrink(0)
        } else {
            match self.reclaimable_free_capacity() {
                0 => 0,
                target => pool.shrink(target),
            }
        };
        state.reclaimed_bytes += reclaimed_bytes;
        reclaimed_bytes
    }

    /// Aborts the pool and returns all of its capacity. A second call is a
    /// no-op returning 0.
    pub fn abort(&self, error: Arc<ExecError>) -> u64 {
        let _guard = self.reclaim_mutex.lock();
        match self.pool() {
            Some(pool) => self.abort_locked(pool.as_ref(), error),
            None => 0,
        }
    }

    fn abort_locked(&self, pool: &dyn MemoryPool, error: Arc<ExecError>) -> u64 {
        {
            let mut state = self.state.lock();
            if state.aborted {
                return 0;
            }
            state.aborted = true;
        }
        warn!("Memory pool {} is being aborted", self.name);
        let result = catch_unwind(AssertUnwindSafe(|| pool.abort(error)))
            .unwrap_or_else(|payload| Err(ExecError::from(payload)));
        if let Err(e) = result {
            warn!("Failed to abort memory pool {pool:?}, error: {e}");
        }
        warn!("Memory pool {} aborted", self.name);

        let mut state = self.state.lock();
        self.shrink_locked(&mut state, true)
    }

    pub fn aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn stats(&self) -> ParticipantStats {
        let state = self.state.lock();
        ParticipantStats {
            num_requests: state.num_requests,
            num_reclaims: self.num_reclaims.load(Ordering::Relaxed),
            num_shrinks: state.num_shrinks,
            num_grows: state.num_grows,
            reclaimed_bytes: state.reclaimed_bytes,
            grow_bytes: state.grow_bytes,
            aborted: state.aborted,
            duration: self.created.elapsed(),
        }
    }
}

impl Drop for ArbitrationParticipant {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.running_op.is_some() || !state.wait_ops.is_empty() {
            error!(
                "Arbitration participant {} dropped with a running operation or {} waiting operations",
                self.name,
                state.wait_ops.len()
            );
            if !std::thread::panicking() {
                assert!(
                    state.running_op.is_none(),
                    "arbitration participant {} dropped with a running operation",
                    self.name
                );
                assert!(
                    state.wait_ops.is_empty(),
                    "arbitration participant {} dropped with {} waiting operations",
                    self.name,
                    state.wait_ops.len()
                );
            }
        }
    }
}

/// A participant together with a strong reference to its pool, which keeps the
/// pool alive while the arbitrator works on it.
#[derive(Clone)]
pub struct ScopedArbitrationParticipant {
    participant: Arc<ArbitrationParticipant>,
    pool: Arc<dyn MemoryPool>,
}

impl ScopedArbitrationParticipant {
    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pool
    }

    pub fn participant(&self) -> &Arc<ArbitrationParticipant> {
        &self.participant
    }
}

impl Deref for ScopedArbitrationParticipant {
    type Target = ArbitrationParticipant;

    fn deref(&self) -> &Self::Target {
        &self.participant
    }
}

/// Snapshot of a participant's reclaimable capacity taken when choosing whom
/// to reclaim from.
#[derive(Clone)]
pub struct ArbitrationCandidate {
    pub participant: ScopedArbitrationParticipant,
    pub current_capacity: u64,
    pub reclaimable_used_capacity: u64,
    pub reclaimable_free_capacity: u64,
}

impl ArbitrationCandidate {
    pub fn new(participant: ScopedArbitrationParticipant, free_capacity_only: bool) -> Self {
        let current_capacity = participant.capacity();
        let reclaimable_used_capacity = if free_capacity_only {
            0
        } else {
            participant.reclaimable_used_capacity()
        };
        let reclaimable_free_capacity = participant.reclaimable_free_capacity();
        Self {
            participant,
            current_capacity,
            reclaimable_used_capacity,
            reclaimable_free_capacity,
        }
    }
}

impl Display for ArbitrationCandidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} RECLAIMABLE_USED_CAPACITY {} RECLAIMABLE_FREE_CAPACITY {}",
            self.participant.name(),
            self.reclaimable_used_capacity,
            self.reclaimable_free_capacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::memory_pools::pool::{
        MemoryPoolImpl, MemoryPoolKind, MemoryReclaimer, MB,
    };
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    fn config(min_capacity: u64) -> Arc<ArbitrationParticipantConfig> {
        Arc::new(
            ArbitrationParticipantConfig::try_new(
                0,
                min_capacity,
                64 * MB,
                0.25,
                0,
                0.0,
                0,
                0.0,
            )
            .unwrap(),
        )
    }

    fn root_pool(max_capacity: u64) -> Arc<dyn MemoryPool> {
        MemoryPoolImpl::new_root("query", max_capacity, None)
    }

    #[test]
    fn create_checks_min_capacity() {
        let pool = root_pool(16 * MB);
        assert!(ArbitrationParticipant::create(0, &pool, config(32 * MB)).is_err());
        let participant = ArbitrationParticipant::create(0, &pool, config(8 * MB)).unwrap();
        assert_eq!(participant.name(), "query");
        assert!(participant.lock().is_some());
        drop(pool);
        assert!(participant.lock().is_none());
    }

    #[test]
    fn fifo_admission() {
        let pool = root_pool(16 * MB);
        let participant = ArbitrationParticipant::create(0, &pool, config(0)).unwrap();
        let first = ArbitrationOperation::new(MB, Duration::from_secs(10));
        participant.start_arbitration(&first);
        assert!(participant.has_running_op());

        let (sender, receiver) = mpsc::channel();
        let num_waiters = 4;
        std::thread::scope(|s| {
            for i in 0..num_waiters {
                let participant = &participant;
                let sender = sender.clone();
                s.spawn(move || {
                    let op = ArbitrationOperation::new(MB, Duration::from_secs(10));
                    participant.start_arbitration(&op);
                    sender.send(i).unwrap();
                    participant.finish_arbitration(&op);
                });
                // Enqueue in a known order.
                while participant.num_waiting_ops() != i + 1 {
                    std::thread::yield_now();
                }
            }
            assert_eq!(participant.num_waiting_ops(), num_waiters);
            participant.finish_arbitration(&first);
        });
        let order: Vec<usize> = receiver.try_iter().collect();
        assert_eq!(order, (0..num_waiters).collect::<Vec<_>>());
        assert!(!participant.has_running_op());
        assert_eq!(participant.num_waiting_ops(), 0);
        assert_eq!(participant.stats().num_requests, num_waiters as u64 + 1);
    }

    #[test]
    fn one_running_operation_at_a_time() {
        let pool = root_pool(16 * MB);
        let participant = ArbitrationParticipant::create(0, &pool, config(0)).unwrap();
        let running = AtomicBool::new(false);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let op = ArbitrationOperation::new(MB, Duration::from_secs(10));
                        participant.start_arbitration(&op);
                        assert!(!running.swap(true, Ordering::SeqCst));
                        running.store(false, Ordering::SeqCst);
                        participant.finish_arbitration(&op);
                    }
                });
            }
        });
        assert!(!participant.has_running_op());
        assert_eq!(participant.num_waiting_ops(), 0);
    }

    #[test]
    #[should_panic(expected = "is not running")]
    fn finish_requires_running_operation() {
        let pool = root_pool(16 * MB);
        let participant = ArbitrationParticipant::create(0, &pool, config(0)).unwrap();
        let op = ArbitrationOperation::new(MB, Duration::from_secs(10));
        participant.finish_arbitration(&op);
    }

    #[test]
    #[should_panic(expected = "dropped with a running operation")]
    fn drop_with_running_operation() {
        let pool = root_pool(16 * MB);
        let participant = ArbitrationParticipant::create(0, &pool, config(0)).unwrap();
        let op = ArbitrationOperation::new(MB, Duration::from_secs(10));
        participant.start_arbitration(&op);
        drop(participant);
    }

    #[test]
    fn grow_targets_within_bounds() {
        let pool = MemoryPoolImpl::new_root("query", 256 * MB, None);
        pool.shrink(0);
        let dyn_pool = Arc::clone(&pool) as Arc<dyn MemoryPool>;
        let participant = ArbitrationParticipant::create(0, &dyn_pool, config(8 * MB)).unwrap();
        for capacity_step in [0, MB, 4 * MB, 16 * MB, 40 * MB, 100 * MB, 200 * MB] {
            pool.shrink(0);
            assert!(pool.grow(capacity_step, 0));
            for request in [0, 1, MB, 3 * MB, 10 * MB, 50 * MB] {
                if !participant.check_capacity_growth(request) {
                    continue;
                }
                let (max, min) = participant.get_grow_targets(request);
                assert!(min <= max, "capacity {capacity_step} request {request}");
                assert!(max <= participant.max_grow_capacity());
                assert!(max >= request);
            }
        }
        pool.shrink(0);
        assert!(pool.grow(16 * MB, 0));
        // Doubling while under the fast growth limit.
        assert_eq!(participant.get_grow_targets(MB), (16 * MB, 0));
        pool.shrink(0);
        assert!(pool.grow(100 * MB, 0));
        assert_eq!(participant.get_grow_targets(MB), (25 * MB, 0));
    }

    #[test]
    fn shrink_respects_min_free_capacity() {
        let pool = MemoryPoolImpl::new_root("query", 64 * MB, None);
        let dyn_pool = Arc::clone(&pool) as Arc<dyn MemoryPool>;
        let config = Arc::new(
            ArbitrationParticipantConfig::try_new(0, 0, 0, 0.0, 8 * MB, 0.25, 0, 0.0).unwrap(),
        );
        let participant = ArbitrationParticipant::create(0, &dyn_pool, config).unwrap();
        let leaf = pool.add_leaf_child("op", None);
        leaf.allocate(16 * MB).unwrap();
        // free 48MB, floor min(64MB * 0.25, 8MB) = 8MB
        assert_eq!(participant.max_shrink_capacity(), 40 * MB);
        assert_eq!(participant.shrink(false), 40 * MB);
        assert_eq!(pool.capacity(), 24 * MB);

        leaf.free(16 * MB);
        // Inactive pools give everything back.
        assert_eq!(participant.max_reclaimable_capacity(), 24 * MB);
        assert_eq!(participant.reclaimable_free_capacity(), 24 * MB);
    }

    struct FailingReclaimer {
        panic: bool,
    }

    impl MemoryReclaimer for FailingReclaimer {
        fn reclaimable_bytes(&self, _pool: &MemoryPoolImpl) -> Option<u64> {
            Some(MB)
        }

        fn reclaim(
            &self,
            _pool: &MemoryPoolImpl,
            _target_bytes: u64,
            _max_wait_ms: u64,
            _stats: &mut ReclaimerStats,
        ) -> ExecResult<()> {
            if self.panic {
                panic!("reclaim exploded");
            }
            Err(ExecError::Spill("disk full".to_string()))
        }

        fn abort(&self, _pool: &MemoryPoolImpl, _error: &Arc<ExecError>) -> ExecResult<()> {
            Err(ExecError::Internal("abort failed".to_string()))
        }
    }

    fn failing_participant(panic: bool) -> (Arc<MemoryPoolImpl>, Arc<ArbitrationParticipant>) {
        let pool = MemoryPoolImpl::new_root("query", 8 * MB, None);
        pool.set_reclaimer(Arc::new(FailingReclaimer { panic }));
        let dyn_pool = Arc::clone(&pool) as Arc<dyn MemoryPool>;
        let participant = ArbitrationParticipant::create(0, &dyn_pool, config(0)).unwrap();
        (pool, participant)
    }

    #[test]
    fn reclaim_failure_aborts() {
        for panic in [false, true] {
            let (pool, participant) = failing_participant(panic);
            let mut stats = ReclaimerStats::default();
            let outcome = participant.reclaim(MB, Duration::from_secs(1), &mut stats);
            assert_eq!(outcome, ReclaimOutcome::Aborted(8 * MB));
            assert!(participant.aborted());
            assert!(pool.aborted());
            assert_eq!(pool.capacity(), 0);
            assert!(participant.stats().aborted);
        }
    }

    #[test]
    fn abort_is_idempotent() {
        let (pool, participant) = failing_participant(false);
        let error = Arc::new(ExecError::Internal("test".to_string()));
        assert_eq!(participant.abort(Arc::clone(&error)), 8 * MB);
        assert_eq!(participant.abort(error), 0);
        assert!(pool.aborted());
        assert_eq!(pool.kind(), MemoryPoolKind::Root);
    }

    #[test]
    fn reclaim_target_floor() {
        let (_pool, participant) = failing_participant(false);
        let mut stats = ReclaimerStats::default();
        // No floor configured: a zero target is a no-op.
        assert_eq!(
            participant.reclaim(0, Duration::from_secs(1), &mut stats),
            ReclaimOutcome::Reclaimed(0)
        );
        assert!(!participant.aborted());
        assert_eq!(participant.stats().num_reclaims, 0);
        assert_eq!(participant.stats().num_shrinks, 0);

        let pool = MemoryPoolImpl::new_root("floored", 8 * MB, None);
        let dyn_pool = Arc::clone(&pool) as Arc<dyn MemoryPool>;
        let config = Arc::new(
            ArbitrationParticipantConfig::try_new(0, 0, 0, 0.0, 0, 0.0, 2 * MB, 0.0).unwrap(),
        );
        let participant = ArbitrationParticipant::create(1, &dyn_pool, config).unwrap();
        // Raised to the floor, so a zero target still reclaims.
        let outcome = participant.reclaim(0, Duration::from_secs(1), &mut stats);
        assert_eq!(outcome, ReclaimOutcome::Reclaimed(8 * MB));
        assert_eq!(participant.stats().num_reclaims, 1);
    }

    #[cfg(not(feature = "tsan"))]
    #[test]
    fn reclaim_times_out_behind_abort_lock() {
        let (pool, participant) = failing_participant(false);
        let guard = participant.reclaim_mutex.lock();
        let mut stats = ReclaimerStats::default();
        let outcome = participant.reclaim(MB, Duration::from_millis(10), &mut stats);
        drop(guard);
        assert_eq!(
            outcome,
            ReclaimOutcome::TimedOut {
                timeout: Duration::from_millis(10)
            }
        );
        assert!(!participant.aborted());
        assert_eq!(pool.capacity(), 8 * MB);
    }
}
