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

//! Process-wide memory arbitration across query pools.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errors::{ExecError, ExecResult};
use crate::execution::memory_pools::config::{ArbitrationParticipantConfig, ArbitratorConfig};
use crate::execution::memory_pools::participant::{
    ArbitrationCandidate, ArbitrationOperation, ArbitrationParticipant, ReclaimOutcome,
    ScopedArbitrationParticipant,
};
use crate::execution::memory_pools::pool::{MemoryPool, MemoryPoolImpl, ReclaimerStats};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArbitratorStats {
    pub num_requests: u64,
    pub num_succeeded: u64,
    pub num_failures: u64,
    pub num_aborted: u64,
    pub reclaimed_free_bytes: u64,
    pub reclaimed_used_bytes: u64,
    pub free_capacity: u64,
    pub max_capacity: u64,
}

impl Display for ArbitratorStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "num_requests {} num_succeeded {} num_failures {} num_aborted {} \
             reclaimed_free_bytes {} reclaimed_used_bytes {} free_capacity {} max_capacity {}",
            self.num_requests,
            self.num_succeeded,
            self.num_failures,
            self.num_aborted,
            self.reclaimed_free_bytes,
            self.reclaimed_used_bytes,
            self.free_capacity,
            self.max_capacity
        )
    }
}

#[derive(Default)]
struct ArbitratorState {
    free_capacity: u64,
    participants: HashMap<String, Arc<ArbitrationParticipant>>,
}

#[derive(Default)]
struct ArbitratorCounters {
    num_requests: AtomicU64,
    num_succeeded: AtomicU64,
    num_failures: AtomicU64,
    num_aborted: AtomicU64,
    reclaimed_free_bytes: AtomicU64,
    reclaimed_used_bytes: AtomicU64,
}

/// Owns the process memory budget and moves capacity between query pools.
///
/// The state lock only guards the free capacity and the participant registry;
/// it is never held while calling into a participant or a pool.
pub struct SharedArbitrator {
    config: ArbitratorConfig,
    participant_config: Arc<ArbitrationParticipantConfig>,
    state: Mutex<ArbitratorState>,
    next_participant_id: AtomicU64,
    counters: ArbitratorCounters,
}

impl std::fmt::Debug for SharedArbitrator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArbitrator")
            .field("capacity", &self.config.capacity)
            .field("free_capacity", &self.free_capacity())
            .finish()
    }
}

impl SharedArbitrator {
    pub fn new(config: ArbitratorConfig) -> ExecResult<Arc<Self>> {
        config.participant.validate()?;
        let participant_config = Arc::new(config.participant.clone());
        Ok(Arc::new(Self {
            state: Mutex::new(ArbitratorState {
                free_capacity: config.capacity,
                participants: HashMap::new(),
            }),
            config,
            participant_config,
            next_participant_id: AtomicU64::new(0),
            counters: ArbitratorCounters::default(),
        }))
    }

    pub fn config(&self) -> &ArbitratorConfig {
        &self.config
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    pub fn free_capacity(&self) -> u64 {
        self.state.lock().free_capacity
    }

    /// Creates a query pool whose capacity is managed by this arbitrator.
    pub fn create_root_pool(
        self: &Arc<Self>,
        name: impl Into<String>,
        max_capacity: u64,
    ) -> ExecResult<Arc<MemoryPoolImpl>> {
        let pool = MemoryPoolImpl::new_root(name, max_capacity, Some(Arc::clone(self)));
        self.add_pool(&pool)?;
        Ok(pool)
    }

    /// Registers a query pool and grants it its initial capacity out of the
    /// free budget.
    pub fn add_pool(&self, pool: &Arc<MemoryPoolImpl>) -> ExecResult<()> {
        let dyn_pool: Arc<dyn MemoryPool> = Arc::clone(pool) as Arc<dyn MemoryPool>;
        let participant = ArbitrationParticipant::create(
            self.next_participant_id.fetch_add(1, Ordering::Relaxed),
            &dyn_pool,
            Arc::clone(&self.participant_config),
        )?;
        let grant = {
            let mut state = self.state.lock();
            if state.participants.contains_key(pool.name()) {
                return Err(ExecError::Internal(format!(
                    "Memory pool {} is already registered with the arbitrator",
                    pool.name()
                )));
            }
            state
                .participants
                .insert(pool.name().to_string(), Arc::clone(&participant));
            let grant = self
                .participant_config
                .initial_capacity
                .min(state.free_capacity)
                .min(participant.max_capacity());
            state.free_capacity -= grant;
            grant
        };
        if grant > 0 && !participant.grow(grant, 0) {
            self.increment_free_capacity(grant);
        }
        debug!(
            "Added memory pool {} with initial capacity {}",
            pool.name(),
            pool.capacity()
        );
        Ok(())
    }

    /// Unregisters a query pool and takes back all of its capacity.
    pub fn remove_pool(&self, name: &str) {
        let participant = self.state.lock().participants.remove(name);
        if let Some(participant) = participant {
            let freed = participant.shrink(true);
            self.increment_free_capacity(freed);
            debug!(
                "Removed memory pool {name}, freed {freed} bytes: {}",
                participant.stats()
            );
        }
    }

    /// Returns the free capacity of one query pool to the budget.
    pub fn shrink_capacity(&self, name: &str) -> u64 {
        let Some(participant) = self.participant(name) else {
            return 0;
        };
        let freed = participant.shrink(false);
        self.increment_free_capacity(freed);
        freed
    }

    pub fn participant(&self, name: &str) -> Option<Arc<ArbitrationParticipant>> {
        self.state.lock().participants.get(name).cloned()
    }

    pub fn stats(&self) -> ArbitratorStats {
        ArbitratorStats {
            num_requests: self.counters.num_requests.load(Ordering::Relaxed),
            num_succeeded: self.counters.num_succeeded.load(Ordering::Relaxed),
            num_failures: self.counters.num_failures.load(Ordering::Relaxed),
            num_aborted: self.counters.num_aborted.load(Ordering::Relaxed),
            reclaimed_free_bytes: self.counters.reclaimed_free_bytes.load(Ordering::Relaxed),
            reclaimed_used_bytes: self.counters.reclaimed_used_bytes.load(Ordering::Relaxed),
            free_capacity: self.free_capacity(),
            max_capacity: self.config.capacity,
        }
    }

    /// Grows `pool`'s capacity so that `request_bytes` more can be reserved,
    /// and reserves them. Returns false if the memory could not be found.
    pub fn grow_capacity(&self, pool: &MemoryPoolImpl, request_bytes: u64) -> ExecResult<bool> {
        self.counters.num_requests.fetch_add(1, Ordering::Relaxed);
        let participant = self.participant(pool.name()).ok_or_else(|| {
            ExecError::Internal(format!(
                "Memory pool {} is not registered with the arbitrator",
                pool.name()
            ))
        })?;
        let Some(scoped) = participant.lock() else {
            return Ok(false);
        };

        let op = ArbitrationOperation::new(request_bytes, self.config.max_arbitration_time);
        scoped.start_arbitration(&op);
        let result = self.run_arbitration(&scoped, &op);
        scoped.finish_arbitration(&op);

        match &result {
            Ok(true) => self.counters.num_succeeded.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.num_failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn run_arbitration(
        &self,
        participant: &ScopedArbitrationParticipant,
        op: &ArbitrationOperation,
    ) -> ExecResult<bool> {
        let request_bytes = op.request_bytes();
        if participant.aborted() {
            return Err(ExecError::Aborted {
                pool: participant.name().to_string(),
                reason: "memory pool has been aborted".to_string(),
            });
        }
        // Capacity may have been freed up while this operation was queued.
        if participant.pool().grow(0, request_bytes) {
            return Ok(true);
        }
        // At its own max capacity the pool can only make room by reclaiming
        // from itself.
        if !participant.check_capacity_growth(request_bytes)
            && request_bytes <= participant.max_capacity()
        {
            self.reclaim_from_requestor(participant, op)?;
            if participant.pool().grow(0, request_bytes) {
                return Ok(true);
            }
        }
        if !participant.check_capacity_growth(request_bytes) {
            warn!(
                "Can't grow {} capacity by {request_bytes} bytes which exceeds its max capacity {}, current capacity {}",
                participant.name(),
                participant.max_capacity(),
                participant.capacity()
            );
            return Ok(false);
        }
        let (max_grow_bytes, min_grow_bytes) = participant.get_grow_targets(request_bytes);
        let needed = request_bytes.max(min_grow_bytes);

        if self.grow_from_free(participant, request_bytes, needed, max_grow_bytes) {
            return Ok(true);
        }

        self.reclaim_free_capacity(participant.name(), needed);
        if self.grow_from_free(participant, request_bytes, needed, max_grow_bytes) {
            return Ok(true);
        }

        let target = needed.saturating_sub(self.free_capacity());
        self.reclaim_used_capacity(target, op)?;
        if participant.aborted() {
            return Err(ExecError::Aborted {
                pool: participant.name().to_string(),
                reason: "memory pool aborted while reclaiming".to_string(),
            });
        }
        if self.grow_from_free(participant, request_bytes, needed, max_grow_bytes) {
            return Ok(true);
        }

        if self.config.global_arbitration_abort_enabled {
            self.abort_largest(participant.name())?;
            if self.grow_from_free(participant, request_bytes, needed, max_grow_bytes) {
                return Ok(true);
            }
        }

        info!(
            "Failed to arbitrate {request_bytes} bytes for memory pool {}: {}",
            participant.name(),
            self.stats()
        );
        Ok(false)
    }

    /// Takes between `needed` and `max_grow_bytes` from the free budget and
    /// grows the participant with it.
    fn grow_from_free(
        &self,
        participant: &ScopedArbitrationParticipant,
        request_bytes: u64,
        needed: u64,
        max_grow_bytes: u64,
    ) -> bool {
        let grant = {
            let mut state = self.state.lock();
            if state.free_capacity < needed {
                return false;
            }
            let grant = state.free_capacity.min(max_grow_bytes);
            state.free_capacity -= grant;
            grant
        };
        if participant.grow(grant, request_bytes) {
            return true;
        }
        self.increment_free_capacity(grant);
        false
    }

    fn candidates(&self, free_capacity_only: bool) -> Vec<ArbitrationCandidate> {
        let participants: Vec<_> = self.state.lock().participants.values().cloned().collect();
        participants
            .iter()
            .filter_map(ArbitrationParticipant::lock)
            .map(|scoped| ArbitrationCandidate::new(scoped, free_capacity_only))
            .collect()
    }

    /// Shrinks the unused capacity of other query pools.
    fn reclaim_free_capacity(&self, requestor: &str, target_bytes: u64) -> u64 {
        let mut candidates: Vec<_> = self
            .candidates(true)
            .into_iter()
            .filter(|c| c.participant.name() != requestor && c.reclaimable_free_capacity > 0)
            .collect();
        candidates.sort_by(|a, b| b.reclaimable_free_capacity.cmp(&a.reclaimable_free_capacity));

        let mut reclaimed = 0;
        for candidate in candidates {
            if reclaimed >= target_bytes {
                break;
            }
            let freed = candidate.participant.shrink(false);
            self.increment_free_capacity(freed);
            reclaimed += freed;
        }
        self.counters
            .reclaimed_free_bytes
            .fetch_add(reclaimed, Ordering::Relaxed);
        reclaimed
    }

    /// Reclaims used memory, largest reclaimable pool first. The requestor is a
    /// candidate too.
    fn reclaim_used_capacity(&self, target_bytes: u64, op: &ArbitrationOperation) -> ExecResult<u64> {
        if target_bytes == 0 {
            return Ok(0);
        }
        let mut candidates: Vec<_> = self
            .candidates(false)
            .into_iter()
            .filter(|c| c.reclaimable_used_capacity > 0)
            .collect();
        candidates.sort_by(|a, b| b.reclaimable_used_capacity.cmp(&a.reclaimable_used_capacity));

        let mut reclaimed = 0;
        for candidate in candidates {
            if reclaimed >= target_bytes {
                break;
            }
            let timeout = op.time_remaining();
            if timeout.is_zero() {
                return Err(ExecError::ArbitrationTimeout {
                    pool: candidate.participant.name().to_string(),
                    timeout_ms: self.config.max_arbitration_time.as_millis() as u64,
                });
            }
            debug!("Reclaiming used capacity from {candidate}");
            let mut stats = ReclaimerStats::default();
            let outcome = candidate.participant.reclaim(
                target_bytes - reclaimed,
                timeout,
                &mut stats,
            );
            match outcome {
                ReclaimOutcome::TimedOut { timeout } => {
                    return Err(ExecError::ArbitrationTimeout {
                        pool: candidate.participant.name().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                ReclaimOutcome::Aborted(bytes) => {
                    self.counters.num_aborted.fetch_add(1, Ordering::Relaxed);
                    self.increment_free_capacity(bytes);
                    reclaimed += bytes;
                }
                ReclaimOutcome::Reclaimed(bytes) => {
                    self.increment_free_capacity(bytes);
                    reclaimed += bytes;
                }
            }
        }
        self.counters
            .reclaimed_used_bytes
            .fetch_add(reclaimed, Ordering::Relaxed);
        Ok(reclaimed)
    }

    /// Reclaims used memory from the requesting pool and returns the capacity
    /// that frees up to the budget.
    fn reclaim_from_requestor(
        &self,
        participant: &ScopedArbitrationParticipant,
        op: &ArbitrationOperation,
    ) -> ExecResult<u64> {
        let timeout = op.time_remaining();
        if timeout.is_zero() {
            return Err(ExecError::ArbitrationTimeout {
                pool: participant.name().to_string(),
                timeout_ms: self.config.max_arbitration_time.as_millis() as u64,
            });
        }
        debug!(
            "Reclaiming {} bytes locally from {} at capacity {}",
            op.request_bytes(),
            participant.name(),
            participant.capacity()
        );
        let mut stats = ReclaimerStats::default();
        let reclaimed = match participant.reclaim(op.request_bytes(), timeout, &mut stats) {
            ReclaimOutcome::TimedOut { timeout } => {
                return Err(ExecError::ArbitrationTimeout {
                    pool: participant.name().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            ReclaimOutcome::Aborted(bytes) => {
                self.counters.num_aborted.fetch_add(1, Ordering::Relaxed);
                self.increment_free_capacity(bytes);
                return Err(ExecError::Aborted {
                    pool: participant.name().to_string(),
                    reason: "memory pool aborted while reclaiming".to_string(),
                });
            }
            ReclaimOutcome::Reclaimed(bytes) => bytes,
        };
        self.increment_free_capacity(reclaimed);
        self.counters
            .reclaimed_used_bytes
            .fetch_add(reclaimed, Ordering::Relaxed);
        Ok(reclaimed)
    }

    /// Aborts the query pool with the largest capacity to free its memory.
    fn abort_largest(&self, requestor: &str) -> ExecResult<()> {
        let Some(victim) = self
            .candidates(true)
            .into_iter()
            .filter(|c| !c.participant.aborted())
            .max_by_key(|c| c.current_capacity)
        else {
            return Ok(());
        };
        let victim_name = victim.participant.name().to_string();
        let error = Arc::new(ExecError::Aborted {
            pool: victim_name.clone(),
            reason: format!(
                "Memory pool aborted to reclaim used memory, current capacity {}, request from {requestor}",
                victim.current_capacity
            ),
        });
        warn!("{error}");
        let freed = victim.participant.abort(Arc::clone(&error));
        self.counters.num_aborted.fetch_add(1, Ordering::Relaxed);
        self.increment_free_capacity(freed);
        if victim_name == requestor {
            return Err(ExecError::Aborted {
                pool: victim_name,
                reason: error.to_string(),
            });
        }
        Ok(())
    }

    fn increment_free_capacity(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.free_capacity += bytes;
        debug_assert!(state.free_capacity <= self.config.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::memory_pools::pool::{reclaim_children, MemoryReclaimer, MB};
    use std::time::Duration;

    fn arbitrator(capacity: u64, initial: u64, abort_enabled: bool) -> Arc<SharedArbitrator> {
        SharedArbitrator::new(ArbitratorConfig {
            capacity,
            participant: ArbitrationParticipantConfig::try_new(
                initial, 0, 0, 0.0, 0, 0.0, 0, 0.0,
            )
            .unwrap(),
            max_arbitration_time: Duration::from_secs(5),
            global_arbitration_abort_enabled: abort_enabled,
        })
        .unwrap()
    }

    /// Frees all usage of a pool's leaves when asked.
    struct FreeAllReclaimer;

    impl MemoryReclaimer for FreeAllReclaimer {
        fn reclaimable_bytes(&self, pool: &MemoryPoolImpl) -> Option<u64> {
            Some(pool.used_bytes())
        }

        fn reclaim(
            &self,
            pool: &MemoryPoolImpl,
            target_bytes: u64,
            max_wait_ms: u64,
            stats: &mut ReclaimerStats,
        ) -> ExecResult<()> {
            if pool.parent().is_none() {
                reclaim_children(pool, target_bytes, max_wait_ms, stats)?;
            } else {
                pool.free(pool.used_bytes());
            }
            Ok(())
        }

        fn abort(&self, _pool: &MemoryPoolImpl, _error: &Arc<ExecError>) -> ExecResult<()> {
            Ok(())
        }
    }

    #[test]
    fn add_and_remove_pools() {
        let arbitrator = arbitrator(64 * MB, 16 * MB, false);
        let a = arbitrator.create_root_pool("a", 64 * MB).unwrap();
        assert_eq!(a.capacity(), 16 * MB);
        assert_eq!(arbitrator.free_capacity(), 48 * MB);
        assert!(arbitrator.add_pool(&a).is_err());

        arbitrator.remove_pool("a");
        assert_eq!(arbitrator.free_capacity(), 64 * MB);
        assert_eq!(a.capacity(), 0);
    }

    #[test]
    fn grow_from_free_capacity() {
        let arbitrator = arbitrator(64 * MB, 0, false);
        let a = arbitrator.create_root_pool("a", 64 * MB).unwrap();
        let leaf = a.add_leaf_child("op", None);
        leaf.allocate(8 * MB).unwrap();
        assert_eq!(a.capacity(), 8 * MB);
        assert_eq!(a.reserved_bytes(), 8 * MB);
        assert_eq!(arbitrator.free_capacity(), 56 * MB);

        let err = leaf.allocate(60 * MB).unwrap_err();
        assert!(matches!(err, ExecError::MemoryCapExceeded { .. }));
        assert_eq!(arbitrator.stats().num_failures, 1);
    }

    #[test]
    fn grow_by_shrinking_other_pools() {
        let arbitrator = arbitrator(64 * MB, 16 * MB, false);
        let a = arbitrator.create_root_pool("a", 64 * MB).unwrap();
        let b = arbitrator.create_root_pool("b", 64 * MB).unwrap();
        let a_leaf = a.add_leaf_child("op", None);
        let b_leaf = b.add_leaf_child("op", None);

        a_leaf.allocate(24 * MB).unwrap();
        assert_eq!(a.capacity(), 40 * MB);
        assert_eq!(arbitrator.free_capacity(), 8 * MB);

        b_leaf.allocate(24 * MB).unwrap();
        assert_eq!(a.capacity(), 24 * MB);
        assert_eq!(b.capacity(), 40 * MB);
        assert_eq!(arbitrator.stats().reclaimed_free_bytes, 16 * MB);
    }

    #[test]
    fn grow_by_reclaiming_used_memory() {
        let arbitrator = arbitrator(32 * MB, 32 * MB, false);
        let a = arbitrator.create_root_pool("a", 32 * MB).unwrap();
        a.set_reclaimer(Arc::new(FreeAllReclaimer));
        let a_leaf = a.add_leaf_child("op", Some(Arc::new(FreeAllReclaimer)));
        a_leaf.allocate(32 * MB).unwrap();

        let b = arbitrator.create_root_pool("b", 32 * MB).unwrap();
        assert_eq!(b.capacity(), 0);
        let b_leaf = b.add_leaf_child("op", None);
        b_leaf.allocate(8 * MB).unwrap();

        assert_eq!(a_leaf.used_bytes(), 0);
        assert_eq!(b.capacity(), 8 * MB);
        assert_eq!(arbitrator.stats().reclaimed_used_bytes, 32 * MB);
        let participant = arbitrator.participant("a").unwrap();
        assert_eq!(participant.stats().num_reclaims, 1);
    }

    #[test]
    fn pool_at_max_capacity_reclaims_from_itself() {
        let arbitrator = arbitrator(64 * MB, 0, false);
        let a = arbitrator.create_root_pool("a", 16 * MB).unwrap();
        a.set_reclaimer(Arc::new(FreeAllReclaimer));
        let spillable = a.add_leaf_child("spillable", Some(Arc::new(FreeAllReclaimer)));
        let other = a.add_leaf_child("other", None);
        spillable.allocate(16 * MB).unwrap();
        assert_eq!(a.capacity(), 16 * MB);

        // The budget has room but the pool is capped.
        other.allocate(8 * MB).unwrap();
        assert_eq!(spillable.used_bytes(), 0);
        assert_eq!(other.used_bytes(), 8 * MB);
        assert_eq!(a.capacity(), 8 * MB);
        assert_eq!(arbitrator.free_capacity(), 56 * MB);
        assert_eq!(arbitrator.stats().reclaimed_used_bytes, 16 * MB);
        assert_eq!(arbitrator.participant("a").unwrap().stats().num_reclaims, 1);

        // Larger than the cap: nothing to reclaim for.
        let err = other.allocate(32 * MB).unwrap_err();
        assert!(matches!(err, ExecError::MemoryCapExceeded { .. }));
        assert_eq!(arbitrator.participant("a").unwrap().stats().num_reclaims, 1);
    }

    #[test]
    fn abort_largest_when_nothing_reclaimable() {
        let arbitrator = arbitrator(32 * MB, 32 * MB, true);
        let a = arbitrator.create_root_pool("a", 32 * MB).unwrap();
        // Aborting needs a reclaimer but nothing is reclaimable.
        struct AbortOnly;
        impl MemoryReclaimer for AbortOnly {
            fn reclaimable_bytes(&self, _pool: &MemoryPoolImpl) -> Option<u64> {
                None
            }
            fn reclaim(
                &self,
                _pool: &MemoryPoolImpl,
                _target_bytes: u64,
                _max_wait_ms: u64,
                _stats: &mut ReclaimerStats,
            ) -> ExecResult<()> {
                Ok(())
            }
            fn abort(&self, _pool: &MemoryPoolImpl, _error: &Arc<ExecError>) -> ExecResult<()> {
                Ok(())
            }
        }
        a.set_reclaimer(Arc::new(AbortOnly));
        let a_leaf = a.add_leaf_child("op", None);
        a_leaf.allocate(32 * MB).unwrap();

        let b = arbitrator.create_root_pool("b", 32 * MB).unwrap();
        let b_leaf = b.add_leaf_child("op", None);
        // a still holds its reservation, so only its free capacity comes back.
        assert!(b_leaf.allocate(8 * MB).is_err());
        assert!(a.aborted());
        assert!(matches!(a_leaf.allocate(1), Err(ExecError::Aborted { .. })));
        assert_eq!(arbitrator.stats().num_aborted, 1);

        a_leaf.free(32 * MB);
        assert_eq!(arbitrator.shrink_capacity("a"), 32 * MB);
        b_leaf.allocate(8 * MB).unwrap();
        assert_eq!(b.capacity(), 8 * MB);
    }

    #[test]
    fn concurrent_growth() {
        let arbitrator = arbitrator(256 * MB, 0, false);
        let pools: Vec<_> = (0..8)
            .map(|i| arbitrator.create_root_pool(format!("q{i}"), 64 * MB).unwrap())
            .collect();
        std::thread::scope(|s| {
            for pool in &pools {
                s.spawn(move || {
                    let leaf = pool.add_leaf_child("op", None);
                    for _ in 0..16 {
                        leaf.allocate(MB).unwrap();
                    }
                    assert_eq!(leaf.used_bytes(), 16 * MB);
                    leaf.free(16 * MB);
                });
            }
        });
        let total: u64 = pools.iter().map(|p| p.capacity()).sum();
        assert_eq!(total + arbitrator.free_capacity(), 256 * MB);
        for pool in &pools {
            assert_eq!(pool.reserved_bytes(), 0);
        }
    }
}
