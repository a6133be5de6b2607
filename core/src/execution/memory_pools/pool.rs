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

//! Hierarchical memory pools.
//!
//! A query owns one root pool whose capacity is granted by the
//! [`SharedArbitrator`]. Each operator allocates from its own leaf pool. Leaf
//! reservations are carved out of the root's capacity in quantized steps; when
//! the root runs out, it asks the arbitrator for more, which may in turn reclaim
//! memory from this or other queries.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::errors::{ExecError, ExecResult};
use crate::execution::memory_pools::arbitrator::SharedArbitrator;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;

/// Rounds a reservation up so that small allocations do not hit the root pool
/// (and the arbitrator) one at a time.
pub fn quantized_size(size: u64) -> u64 {
    let quantum = if size < 16 * MB {
        MB
    } else if size < 64 * MB {
        4 * MB
    } else {
        8 * MB
    };
    size.div_ceil(quantum) * quantum
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPoolKind {
    /// Query-level pool whose capacity is managed by the arbitrator.
    Root,
    /// Operator-level pool that allocates from its root.
    Leaf,
}

/// Counters collected while reclaiming memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimerStats {
    /// Reclaims refused because the operator was in a non-reclaimable state.
    pub num_non_reclaimable_attempts: u64,
    pub reclaim_exec_time_us: u64,
    pub reclaimed_bytes: u64,
}

/// Callback interface through which a pool frees memory on request.
pub trait MemoryReclaimer: Send + Sync {
    /// Called on the requesting thread before it may block in arbitration.
    fn enter_arbitration(&self) {}

    /// Called on the requesting thread once arbitration is done.
    fn leave_arbitration(&self) {}

    /// Bytes that [`Self::reclaim`] could free, or `None` if the pool can't reclaim.
    fn reclaimable_bytes(&self, pool: &MemoryPoolImpl) -> Option<u64>;

    /// Frees up to (at least, if possible) `target_bytes`. Returns after the
    /// memory has been released back to the pool.
    fn reclaim(
        &self,
        pool: &MemoryPoolImpl,
        target_bytes: u64,
        max_wait_ms: u64,
        stats: &mut ReclaimerStats,
    ) -> ExecResult<()>;

    /// Fails the owner of the pool. Must not block on the owner's progress.
    fn abort(&self, pool: &MemoryPoolImpl, error: &Arc<ExecError>) -> ExecResult<()>;
}

/// The pool interface consumed by arbitration and by operators.
pub trait MemoryPool: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn kind(&self) -> MemoryPoolKind;

    fn capacity(&self) -> u64;
    fn max_capacity(&self) -> u64;
    /// Bytes reserved out of the capacity (root) or out of the parent (leaf).
    fn reserved_bytes(&self) -> u64;
    /// Bytes actually allocated.
    fn used_bytes(&self) -> u64;
    fn peak_bytes(&self) -> u64;

    /// Capacity not covered by reservations.
    fn free_bytes(&self) -> u64 {
        self.capacity().saturating_sub(self.reserved_bytes())
    }

    /// Reserved but not yet used bytes of a leaf pool.
    fn available_reservation(&self) -> u64 {
        self.reserved_bytes().saturating_sub(self.used_bytes())
    }

    fn reclaimable_bytes(&self) -> Option<u64>;

    /// Tries to grow the reservation by `bytes` ahead of use. Returns false if
    /// the memory could not be obtained; errors only if the pool was aborted or
    /// arbitration failed outright.
    fn maybe_reserve(&self, bytes: u64) -> ExecResult<bool>;

    /// Drops any reservation beyond the used bytes.
    fn release(&self);

    /// Records an allocation of `bytes`, growing the reservation as needed.
    fn allocate(&self, bytes: u64) -> ExecResult<()>;

    /// Records that `bytes` previously allocated were freed.
    fn free(&self, bytes: u64);

    /// Grows a root pool's capacity by `grow_bytes` and reserves
    /// `reservation_bytes` of it in one step.
    fn grow(&self, grow_bytes: u64, reservation_bytes: u64) -> bool;

    /// Gives back up to `target_bytes` of free capacity; 0 means all of it.
    fn shrink(&self, target_bytes: u64) -> u64;

    /// Asks the pool's reclaimer to free memory. Returns the reservation freed.
    fn reclaim(
        &self,
        target_bytes: u64,
        max_wait_ms: u64,
        stats: &mut ReclaimerStats,
    ) -> ExecResult<u64>;

    fn abort(&self, error: Arc<ExecError>) -> ExecResult<()>;
    fn aborted(&self) -> bool;

    fn track_usage(&self) -> bool;

    fn enter_arbitration(&self) {}
    fn leave_arbitration(&self) {}
}

#[derive(Debug, Default)]
struct PoolState {
    capacity: u64,
    max_capacity: u64,
    reserved: u64,
    used: u64,
    /// Reservation a leaf keeps regardless of usage, set by `maybe_reserve`.
    min_reservation: u64,
    peak: u64,
}

/// The concrete pool used for both query (root) and operator (leaf) pools.
pub struct MemoryPoolImpl {
    name: String,
    kind: MemoryPoolKind,
    parent: Option<Arc<MemoryPoolImpl>>,
    arbitrator: Option<Arc<SharedArbitrator>>,
    state: Mutex<PoolState>,
    children: Mutex<Vec<Weak<MemoryPoolImpl>>>,
    reclaimer: RwLock<Option<Arc<dyn MemoryReclaimer>>>,
    aborted: AtomicBool,
    abort_error: Mutex<Option<Arc<ExecError>>>,
    track_usage: bool,
}

impl Debug for MemoryPoolImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let state = self.state.lock();
        f.debug_struct("MemoryPoolImpl")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("capacity", &state.capacity)
            .field("max_capacity", &state.max_capacity)
            .field("reserved", &state.reserved)
            .field("used", &state.used)
            .field("aborted", &self.aborted.load(Ordering::Acquire))
            .finish()
    }
}

impl MemoryPoolImpl {
    /// Creates a query pool. Without an arbitrator the pool has a fixed
    /// capacity of `max_capacity`; with one it starts empty and the caller is
    /// expected to register it via [`SharedArbitrator::add_pool`].
    pub fn new_root(
        name: impl Into<String>,
        max_capacity: u64,
        arbitrator: Option<Arc<SharedArbitrator>>,
    ) -> Arc<Self> {
        let capacity = if arbitrator.is_some() { 0 } else { max_capacity };
        Arc::new(Self {
            name: name.into(),
            kind: MemoryPoolKind::Root,
            parent: None,
            arbitrator,
            state: Mutex::new(PoolState {
                capacity,
                max_capacity,
                ..Default::default()
            }),
            children: Mutex::new(Vec::new()),
            reclaimer: RwLock::new(None),
            aborted: AtomicBool::new(false),
            abort_error: Mutex::new(None),
            track_usage: true,
        })
    }

    pub fn add_leaf_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> Arc<MemoryPoolImpl> {
        let max_capacity = self.max_capacity();
        let child = Arc::new(Self {
            name: name.into(),
            kind: MemoryPoolKind::Leaf,
            parent: Some(Arc::clone(self)),
            arbitrator: None,
            state: Mutex::new(PoolState {
                capacity: max_capacity,
                max_capacity,
                ..Default::default()
            }),
            children: Mutex::new(Vec::new()),
            reclaimer: RwLock::new(reclaimer),
            aborted: AtomicBool::new(self.aborted()),
            abort_error: Mutex::new(None),
            track_usage: self.track_usage,
        });
        let mut children = self.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        child
    }

    pub fn set_reclaimer(&self, reclaimer: Arc<dyn MemoryReclaimer>) {
        *self.reclaimer.write() = Some(reclaimer);
    }

    pub fn reclaimer(&self) -> Option<Arc<dyn MemoryReclaimer>> {
        self.reclaimer.read().clone()
    }

    pub fn parent(&self) -> Option<&Arc<MemoryPoolImpl>> {
        self.parent.as_ref()
    }

    /// Live children of a root pool.
    pub fn children(&self) -> Vec<Arc<MemoryPoolImpl>> {
        self.children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn abort_error(&self) -> Option<Arc<ExecError>> {
        self.abort_error.lock().clone()
    }

    fn check_not_aborted(&self) -> ExecResult<()> {
        if self.aborted() {
            let reason = self
                .abort_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "aborted".to_string());
            return Err(ExecError::Aborted {
                pool: self.name.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Root side of a child reservation. Grows capacity through the arbitrator
    /// when the free capacity is not enough.
    fn reserve_for_child(&self, bytes: u64) -> ExecResult<bool> {
        debug_assert_eq!(self.kind, MemoryPoolKind::Root);
        self.check_not_aborted()?;
        if bytes == 0 {
            return Ok(true);
        }
        {
            let mut state = self.state.lock();
            if state.reserved + bytes <= state.capacity {
                state.reserved += bytes;
                state.peak = state.peak.max(state.reserved);
                return Ok(true);
            }
        }
        let Some(arbitrator) = self.arbitrator.as_ref() else {
            return Ok(false);
        };

        self.enter_arbitration();
        let result = arbitrator.grow_capacity(self, bytes);
        self.leave_arbitration();
        // The abort may have happened while we were waiting.
        self.check_not_aborted()?;
        result
    }

    fn release_from_child(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(bytes);
    }

    fn cap_exceeded_error(&self, requested: u64) -> ExecError {
        let root = self.parent.as_deref().unwrap_or(self);
        let state = root.state.lock();
        ExecError::MemoryCapExceeded {
            pool: self.name.clone(),
            requested,
            reserved: state.reserved,
            capacity: state.capacity,
            max_capacity: state.max_capacity,
        }
    }

    /// Moves a leaf's reservation to `new_reserved`, returning the bytes handed
    /// back to the parent.
    fn shrink_leaf_reservation(&self, state: &mut PoolState) -> u64 {
        let target = quantized_size(state.used.max(state.min_reservation));
        if target >= state.reserved {
            return 0;
        }
        let released = state.reserved - target;
        state.reserved = target;
        released
    }
}

impl MemoryPool for MemoryPoolImpl {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MemoryPoolKind {
        self.kind
    }

    fn capacity(&self) -> u64 {
        match self.kind {
            MemoryPoolKind::Root => self.state.lock().capacity,
            MemoryPoolKind::Leaf => self.parent.as_ref().map_or(0, |p| p.capacity()),
        }
    }

    fn max_capacity(&self) -> u64 {
        self.state.lock().max_capacity
    }

    fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved
    }

    fn used_bytes(&self) -> u64 {
        match self.kind {
            MemoryPoolKind::Leaf => self.state.lock().used,
            MemoryPoolKind::Root => self.children().iter().map(|c| c.used_bytes()).sum(),
        }
    }

    fn peak_bytes(&self) -> u64 {
        self.state.lock().peak
    }

    fn free_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.capacity.saturating_sub(state.reserved)
    }

    fn reclaimable_bytes(&self) -> Option<u64> {
        let reclaimer = self.reclaimer()?;
        reclaimer.reclaimable_bytes(self)
    }

    fn maybe_reserve(&self, bytes: u64) -> ExecResult<bool> {
        if self.kind == MemoryPoolKind::Root {
            return self.reserve_for_child(quantized_size(bytes));
        }
        self.check_not_aborted()?;
        let increment = quantized_size(bytes);
        let parent = self
            .parent
            .as_ref()
            .ok_or_else(|| ExecError::Internal(format!("leaf pool {} has no parent", self.name)))?;
        match parent.reserve_for_child(increment) {
            Ok(true) => {
                let mut state = self.state.lock();
                state.reserved += increment;
                state.min_reservation = state.reserved;
                state.peak = state.peak.max(state.reserved);
                Ok(true)
            }
            Ok(false) => Ok(false),
            // A cap error just means the reservation is not available.
            Err(ExecError::MemoryCapExceeded { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn release(&self) {
        if self.kind == MemoryPoolKind::Root {
            return;
        }
        let released = {
            let mut state = self.state.lock();
            state.min_reservation = 0;
            self.shrink_leaf_reservation(&mut state)
        };
        if let Some(parent) = &self.parent {
            parent.release_from_child(released);
        }
    }

    fn allocate(&self, bytes: u64) -> ExecResult<()> {
        if self.kind == MemoryPoolKind::Root {
            return Err(ExecError::Internal(format!(
                "cannot allocate from root pool {}",
                self.name
            )));
        }
        self.check_not_aborted()?;
        let increment = {
            let mut state = self.state.lock();
            if state.used + bytes <= state.reserved {
                state.used += bytes;
                return Ok(());
            }
            quantized_size(state.used + bytes) - state.reserved
        };
        // The parent may arbitrate, which can call back into this pool's
        // reclaimer, so no lock is held here.
        let granted = match &self.parent {
            Some(parent) => parent.reserve_for_child(increment)?,
            None => false,
        };
        if !granted {
            return Err(self.cap_exceeded_error(increment));
        }
        let mut state = self.state.lock();
        state.reserved += increment;
        state.used += bytes;
        state.peak = state.peak.max(state.reserved);
        Ok(())
    }

    fn free(&self, bytes: u64) {
        if self.kind == MemoryPoolKind::Root {
            return;
        }
        let released = {
            let mut state = self.state.lock();
            if bytes > state.used {
                warn!(
                    "Memory pool {} freeing {bytes} bytes with only {} bytes used",
                    self.name, state.used
                );
            }
            state.used = state.used.saturating_sub(bytes);
            self.shrink_leaf_reservation(&mut state)
        };
        if let Some(parent) = &self.parent {
            parent.release_from_child(released);
        }
    }

    fn grow(&self, grow_bytes: u64, reservation_bytes: u64) -> bool {
        let mut state = self.state.lock();
        let new_capacity = state.capacity + grow_bytes;
        if new_capacity > state.max_capacity || state.reserved + reservation_bytes > new_capacity
        {
            return false;
        }
        state.capacity = new_capacity;
        state.reserved += reservation_bytes;
        state.peak = state.peak.max(state.reserved);
        true
    }

    fn shrink(&self, target_bytes: u64) -> u64 {
        let mut state = self.state.lock();
        let free = state.capacity.saturating_sub(state.reserved);
        let freed = if target_bytes == 0 {
            free
        } else {
            free.min(target_bytes)
        };
        state.capacity -= freed;
        freed
    }

    fn reclaim(
        &self,
        target_bytes: u64,
        max_wait_ms: u64,
        stats: &mut ReclaimerStats,
    ) -> ExecResult<u64> {
        let Some(reclaimer) = self.reclaimer() else {
            return Ok(0);
        };
        let reserved_before = self.reserved_bytes();
        let start = Instant::now();
        reclaimer.reclaim(self, target_bytes, max_wait_ms, stats)?;
        stats.reclaim_exec_time_us += start.elapsed().as_micros() as u64;
        let reclaimed = reserved_before.saturating_sub(self.reserved_bytes());
        debug!(
            "Reclaimed {reclaimed} bytes from memory pool {} (target {target_bytes})",
            self.name
        );
        Ok(reclaimed)
    }

    fn abort(&self, error: Arc<ExecError>) -> ExecResult<()> {
        let reclaimer = self.reclaimer().ok_or_else(|| {
            ExecError::Internal(format!(
                "Can't abort memory pool {} without a reclaimer",
                self.name
            ))
        })?;
        *self.abort_error.lock() = Some(Arc::clone(&error));
        self.aborted.store(true, Ordering::Release);
        for child in self.children() {
            *child.abort_error.lock() = Some(Arc::clone(&error));
            child.aborted.store(true, Ordering::Release);
        }
        reclaimer.abort(self, &error)
    }

    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn track_usage(&self) -> bool {
        self.track_usage
    }

    fn enter_arbitration(&self) {
        if let Some(reclaimer) = self.reclaimer() {
            reclaimer.enter_arbitration();
        }
    }

    fn leave_arbitration(&self) {
        if let Some(reclaimer) = self.reclaimer() {
            reclaimer.leave_arbitration();
        }
    }
}

/// Reclaims from the children of `pool`, largest reclaimable first, until
/// `target_bytes` are freed (0 means reclaim everything).
pub fn reclaim_children(
    pool: &MemoryPoolImpl,
    target_bytes: u64,
    max_wait_ms: u64,
    stats: &mut ReclaimerStats,
) -> ExecResult<u64> {
    let mut candidates: Vec<(Arc<MemoryPoolImpl>, u64)> = pool
        .children()
        .into_iter()
        .filter_map(|child| {
            let bytes = child.reclaimable_bytes()?;
            Some((child, bytes))
        })
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let mut reclaimed = 0;
    for (child, _) in candidates {
        let remaining = if target_bytes == 0 {
            0
        } else {
            target_bytes.saturating_sub(reclaimed)
        };
        reclaimed += child.reclaim(remaining, max_wait_ms, stats)?;
        if target_bytes != 0 && reclaimed >= target_bytes {
            break;
        }
    }
    stats.reclaimed_bytes += reclaimed;
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn quantization() {
        assert_eq!(quantized_size(0), 0);
        assert_eq!(quantized_size(1), MB);
        assert_eq!(quantized_size(MB + 1), 2 * MB);
        assert_eq!(quantized_size(17 * MB), 20 * MB);
        assert_eq!(quantized_size(65 * MB), 72 * MB);
    }

    #[test]
    fn leaf_reservations_come_from_root() {
        let root = MemoryPoolImpl::new_root("query", 8 * MB, None);
        let leaf = root.add_leaf_child("op", None);

        leaf.allocate(100).unwrap();
        assert_eq!(leaf.used_bytes(), 100);
        assert_eq!(leaf.reserved_bytes(), MB);
        assert_eq!(root.reserved_bytes(), MB);
        assert_eq!(root.used_bytes(), 100);

        assert!(leaf.maybe_reserve(3 * MB).unwrap());
        assert_eq!(leaf.reserved_bytes(), 4 * MB);
        assert_eq!(leaf.available_reservation(), 4 * MB - 100);

        leaf.release();
        assert_eq!(leaf.reserved_bytes(), MB);
        assert_eq!(root.reserved_bytes(), MB);

        leaf.free(100);
        assert_eq!(leaf.reserved_bytes(), 0);
        assert_eq!(root.reserved_bytes(), 0);
        assert_eq!(root.peak_bytes(), 4 * MB);
    }

    #[test]
    fn fixed_capacity_root_rejects_overflow() {
        let root = MemoryPoolImpl::new_root("query", 2 * MB, None);
        let leaf = root.add_leaf_child("op", None);
        assert!(!leaf.maybe_reserve(3 * MB).unwrap());
        let err = leaf.allocate(3 * MB).unwrap_err();
        assert!(matches!(err, ExecError::MemoryCapExceeded { .. }));
        assert!(err.to_string().contains("op"));
        assert_eq!(leaf.used_bytes(), 0);
    }

    #[test]
    fn grow_and_shrink_root() {
        let root = MemoryPoolImpl::new_root("query", 8 * MB, None);
        assert_eq!(root.shrink(2 * MB), 2 * MB);
        assert_eq!(root.capacity(), 6 * MB);
        assert!(root.grow(MB, MB));
        assert_eq!(root.capacity(), 7 * MB);
        assert_eq!(root.reserved_bytes(), MB);
        assert!(!root.grow(2 * MB, 0));
        assert_eq!(root.shrink(0), 6 * MB);
        assert_eq!(root.capacity(), MB);
    }

    struct CountingReclaimer {
        reclaims: AtomicU64,
        aborts: AtomicU64,
        leaf: Mutex<Option<Weak<MemoryPoolImpl>>>,
    }

    impl MemoryReclaimer for CountingReclaimer {
        fn reclaimable_bytes(&self, pool: &MemoryPoolImpl) -> Option<u64> {
            Some(pool.used_bytes())
        }

        fn reclaim(
            &self,
            pool: &MemoryPoolImpl,
            _target_bytes: u64,
            max_wait_ms: u64,
            stats: &mut ReclaimerStats,
        ) -> ExecResult<()> {
            self.reclaims.fetch_add(1, Ordering::Relaxed);
            if pool.kind() == MemoryPoolKind::Root {
                reclaim_children(pool, 0, max_wait_ms, stats)?;
            } else if let Some(leaf) = self.leaf.lock().as_ref().and_then(Weak::upgrade) {
                leaf.free(leaf.used_bytes());
            }
            Ok(())
        }

        fn abort(&self, _pool: &MemoryPoolImpl, _error: &Arc<ExecError>) -> ExecResult<()> {
            self.aborts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn reclaim_through_children_and_abort() {
        let reclaimer = Arc::new(CountingReclaimer {
            reclaims: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            leaf: Mutex::new(None),
        });
        let root = MemoryPoolImpl::new_root("query", 8 * MB, None);
        root.set_reclaimer(Arc::clone(&reclaimer) as Arc<dyn MemoryReclaimer>);
        let leaf = root.add_leaf_child("op", Some(Arc::clone(&reclaimer) as _));
        *reclaimer.leaf.lock() = Some(Arc::downgrade(&leaf));

        leaf.allocate(2 * MB).unwrap();
        let mut stats = ReclaimerStats::default();
        let reclaimed = root.reclaim(MB, 0, &mut stats).unwrap();
        assert_eq!(reclaimed, 2 * MB);
        assert_eq!(reclaimer.reclaims.load(Ordering::Relaxed), 2);
        assert_eq!(stats.reclaimed_bytes, 2 * MB);
        assert_eq!(leaf.used_bytes(), 0);

        root.abort(Arc::new(ExecError::Internal("test".to_string())))
            .unwrap();
        assert!(root.aborted());
        assert!(leaf.aborted());
        assert_eq!(reclaimer.aborts.load(Ordering::Relaxed), 1);
        assert!(matches!(leaf.allocate(1), Err(ExecError::Aborted { .. })));
    }

    #[test]
    fn abort_without_reclaimer_fails() {
        let root = MemoryPoolImpl::new_root("query", MB, None);
        assert!(root
            .abort(Arc::new(ExecError::Internal("test".to_string())))
            .is_err());
        assert!(!root.aborted());
    }
}
