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

//! A query task: the memory, drivers and shared state of one query fragment.
//!
//! Drivers count themselves "on thread" while they run operator code. Memory
//! reclaim pauses the task first, which waits until every driver is either off
//! thread (parked on a future, or between quanta) or suspended inside memory
//! arbitration. A driver that triggers arbitration suspends itself, so it can
//! be reclaimed from by its own request.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use datafusion::execution::runtime_env::RuntimeEnv;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::errors::{ExecError, ExecResult};
use crate::execution::config::QueryConfig;
use crate::execution::future::{make_continue_future, ContinueFuture, ContinuePromise};
use crate::execution::joins::HashJoinBridge;
use crate::execution::memory_pools::{
    create_leaf_pool, global_arbitrator, reclaim_children, MemoryPool, MemoryPoolImpl,
    MemoryReclaimer, ReclaimerStats, SharedArbitrator,
};
use crate::execution::operators::ReclaimableOperator;

pub type PlanNodeId = String;

static NEXT_TASK_SERIAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Serial of the task whose driver is on this thread, 0 if none.
    static ON_THREAD_TASK: Cell<u64> = const { Cell::new(0) };
    /// Serial of the task whose driver suspended itself on this thread.
    static SUSPENDED_TASK: Cell<u64> = const { Cell::new(0) };
}

#[derive(Debug, Default)]
struct RunState {
    error: Option<Arc<ExecError>>,
    num_on_thread: usize,
    num_suspended: usize,
}

/// Outcome of arriving at a peer barrier.
#[derive(Debug)]
pub enum BarrierOutcome {
    /// This was the last peer. The caller must fulfil the promises once it
    /// has done the work the others are waiting for.
    Last(Vec<ContinuePromise>),
    /// Other peers are still running; wait on the future.
    Wait(ContinueFuture),
}

#[derive(Default)]
struct Barrier {
    num_arrived: usize,
    promises: Vec<ContinuePromise>,
}

pub struct Task {
    task_id: String,
    serial: u64,
    config: QueryConfig,
    runtime: Arc<RuntimeEnv>,
    pool: Arc<MemoryPoolImpl>,
    arbitrator: Option<Arc<SharedArbitrator>>,
    run_state: Mutex<RunState>,
    run_cond: Condvar,
    pause_requests: AtomicU32,
    barriers: Mutex<HashMap<String, Barrier>>,
    operators: Mutex<HashMap<PlanNodeId, Vec<Weak<dyn ReclaimableOperator>>>>,
    bridges: Mutex<HashMap<PlanNodeId, Arc<HashJoinBridge>>>,
}

impl Task {
    /// Creates a task whose root pool has a fixed `max_capacity` and no
    /// arbitrator.
    pub fn new(
        task_id: impl Into<String>,
        config: QueryConfig,
        runtime: Arc<RuntimeEnv>,
        max_capacity: u64,
    ) -> Arc<Self> {
        let task_id = task_id.into();
        let serial = NEXT_TASK_SERIAL.fetch_add(1, Ordering::Relaxed);
        let pool = MemoryPoolImpl::new_root(format!("query.{task_id}.{serial}"), max_capacity, None);
        Self::with_pool(task_id, serial, config, runtime, pool, None)
    }

    /// Creates a task whose root pool grows through `arbitrator`.
    pub fn with_arbitrator(
        task_id: impl Into<String>,
        config: QueryConfig,
        runtime: Arc<RuntimeEnv>,
        arbitrator: &Arc<SharedArbitrator>,
        max_capacity: u64,
    ) -> ExecResult<Arc<Self>> {
        let task_id = task_id.into();
        let serial = NEXT_TASK_SERIAL.fetch_add(1, Ordering::Relaxed);
        let pool =
            arbitrator.create_root_pool(format!("query.{task_id}.{serial}"), max_capacity)?;
        Ok(Self::with_pool(
            task_id,
            serial,
            config,
            runtime,
            pool,
            Some(Arc::clone(arbitrator)),
        ))
    }

    /// Creates a task whose root pool grows through the process-wide
    /// arbitrator, configured from `config` on first use.
    pub fn with_global_arbitrator(
        task_id: impl Into<String>,
        config: QueryConfig,
        runtime: Arc<RuntimeEnv>,
        max_capacity: u64,
    ) -> ExecResult<Arc<Self>> {
        let arbitrator = global_arbitrator(&config)?;
        Self::with_arbitrator(task_id, config, runtime, &arbitrator, max_capacity)
    }

    fn with_pool(
        task_id: String,
        serial: u64,
        config: QueryConfig,
        runtime: Arc<RuntimeEnv>,
        pool: Arc<MemoryPoolImpl>,
        arbitrator: Option<Arc<SharedArbitrator>>,
    ) -> Arc<Self> {
        let task = Arc::new(Self {
            task_id,
            serial,
            config,
            runtime,
            pool,
            arbitrator,
            run_state: Mutex::new(RunState::default()),
            run_cond: Condvar::new(),
            pause_requests: AtomicU32::new(0),
            barriers: Mutex::new(HashMap::new()),
            operators: Mutex::new(HashMap::new()),
            bridges: Mutex::new(HashMap::new()),
        });
        task.pool.set_reclaimer(Arc::new(TaskReclaimer {
            task: Arc::downgrade(&task),
        }));
        task
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<RuntimeEnv> {
        &self.runtime
    }

    pub fn pool(&self) -> &Arc<MemoryPoolImpl> {
        &self.pool
    }

    /// Creates a leaf pool for an operator.
    pub fn add_operator_pool(
        &self,
        name: &str,
        reclaimer: Option<Arc<dyn MemoryReclaimer>>,
    ) -> ExecResult<(Arc<MemoryPoolImpl>, Arc<dyn MemoryPool>)> {
        let debug_memory = self.config.debug_memory()?;
        Ok(create_leaf_pool(
            &self.pool,
            format!("{}.{name}", self.pool.name()),
            reclaimer,
            debug_memory,
        ))
    }

    // -----------------------------------------------------------------------
    // Running state
    // -----------------------------------------------------------------------

    pub fn check_running(&self) -> ExecResult<()> {
        match &self.run_state.lock().error {
            None => Ok(()),
            Some(error) => Err(ExecError::TaskCancelled {
                task_id: self.task_id.clone(),
                reason: error.to_string(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_state.lock().error.is_none()
    }

    /// Fails the task. The first error wins. Parked drivers are woken up so
    /// they notice.
    pub fn set_error(&self, error: Arc<ExecError>) {
        {
            let mut state = self.run_state.lock();
            if state.error.is_some() {
                return;
            }
            warn!("Task {} failed: {error}", self.task_id);
            state.error = Some(error);
        }
        self.run_cond.notify_all();
        // Dropping the promises resumes the waiters.
        self.barriers.lock().clear();
        let bridges: Vec<Arc<HashJoinBridge>> = self.bridges.lock().values().cloned().collect();
        for bridge in bridges {
            bridge.cancel();
        }
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        self.set_error(Arc::new(ExecError::TaskCancelled {
            task_id: self.task_id.clone(),
            reason: reason.into(),
        }));
    }

    // -----------------------------------------------------------------------
    // Pause protocol
    // -----------------------------------------------------------------------

    /// Called by a driver before it runs operator code on this thread. Waits
    /// while the task is paused.
    pub fn enter_driver(&self) -> ExecResult<()> {
        let mut state = self.run_state.lock();
        while self.pause_requested() && state.error.is_none() {
            self.run_cond.wait(&mut state);
        }
        if let Some(error) = &state.error {
            return Err(ExecError::TaskCancelled {
                task_id: self.task_id.clone(),
                reason: error.to_string(),
            });
        }
        state.num_on_thread += 1;
        ON_THREAD_TASK.with(|t| t.set(self.serial));
        Ok(())
    }

    /// Called by a driver when it stops running operator code.
    pub fn leave_driver(&self) {
        {
            let mut state = self.run_state.lock();
            assert!(state.num_on_thread > 0, "no driver on thread");
            state.num_on_thread -= 1;
        }
        ON_THREAD_TASK.with(|t| t.set(0));
        self.run_cond.notify_all();
    }

    /// Takes the calling driver off thread while it blocks in memory
    /// arbitration. Does nothing if the caller is not an on thread driver of
    /// this task.
    pub fn enter_suspended(&self) -> bool {
        if ON_THREAD_TASK.with(|t| t.get()) != self.serial {
            return false;
        }
        {
            let mut state = self.run_state.lock();
            state.num_on_thread -= 1;
            state.num_suspended += 1;
        }
        ON_THREAD_TASK.with(|t| t.set(0));
        SUSPENDED_TASK.with(|t| t.set(self.serial));
        self.run_cond.notify_all();
        true
    }

    /// Puts a suspended driver back on thread, waiting while the task is
    /// paused.
    pub fn leave_suspended(&self) {
        if SUSPENDED_TASK.with(|t| t.get()) != self.serial {
            return;
        }
        {
            let mut state = self.run_state.lock();
            while self.pause_requested() && state.error.is_none() {
                self.run_cond.wait(&mut state);
            }
            state.num_suspended -= 1;
            state.num_on_thread += 1;
        }
        SUSPENDED_TASK.with(|t| t.set(0));
        ON_THREAD_TASK.with(|t| t.set(self.serial));
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requests.load(Ordering::Acquire) > 0
    }

    /// Requests a pause and waits until no driver is on thread. Returns false
    /// if that didn't happen within `max_wait`; the pause request is dropped
    /// in that case.
    pub fn request_pause(&self, max_wait: Option<Duration>) -> bool {
        let mut state = self.run_state.lock();
        self.pause_requests.fetch_add(1, Ordering::AcqRel);
        while state.num_on_thread > 0 {
            match max_wait {
                Some(timeout) => {
                    if self.run_cond.wait_for(&mut state, timeout).timed_out()
                        && state.num_on_thread > 0
                    {
                        drop(state);
                        self.resume();
                        return false;
                    }
                }
                None => self.run_cond.wait(&mut state),
            }
        }
        true
    }

    pub fn resume(&self) {
        let previous = self.pause_requests.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "resume without a pause request");
        self.run_cond.notify_all();
    }

    pub fn num_on_thread(&self) -> usize {
        self.run_state.lock().num_on_thread
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Barrier between the `num_peers` drivers that arrive with the same
    /// `barrier_id`. The barrier resets once the last peer arrives, so it can
    /// be reused.
    pub fn all_peers_finished(&self, barrier_id: &str, num_peers: usize) -> BarrierOutcome {
        let mut barriers = self.barriers.lock();
        let barrier = barriers.entry(barrier_id.to_string()).or_default();
        barrier.num_arrived += 1;
        assert!(
            barrier.num_arrived <= num_peers,
            "more than {num_peers} peers arrived at barrier {barrier_id}"
        );
        if barrier.num_arrived == num_peers {
            let promises = barriers
                .remove(barrier_id)
                .map(|b| b.promises)
                .unwrap_or_default();
            return BarrierOutcome::Last(promises);
        }
        let (promise, future) = make_continue_future("Task::all_peers_finished");
        barrier.promises.push(promise);
        BarrierOutcome::Wait(future)
    }

    pub fn register_reclaimable(
        &self,
        plan_node_id: &str,
        operator: Weak<dyn ReclaimableOperator>,
    ) {
        self.operators
            .lock()
            .entry(plan_node_id.to_string())
            .or_default()
            .push(operator);
    }

    /// All live operators of `plan_node_id`, across drivers.
    pub fn find_peer_operators(&self, plan_node_id: &str) -> Vec<Arc<dyn ReclaimableOperator>> {
        self.operators
            .lock()
            .get(plan_node_id)
            .map(|ops| ops.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    pub fn get_or_create_bridge(&self, plan_node_id: &str) -> Arc<HashJoinBridge> {
        let mut bridges = self.bridges.lock();
        Arc::clone(
            bridges
                .entry(plan_node_id.to_string())
                .or_insert_with(|| Arc::new(HashJoinBridge::new(plan_node_id))),
        )
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(arbitrator) = &self.arbitrator {
            arbitrator.remove_pool(self.pool.name());
        }
        debug!("Task {} dropped", self.task_id);
    }
}

/// Reclaimer of a task's root pool. Pauses the task around reclaim and takes
/// the arbitrating driver off thread.
struct TaskReclaimer {
    task: Weak<Task>,
}

/// Resumes a paused task on scope exit.
struct ResumeGuard<'a>(&'a Task);

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        self.0.resume();
    }
}

impl MemoryReclaimer for TaskReclaimer {
    fn enter_arbitration(&self) {
        if let Some(task) = self.task.upgrade() {
            task.enter_suspended();
        }
    }

    fn leave_arbitration(&self) {
        if let Some(task) = self.task.upgrade() {
            task.leave_suspended();
        }
    }

    fn reclaimable_bytes(&self, pool: &MemoryPoolImpl) -> Option<u64> {
        let mut reclaimable = None;
        for child in pool.children() {
            if let Some(bytes) = child.reclaimable_bytes() {
                *reclaimable.get_or_insert(0) += bytes;
            }
        }
        reclaimable
    }

    fn reclaim(
        &self,
        pool: &MemoryPoolImpl,
        target_bytes: u64,
        max_wait_ms: u64,
        stats: &mut ReclaimerStats,
    ) -> ExecResult<()> {
        let Some(task) = self.task.upgrade() else {
            return Ok(());
        };
        if !task.is_running() {
            return Ok(());
        }
        let max_wait = (max_wait_ms > 0).then(|| Duration::from_millis(max_wait_ms));
        if !task.request_pause(max_wait) {
            warn!(
                "Task {} did not pause within {max_wait_ms}ms, skipping reclaim",
                task.task_id
            );
            return Ok(());
        }
        let _resume = ResumeGuard(&task);
        let reclaimed = reclaim_children(pool, target_bytes, max_wait_ms, stats)?;
        info!(
            "Reclaimed {reclaimed} bytes from task {} (target {target_bytes})",
            task.task_id
        );
        Ok(())
    }

    fn abort(&self, _pool: &MemoryPoolImpl, error: &Arc<ExecError>) -> ExecResult<()> {
        if let Some(task) = self.task.upgrade() {
            task.set_error(Arc::clone(error));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::memory_pools::{MemoryPool, GB, MB};
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;
    use std::sync::atomic::AtomicBool;

    fn task() -> Arc<Task> {
        Task::new(
            "t",
            QueryConfig::default(),
            RuntimeEnvBuilder::new().build_arc().unwrap(),
            GB,
        )
    }

    #[test]
    fn barrier_picks_last_peer() {
        let task = task();
        let mut futures = vec![];
        for _ in 0..2 {
            match task.all_peers_finished("build", 3) {
                BarrierOutcome::Wait(future) => futures.push(future),
                BarrierOutcome::Last(_) => panic!("not the last peer"),
            }
        }
        let BarrierOutcome::Last(promises) = task.all_peers_finished("build", 3) else {
            panic!("expected the last peer");
        };
        assert_eq!(promises.len(), 2);
        promises.into_iter().for_each(ContinuePromise::set_value);
        futures.into_iter().for_each(ContinueFuture::wait);

        // The barrier can be used again.
        assert!(matches!(
            task.all_peers_finished("build", 1),
            BarrierOutcome::Last(p) if p.is_empty()
        ));
    }

    #[test]
    fn pause_waits_for_drivers() {
        let task = task();
        task.enter_driver().unwrap();
        assert!(!task.request_pause(Some(Duration::from_millis(10))));
        assert!(!task.pause_requested());

        let paused = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(task.request_pause(None));
                paused.store(true, Ordering::Release);
                task.resume();
            });
            std::thread::sleep(Duration::from_millis(20));
            assert!(!paused.load(Ordering::Acquire));
            task.leave_driver();
        });
        assert!(paused.load(Ordering::Acquire));
        assert_eq!(task.num_on_thread(), 0);
    }

    #[test]
    fn suspended_driver_does_not_block_pause() {
        let task = task();
        task.enter_driver().unwrap();
        assert!(task.enter_suspended());
        assert!(task.request_pause(Some(Duration::from_millis(100))));
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                task.resume();
            });
            // Blocks until the pause is lifted.
            task.leave_suspended();
        });
        assert_eq!(task.num_on_thread(), 1);
        task.leave_driver();
        // Not a driver thread any more.
        assert!(!task.enter_suspended());
    }

    #[test]
    fn global_arbitrator_tracks_task_pools() {
        let config = QueryConfig::default();
        let task = Task::with_global_arbitrator(
            "global",
            config.clone(),
            RuntimeEnvBuilder::new().build_arc().unwrap(),
            GB,
        )
        .unwrap();
        let arbitrator = global_arbitrator(&config).unwrap();
        let name = task.pool().name().to_string();
        assert!(arbitrator.participant(&name).is_some());
        assert_eq!(task.pool().max_capacity(), GB);
        assert_eq!(
            task.pool().capacity(),
            arbitrator.config().participant.initial_capacity.min(GB)
        );

        let leaf = task.pool().add_leaf_child("op", None);
        leaf.allocate(MB).unwrap();
        leaf.free(MB);
        drop(leaf);
        drop(task);
        assert!(arbitrator.participant(&name).is_none());
    }

    #[test]
    fn error_cancels_waiters() {
        let task = task();
        let BarrierOutcome::Wait(future) = task.all_peers_finished("b", 2) else {
            panic!("expected to wait");
        };
        task.cancel("test");
        future.wait();
        assert!(matches!(
            task.check_running(),
            Err(ExecError::TaskCancelled { .. })
        ));
        assert!(task.enter_driver().is_err());
    }
}
