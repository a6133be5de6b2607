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

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::Mutex;

use crate::errors::{ExecError, ExecResult};
use crate::execution::future::ContinueFuture;
use crate::execution::operators::{BlockingReason, Operator, OperatorFactory};
use crate::execution::task::Task;

/// Time a driver runs before operators are asked to yield.
const YIELD_QUANTUM: Duration = Duration::from_millis(100);

/// What an operator knows about the driver running it.
#[derive(Clone)]
pub struct DriverCtx {
    task: Arc<Task>,
    pipeline_id: usize,
    driver_id: usize,
    num_drivers: usize,
    quantum_start: Arc<Mutex<Instant>>,
}

impl DriverCtx {
    pub fn new(task: Arc<Task>, pipeline_id: usize, driver_id: usize, num_drivers: usize) -> Self {
        Self {
            task,
            pipeline_id,
            driver_id,
            num_drivers,
            quantum_start: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    pub fn driver_id(&self) -> usize {
        self.driver_id
    }

    pub fn num_drivers(&self) -> usize {
        self.num_drivers
    }

    /// True if a long running operator call should return to the driver,
    /// either because the quantum is used up or the task wants to pause.
    pub fn should_yield(&self) -> bool {
        self.task.pause_requested() || self.quantum_start.lock().elapsed() >= YIELD_QUANTUM
    }

    fn start_quantum(&self) {
        *self.quantum_start.lock() = Instant::now();
    }
}

/// Operators of one pipeline, for `num_drivers` parallel drivers.
pub struct Pipeline {
    pub factories: Vec<OperatorFactory>,
    pub num_drivers: usize,
}

/// Runs one chain of operators on the calling thread.
pub struct Driver {
    ctx: DriverCtx,
    operators: Vec<Box<dyn Operator>>,
    no_more_input_sent: Vec<bool>,
}

impl Driver {
    pub fn try_new(ctx: DriverCtx, factories: &[OperatorFactory]) -> ExecResult<Self> {
        assert!(!factories.is_empty(), "a pipeline needs at least one operator");
        let operators = factories
            .iter()
            .map(|factory| factory(&ctx))
            .collect::<ExecResult<Vec<_>>>()?;
        let num_operators = operators.len();
        Ok(Self {
            ctx,
            operators,
            no_more_input_sent: vec![false; num_operators],
        })
    }

    /// Runs until the last operator is finished or the task fails.
    pub fn run(mut self) -> ExecResult<()> {
        let task = Arc::clone(&self.ctx.task);
        let result = self.run_loop();
        for op in self.operators.iter_mut() {
            op.close();
        }
        if let Err(e) = &result {
            if !matches!(e, ExecError::TaskCancelled { .. }) {
                error!(
                    "Driver {}.{} of task {} failed: {e}",
                    self.ctx.pipeline_id,
                    self.ctx.driver_id,
                    task.task_id()
                );
            }
        }
        result
    }

    fn run_loop(&mut self) -> ExecResult<()> {
        let task = Arc::clone(&self.ctx.task);
        loop {
            task.enter_driver()?;
            self.ctx.start_quantum();
            let result = self.run_on_thread();
            task.leave_driver();
            match result? {
                None => return Ok(()),
                Some(blocked) => self.park(blocked)?,
            }
        }
    }

    fn park(&self, (reason, future): (BlockingReason, Option<ContinueFuture>)) -> ExecResult<()> {
        debug!(
            "Driver {}.{} blocked on {reason}",
            self.ctx.pipeline_id, self.ctx.driver_id
        );
        match future {
            Some(future) => future.wait(),
            None => std::thread::yield_now(),
        }
        self.ctx.task.check_running()
    }

    /// Moves data through the operators until the pipeline finishes (`None`)
    /// or an operator blocks.
    fn run_on_thread(&mut self) -> ExecResult<Option<(BlockingReason, Option<ContinueFuture>)>> {
        let num_operators = self.operators.len();
        loop {
            self.ctx.task.check_running()?;
            if self.ctx.should_yield() {
                return Ok(Some((BlockingReason::Yield, None)));
            }
            let mut progress = false;
            for i in 0..num_operators {
                let (reason, future) = self.operators[i].is_blocked()?;
                if reason != BlockingReason::NotBlocked {
                    return Ok(Some((reason, future)));
                }
                if i + 1 == num_operators {
                    // The sink. Drain whatever it produces.
                    while self.operators[i].get_output()?.is_some() {
                        progress = true;
                    }
                    if self.operators[i].is_finished() {
                        return Ok(None);
                    }
                    continue;
                }
                if self.operators[i + 1].needs_input() {
                    if let Some(batch) = self.operators[i].get_output()? {
                        self.operators[i + 1].add_input(batch)?;
                        progress = true;
                        continue;
                    }
                }
                if self.operators[i].is_finished() && !self.no_more_input_sent[i + 1] {
                    self.no_more_input_sent[i + 1] = true;
                    self.operators[i + 1].no_more_input()?;
                    progress = true;
                }
            }
            if !progress {
                // Nothing moved and nothing blocked: let other threads run.
                return Ok(Some((BlockingReason::Yield, None)));
            }
        }
    }
}

/// Creates every driver of every pipeline, then runs each on its own thread.
/// The first failure fails the task and is returned.
pub fn execute(task: &Arc<Task>, pipelines: Vec<Pipeline>) -> ExecResult<()> {
    // All operators exist before any of them runs, so peers can find each
    // other.
    let mut drivers = vec![];
    for (pipeline_id, pipeline) in pipelines.iter().enumerate() {
        for driver_id in 0..pipeline.num_drivers {
            let ctx = DriverCtx::new(
                Arc::clone(task),
                pipeline_id,
                driver_id,
                pipeline.num_drivers,
            );
            drivers.push(Driver::try_new(ctx, &pipeline.factories)?);
        }
    }

    let results: Vec<ExecResult<()>> = std::thread::scope(|s| {
        let handles: Vec<_> = drivers
            .into_iter()
            .map(|driver| {
                s.spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| driver.run()))
                        .unwrap_or_else(|payload| Err(ExecError::from(payload)));
                    if let Err(e) = &result {
                        if !matches!(e, ExecError::TaskCancelled { .. }) {
                            task.set_error(Arc::new(ExecError::Internal(e.to_string())));
                        }
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|payload| Err(ExecError::from(payload)))
            })
            .collect()
    });

    let mut cancelled = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(e @ ExecError::TaskCancelled { .. }) => {
                cancelled.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    match cancelled {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::config::QueryConfig;
    use crate::execution::memory_pools::GB;
    use crate::execution::operators::{CollectSink, CollectedBatches, ValuesSource};
    use arrow::array::{ArrayRef, Int64Array, RecordBatch};
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;

    #[test]
    fn values_to_collect() {
        let task = Task::new(
            "t",
            QueryConfig::default(),
            RuntimeEnvBuilder::new().build_arc().unwrap(),
            GB,
        );
        let batches: Vec<RecordBatch> = (0..6)
            .map(|i| {
                RecordBatch::try_from_iter(vec![(
                    "a",
                    Arc::new(Int64Array::from(vec![i, i + 100])) as ArrayRef,
                )])
                .unwrap()
            })
            .collect();
        let output = CollectedBatches::default();
        let sink_output = Arc::clone(&output);
        let pipeline = Pipeline {
            factories: vec![
                Box::new(move |ctx: &DriverCtx| {
                    Ok(Box::new(ValuesSource::for_driver(
                        "0",
                        &batches,
                        ctx.driver_id(),
                        ctx.num_drivers(),
                    )) as Box<dyn Operator>)
                }),
                Box::new(move |_: &DriverCtx| {
                    Ok(Box::new(CollectSink::new("1", Arc::clone(&sink_output)))
                        as Box<dyn Operator>)
                }),
            ],
            num_drivers: 3,
        };
        execute(&task, vec![pipeline]).unwrap();
        let rows: usize = output.lock().iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 12);
        assert_eq!(task.num_on_thread(), 0);
    }
}
