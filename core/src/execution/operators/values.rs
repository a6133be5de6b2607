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

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::array::RecordBatch;
use parking_lot::Mutex;

use super::{BlockingReason, Operator};
use crate::errors::ExecResult;
use crate::execution::future::ContinueFuture;

/// Source that emits a fixed list of batches.
pub struct ValuesSource {
    plan_node_id: String,
    batches: VecDeque<RecordBatch>,
}

impl ValuesSource {
    pub fn new(plan_node_id: impl Into<String>, batches: Vec<RecordBatch>) -> Self {
        Self {
            plan_node_id: plan_node_id.into(),
            batches: batches.into(),
        }
    }

    /// The batches of driver `driver_id` when `batches` are dealt out round
    /// robin over `num_drivers` drivers.
    pub fn for_driver(
        plan_node_id: impl Into<String>,
        batches: &[RecordBatch],
        driver_id: usize,
        num_drivers: usize,
    ) -> Self {
        let mine = batches
            .iter()
            .enumerate()
            .filter(|(i, _)| i % num_drivers == driver_id)
            .map(|(_, b)| b.clone())
            .collect();
        Self::new(plan_node_id, mine)
    }
}

impl Operator for ValuesSource {
    fn name(&self) -> &str {
        "Values"
    }

    fn plan_node_id(&self) -> &str {
        &self.plan_node_id
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _batch: RecordBatch) -> ExecResult<()> {
        unreachable!("Values is a source operator")
    }

    fn no_more_input(&mut self) -> ExecResult<()> {
        Ok(())
    }

    fn get_output(&mut self) -> ExecResult<Option<RecordBatch>> {
        Ok(self.batches.pop_front())
    }

    fn is_blocked(&mut self) -> ExecResult<(BlockingReason, Option<ContinueFuture>)> {
        Ok((BlockingReason::NotBlocked, None))
    }

    fn is_finished(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Batches gathered by the [`CollectSink`]s of a pipeline.
pub type CollectedBatches = Arc<Mutex<Vec<RecordBatch>>>;

/// Sink that appends every input batch to a shared list.
pub struct CollectSink {
    plan_node_id: String,
    output: CollectedBatches,
    finished: bool,
}

impl CollectSink {
    pub fn new(plan_node_id: impl Into<String>, output: CollectedBatches) -> Self {
        Self {
            plan_node_id: plan_node_id.into(),
            output,
            finished: false,
        }
    }
}

impl Operator for CollectSink {
    fn name(&self) -> &str {
        "Collect"
    }

    fn plan_node_id(&self) -> &str {
        &self.plan_node_id
    }

    fn needs_input(&self) -> bool {
        !self.finished
    }

    fn add_input(&mut self, batch: RecordBatch) -> ExecResult<()> {
        if batch.num_rows() > 0 {
            self.output.lock().push(batch);
        }
        Ok(())
    }

    fn no_more_input(&mut self) -> ExecResult<()> {
        self.finished = true;
        Ok(())
    }

    fn get_output(&mut self) -> ExecResult<Option<RecordBatch>> {
        Ok(None)
    }

    fn is_blocked(&mut self) -> ExecResult<(BlockingReason, Option<ContinueFuture>)> {
        Ok((BlockingReason::NotBlocked, None))
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;

    fn batch(v: i32) -> RecordBatch {
        RecordBatch::try_from_iter(vec![(
            "a",
            Arc::new(Int32Array::from(vec![v])) as arrow::array::ArrayRef,
        )])
        .unwrap()
    }

    #[test]
    fn values_are_dealt_round_robin() {
        let batches: Vec<RecordBatch> = (0..5).map(batch).collect();
        let mut source = ValuesSource::for_driver("0", &batches, 1, 2);
        let mut seen = vec![];
        while let Some(b) = source.get_output().unwrap() {
            seen.push(b);
        }
        assert_eq!(seen, vec![batch(1), batch(3)]);
        assert!(source.is_finished());
    }

    #[test]
    fn sink_collects_until_no_more_input() {
        let output = CollectedBatches::default();
        let mut sink = CollectSink::new("1", Arc::clone(&output));
        assert!(sink.needs_input());
        sink.add_input(batch(7)).unwrap();
        sink.no_more_input().unwrap();
        assert!(sink.is_finished());
        assert_eq!(output.lock().len(), 1);
    }
}
