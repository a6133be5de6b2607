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

//! Common execution errors.

use arrow::error::ArrowError;
use datafusion::common::DataFusionError;
use quiver_expr::FilterError;

use std::{any::Any, convert};

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Quiver Internal Error: {0}")]
    Internal(String),

    /// The reclaim lock of a memory pool could not be acquired in time. The pool is
    /// left untouched; the requester decides whether to escalate.
    #[error("Memory arbitration timed out after {timeout_ms}ms waiting to reclaim from pool {pool}")]
    ArbitrationTimeout { pool: String, timeout_ms: u64 },

    #[error("Exceeded memory cap of pool {pool}: requested {requested} bytes with {reserved} bytes reserved of {capacity} bytes capacity (max capacity {max_capacity} bytes)")]
    MemoryCapExceeded {
        pool: String,
        requested: u64,
        reserved: u64,
        capacity: u64,
        max_capacity: u64,
    },

    #[error("Memory pool {pool} aborted: {reason}")]
    Aborted { pool: String, reason: String },

    #[error("Spill Error: {0}")]
    Spill(String),

    #[error("Task {task_id} is no longer running: {reason}")]
    TaskCancelled { task_id: String, reason: String },

    #[error(transparent)]
    Arrow {
        #[from]
        source: ArrowError,
    },

    #[error(transparent)]
    Filter {
        #[from]
        source: FilterError,
    },

    #[error(transparent)]
    IO {
        #[from]
        source: std::io::Error,
    },

    #[error(transparent)]
    NumberIntFormat {
        #[from]
        source: std::num::ParseIntError,
    },

    #[error(transparent)]
    NumberFloatFormat {
        #[from]
        source: std::num::ParseFloatError,
    },

    #[error(transparent)]
    BoolFormat {
        #[from]
        source: std::str::ParseBoolError,
    },

    #[error("{msg}")]
    Panic { msg: String },

    #[error("{msg}")]
    DataFusion {
        msg: String,
        #[source]
        source: DataFusionError,
    },
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Converts the results from `panic::catch_unwind` (e.g. a panic) to an `ExecError`
impl convert::From<Box<dyn Any + Send>> for ExecError {
    fn from(e: Box<dyn Any + Send>) -> Self {
        ExecError::Panic {
            msg: match e.downcast_ref::<&str>() {
                Some(s) => s.to_string(),
                None => match e.downcast_ref::<String>() {
                    Some(msg) => msg.to_string(),
                    None => "unknown panic".to_string(),
                },
            },
        }
    }
}

impl From<DataFusionError> for ExecError {
    fn from(value: DataFusionError) -> Self {
        ExecError::DataFusion {
            msg: value.message().to_string(),
            source: value,
        }
    }
}

impl From<ExecError> for DataFusionError {
    fn from(value: ExecError) -> Self {
        match value {
            ExecError::DataFusion { msg: _, source } => source,
            _ => DataFusionError::Execution(value.to_string()),
        }
    }
}

impl ExecError {
    /// True for errors raised by the memory subsystem rather than by the data.
    pub fn is_memory_error(&self) -> bool {
        matches!(
            self,
            ExecError::ArbitrationTimeout { .. }
                | ExecError::MemoryCapExceeded { .. }
                | ExecError::Aborted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn panic_payload_to_error() {
        let result = catch_unwind(|| panic!("reclaim blew up"));
        let err: ExecError = result.unwrap_err().into();
        assert_eq!(err.to_string(), "reclaim blew up");

        let result = catch_unwind(|| std::panic::panic_any(42));
        let err: ExecError = result.unwrap_err().into();
        assert_eq!(err.to_string(), "unknown panic");
    }

    #[test]
    fn datafusion_round_trip() {
        let err: ExecError = DataFusionError::Execution("boom".to_string()).into();
        let back: DataFusionError = err.into();
        assert!(matches!(back, DataFusionError::Execution(msg) if msg == "boom"));

        let err = ExecError::ArbitrationTimeout {
            pool: "query.1".to_string(),
            timeout_ms: 10,
        };
        assert!(err.is_memory_error());
        assert!(DataFusionError::from(err).to_string().contains("query.1"));
    }
}
