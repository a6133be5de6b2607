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

use arrow::error::ArrowError;
use datafusion::common::DataFusionError;

#[derive(thiserror::Error, Debug, Clone)]
pub enum FilterError {
    #[error("[INVALID_FILTER] BigintValuesUsingHashTable requires min < max, got min: {min}, max: {max}")]
    InvalidValueRange { min: i64, max: i64 },

    #[error("[INVALID_FILTER] {kind} requires at least {required} values, got {actual}")]
    TooFewValues {
        kind: &'static str,
        required: usize,
        actual: usize,
    },

    #[error("[INVALID_FILTER] BigintRange lower bound {lower} exceeds upper bound {upper}")]
    InvalidRange { lower: i64, upper: i64 },

    #[error("[INVALID_FILTER] BigintMultiRange ranges must be sorted and non-overlapping: {0}")]
    OverlappingRanges(String),

    #[error("[UNSUPPORTED_FILTER_INPUT] {0}")]
    UnsupportedInput(String),

    #[error("ArrowError: {0}.")]
    Arrow(String),

    #[error("Internal error: {0}.")]
    Internal(String),
}

pub type FilterResult<T> = Result<T, FilterError>;

impl From<ArrowError> for FilterError {
    fn from(value: ArrowError) -> Self {
        FilterError::Arrow(value.to_string())
    }
}

impl From<FilterError> for DataFusionError {
    fn from(value: FilterError) -> Self {
        DataFusionError::External(Box::new(value))
    }
}

impl From<FilterError> for ArrowError {
    fn from(value: FilterError) -> Self {
        ArrowError::ComputeError(value.to_string())
    }
}
