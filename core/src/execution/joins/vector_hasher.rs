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

//! Value range and distinct value tracking of join keys.

use std::collections::HashSet;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Int64Type};

use crate::errors::ExecResult;

/// Cardinality reported when the key range doesn't fit.
pub const RANGE_TOO_LARGE: u64 = u64::MAX;

/// Keys with more distinct values than this can't be mapped to value ids.
const MAX_DISTINCT: usize = 100_000;

/// Widest key range that can be mapped to value ids directly.
const MAX_RANGE: u64 = 1 << 24;

/// Tracks min, max and distinct values of one integer key column while the
/// table is built. Non-integer keys are never analyzed.
#[derive(Debug, Clone)]
pub struct VectorHasher {
    channel: usize,
    supported: bool,
    min: i64,
    max: i64,
    has_values: bool,
    distinct: HashSet<i64>,
    distinct_overflow: bool,
}

impl VectorHasher {
    pub fn new(channel: usize, data_type: &DataType) -> Self {
        let supported = matches!(
            data_type,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::Date32
        );
        Self {
            channel,
            supported,
            min: i64::MAX,
            max: i64::MIN,
            has_values: false,
            distinct: HashSet::new(),
            distinct_overflow: false,
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Adds the non-null values of `array` to the statistics. Returns
    /// whether value ids are still usable.
    pub fn analyze(&mut self, array: &ArrayRef) -> ExecResult<bool> {
        if !self.may_use_value_ids() {
            return Ok(false);
        }
        let values = cast(array, &DataType::Int64)?;
        let values = values.as_primitive::<Int64Type>();
        for i in 0..values.len() {
            if values.is_null(i) {
                continue;
            }
            let v = values.value(i);
            self.min = self.min.min(v);
            self.max = self.max.max(v);
            self.has_values = true;
            if !self.distinct_overflow {
                self.distinct.insert(v);
                if self.distinct.len() > MAX_DISTINCT {
                    self.distinct_overflow = true;
                    self.distinct = HashSet::new();
                }
            }
        }
        Ok(self.may_use_value_ids())
    }

    pub fn may_use_value_ids(&self) -> bool {
        self.supported && (!self.distinct_overflow || self.range_size() <= MAX_RANGE)
    }

    fn range_size(&self) -> u64 {
        if !self.has_values {
            return 0;
        }
        (self.max as i128 - self.min as i128 + 1).min(u64::MAX as i128) as u64
    }

    /// `(range, distinct)` cardinalities; either is [`RANGE_TOO_LARGE`] when
    /// unknown.
    pub fn cardinality(&self) -> (u64, u64) {
        if !self.supported {
            return (RANGE_TOO_LARGE, RANGE_TOO_LARGE);
        }
        let range = if self.range_size() <= MAX_RANGE {
            self.range_size()
        } else {
            RANGE_TOO_LARGE
        };
        let distinct = if self.distinct_overflow {
            RANGE_TOO_LARGE
        } else {
            self.distinct.len() as u64
        };
        (range, distinct)
    }

    /// Combines statistics gathered by another driver on the same key.
    pub fn merge(&mut self, other: &VectorHasher) {
        assert_eq!(self.channel, other.channel);
        self.supported &= other.supported;
        if other.has_values {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
            self.has_values = true;
        }
        if other.distinct_overflow {
            self.distinct_overflow = true;
        }
        if !self.distinct_overflow {
            self.distinct.extend(other.distinct.iter().copied());
            if self.distinct.len() > MAX_DISTINCT {
                self.distinct_overflow = true;
            }
        }
        if self.distinct_overflow {
            self.distinct = HashSet::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use std::sync::Arc;

    #[test]
    fn tracks_range_and_distinct() {
        let mut hasher = VectorHasher::new(0, &DataType::Int32);
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(5), None, Some(9), Some(5)]));
        assert!(hasher.analyze(&array).unwrap());
        assert_eq!(hasher.cardinality(), (5, 2));

        let mut other = VectorHasher::new(0, &DataType::Int32);
        let array: ArrayRef = Arc::new(Int32Array::from(vec![-1]));
        other.analyze(&array).unwrap();
        hasher.merge(&other);
        assert_eq!(hasher.cardinality(), (11, 3));
    }

    #[test]
    fn strings_are_not_analyzed() {
        let mut hasher = VectorHasher::new(1, &DataType::Utf8);
        let array: ArrayRef = Arc::new(StringArray::from(vec!["a"]));
        assert!(!hasher.analyze(&array).unwrap());
        assert_eq!(hasher.cardinality(), (RANGE_TOO_LARGE, RANGE_TOO_LARGE));
    }

    #[test]
    fn wide_sparse_keys_give_up() {
        let mut hasher = VectorHasher::new(0, &DataType::Int64);
        let values: Vec<i64> = (0..(MAX_DISTINCT as i64 + 1)).map(|i| i * 1000).collect();
        let array: ArrayRef = Arc::new(arrow::array::Int64Array::from(values));
        assert!(!hasher.analyze(&array).unwrap());
        assert_eq!(hasher.cardinality(), (RANGE_TOO_LARGE, RANGE_TOO_LARGE));
    }
}
