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

//! IN-list filters over 64-bit integers.

use crate::error::{FilterError, FilterResult};
use crate::filters::bigint_range::{BigintRange, NegatedBigintRange};
use crate::filters::{not_null_or_true, null_or_false, Filter};

/// Sentinel marking an unused hash table slot. A value equal to the sentinel is
/// tracked out of band.
const EMPTY_MARKER: i64 = 0xdeadbeefbadefeed_u64 as i64;

/// Multiplier used to scatter values over the hash table.
const HASH_MULTIPLIER: u64 = 0xc6a4a7935bd1e995;

/// Slots replicated past the end of the table so a lane-wide load starting at
/// the last slot stays in bounds.
const PADDING_SLOTS: usize = 4;

/// Values tested together by [`BigintValuesUsingHashTable::test_values`].
const LANES: usize = 4;

/// Dense ranges up to this many values use a bitmask regardless of the value count.
const BITMASK_MIN_RANGE: i128 = 32 * 64;

/// Accepts a set of values, probed through an open-addressing hash table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigintValuesUsingHashTable {
    min: i64,
    max: i64,
    hash_table: Vec<i64>,
    contains_empty_marker: bool,
    values: Vec<i64>,
    size_mask: u64,
    null_allowed: bool,
}

impl BigintValuesUsingHashTable {
    pub fn try_new(
        min: i64,
        max: i64,
        values: Vec<i64>,
        null_allowed: bool,
    ) -> FilterResult<Self> {
        if min >= max {
            return Err(FilterError::InvalidValueRange { min, max });
        }
        if values.len() < 2 {
            return Err(FilterError::TooFewValues {
                kind: "BigintValuesUsingHashTable",
                required: 2,
                actual: values.len(),
            });
        }

        // Sized well above the entry count: the filter is expected to fail
        // often, so most probes should land on an empty slot first.
        let size = 1usize << (values.len() * 5).ilog2();
        let size_mask = (size - 1) as u64;
        let mut hash_table = vec![EMPTY_MARKER; size + PADDING_SLOTS];
        let mut contains_empty_marker = false;
        for &value in &values {
            if value == EMPTY_MARKER {
                contains_empty_marker = true;
                continue;
            }
            let position = Self::slot(value, size_mask);
            for i in position..position + size {
                let index = i & size_mask as usize;
                if hash_table[index] == EMPTY_MARKER {
                    hash_table[index] = value;
                    break;
                }
            }
        }
        for i in 0..PADDING_SLOTS {
            hash_table[size + i] = hash_table[size - 1];
        }

        let mut values = values;
        values.sort_unstable();
        Ok(Self {
            min,
            max,
            hash_table,
            contains_empty_marker,
            values,
            size_mask,
            null_allowed,
        })
    }

    #[inline]
    fn slot(value: i64, size_mask: u64) -> usize {
        ((value as u64).wrapping_mul(HASH_MULTIPLIER) & size_mask) as usize
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// The accepted values in ascending order.
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn null_allowed(&self) -> bool {
        self.null_allowed
    }

    pub fn with_null_allowed(&self, null_allowed: bool) -> Self {
        Self {
            null_allowed,
            ..self.clone()
        }
    }

    pub fn test_int64(&self, value: i64) -> bool {
        if self.contains_empty_marker && value == EMPTY_MARKER {
            return true;
        }
        if value < self.min || value > self.max {
            return false;
        }
        self.probe_from(Self::slot(value, self.size_mask), value)
    }

    /// Linear probe starting at `position` until `value` or an empty slot is found.
    #[inline]
    fn probe_from(&self, position: usize, value: i64) -> bool {
        let size = self.size_mask as usize + 1;
        for i in position..position + size {
            let slot = self.hash_table[i & self.size_mask as usize];
            if slot == EMPTY_MARKER {
                return false;
            }
            if slot == value {
                return true;
            }
        }
        false
    }

    pub fn test_int64_range(&self, min: i64, max: i64, has_null: bool) -> bool {
        if has_null && self.null_allowed {
            return true;
        }
        if min == max {
            return self.test_int64(min);
        }
        if min > self.max || max < self.min {
            return false;
        }
        let idx = self.values.partition_point(|&v| v < min);
        // min <= self.max, so some value is >= min.
        self.values.get(idx).is_some_and(|&v| v <= max)
    }

    /// Tests `values` a few lanes at a time: lanes that are out of range or hit
    /// their first slot are resolved together, and only the remaining lanes walk
    /// their probe chains.
    pub fn test_values(&self, values: &[i64], result: &mut Vec<bool>) {
        result.reserve(values.len());
        if self.contains_empty_marker {
            result.extend(values.iter().map(|&v| self.test_int64(v)));
            return;
        }
        let mut chunks = values.chunks_exact(LANES);
        for chunk in &mut chunks {
            let out_of_range = chunk.map_lanes(|v| v < self.min || v > self.max);
            if out_of_range.iter().all(|&out| out) {
                result.extend([false; LANES]);
                continue;
            }
            let mut lanes = [false; LANES];
            for lane in 0..LANES {
                if out_of_range[lane] {
                    continue;
                }
                let value = chunk[lane];
                let position = Self::slot(value, self.size_mask);
                let first = self.hash_table[position];
                lanes[lane] = if first == value {
                    true
                } else if first == EMPTY_MARKER {
                    false
                } else {
                    self.probe_from(position + 1, value)
                };
            }
            result.extend(lanes);
        }
        result.extend(chunks.remainder().iter().map(|&v| self.test_int64(v)));
    }
}

trait MapLanes {
    fn map_lanes(&self, f: impl Fn(i64) -> bool) -> [bool; LANES];
}

impl MapLanes for [i64] {
    #[inline]
    fn map_lanes(&self, f: impl Fn(i64) -> bool) -> [bool; LANES] {
        std::array::from_fn(|lane| f(self[lane]))
    }
}

/// Accepts a set of values within a small range, stored as one bit per value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigintValuesUsingBitmask {
    min: i64,
    max: i64,
    bitmask: Vec<u64>,
    null_allowed: bool,
}

impl BigintValuesUsingBitmask {
    pub fn try_new(
        min: i64,
        max: i64,
        values: &[i64],
        null_allowed: bool,
    ) -> FilterResult<Self> {
        if min >= max {
            return Err(FilterError::InvalidValueRange { min, max });
        }
        if values.len() < 2 {
            return Err(FilterError::TooFewValues {
                kind: "BigintValuesUsingBitmask",
                required: 2,
                actual: values.len(),
            });
        }
        let num_bits = (max as i128 - min as i128 + 1) as usize;
        let mut bitmask = vec![0u64; num_bits.div_ceil(64)];
        for &value in values {
            if value < min || value > max {
                return Err(FilterError::UnsupportedInput(format!(
                    "value {value} outside bitmask range [{min}, {max}]"
                )));
            }
            let index = (value as i128 - min as i128) as usize;
            bitmask[index >> 6] |= 1u64 << (index & 0x3f);
        }
        Ok(Self {
            min,
            max,
            bitmask,
            null_allowed,
        })
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn null_allowed(&self) -> bool {
        self.null_allowed
    }

    pub fn with_null_allowed(&self, null_allowed: bool) -> Self {
        Self {
            null_allowed,
            ..self.clone()
        }
    }

    /// The accepted values in ascending order.
    pub fn values(&self) -> Vec<i64> {
        (self.min..=self.max).filter(|&v| self.test_int64(v)).collect()
    }

    #[inline]
    pub fn test_int64(&self, value: i64) -> bool {
        if value < self.min || value > self.max {
            return false;
        }
        let index = (value as i128 - self.min as i128) as usize;
        (self.bitmask[index >> 6] & (1u64 << (index & 0x3f))) != 0
    }

    pub fn test_int64_range(&self, min: i64, max: i64, has_null: bool) -> bool {
        if has_null && self.null_allowed {
            return true;
        }
        if min == max {
            return self.test_int64(min);
        }
        !(min > self.max || max < self.min)
    }
}

/// Accepts every value except a set of rejected values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NegatedBigintValues {
    rejects: Vec<i64>,
    null_allowed: bool,
}

impl NegatedBigintValues {
    pub fn try_new(mut rejects: Vec<i64>, null_allowed: bool) -> FilterResult<Self> {
        rejects.sort_unstable();
        rejects.dedup();
        if rejects.len() < 2 {
            return Err(FilterError::TooFewValues {
                kind: "NegatedBigintValues",
                required: 2,
                actual: rejects.len(),
            });
        }
        Ok(Self {
            rejects,
            null_allowed,
        })
    }

    /// The rejected values in ascending order.
    pub fn rejects(&self) -> &[i64] {
        &self.rejects
    }

    pub fn null_allowed(&self) -> bool {
        self.null_allowed
    }

    pub fn with_null_allowed(&self, null_allowed: bool) -> Self {
        Self {
            null_allowed,
            ..self.clone()
        }
    }

    #[inline]
    pub fn test_int64(&self, value: i64) -> bool {
        self.rejects.binary_search(&value).is_err()
    }

    pub fn test_int64_range(&self, min: i64, max: i64, has_null: bool) -> bool {
        if has_null && self.null_allowed {
            return true;
        }
        let first = self.rejects.partition_point(|&v| v < min);
        let last = self.rejects.partition_point(|&v| v <= max);
        let rejected_in_range = (last - first) as i128;
        rejected_in_range < max as i128 - min as i128 + 1
    }
}

/// Picks the cheapest filter accepting exactly `values`.
pub fn create_bigint_values(mut values: Vec<i64>, null_allowed: bool) -> Filter {
    values.sort_unstable();
    values.dedup();
    let (min, max) = match (values.first(), values.last()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => return null_or_false(null_allowed),
    };
    if values.len() == 1 {
        return Filter::BigintRange(BigintRange::new(min, max, null_allowed));
    }
    let range = max as i128 - min as i128 + 1;
    if range == values.len() as i128 {
        return Filter::BigintRange(BigintRange::new(min, max, null_allowed));
    }
    if range < BITMASK_MIN_RANGE || range < values.len() as i128 * 4 * 64 {
        if let Ok(bitmask) = BigintValuesUsingBitmask::try_new(min, max, &values, null_allowed) {
            return Filter::BigintValuesUsingBitmask(bitmask);
        }
    }
    match BigintValuesUsingHashTable::try_new(min, max, values, null_allowed) {
        Ok(table) => Filter::BigintValuesUsingHashTable(table),
        // Unreachable: values holds two or more distinct entries, so min < max.
        Err(_) => Filter::AlwaysFalse,
    }
}

/// Picks the cheapest filter rejecting exactly `rejects`.
pub fn create_negated_bigint_values(mut rejects: Vec<i64>, null_allowed: bool) -> Filter {
    rejects.sort_unstable();
    rejects.dedup();
    let (min, max) = match (rejects.first(), rejects.last()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => return not_null_or_true(null_allowed),
    };
    if max as i128 - min as i128 + 1 == rejects.len() as i128 {
        return Filter::NegatedBigintRange(NegatedBigintRange::new(min, max, null_allowed));
    }
    Filter::NegatedBigintValues(NegatedBigintValues {
        rejects,
        null_allowed,
    })
}
