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

use crate::error::{FilterError, FilterResult};
use crate::filters::{null_or_false, Filter};

/// Accepts integers in the closed interval `[lower, upper]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigintRange {
    lower: i64,
    upper: i64,
    null_allowed: bool,
}

impl BigintRange {
    /// Creates a new range. Panics if `lower > upper`; use [`Self::try_new`] for
    /// untrusted bounds.
    pub fn new(lower: i64, upper: i64, null_allowed: bool) -> Self {
        assert!(
            lower <= upper,
            "BigintRange lower bound {lower} exceeds upper bound {upper}"
        );
        Self {
            lower,
            upper,
            null_allowed,
        }
    }

    pub fn try_new(lower: i64, upper: i64, null_allowed: bool) -> FilterResult<Self> {
        if lower > upper {
            return Err(FilterError::InvalidRange { lower, upper });
        }
        Ok(Self {
            lower,
            upper,
            null_allowed,
        })
    }

    pub fn lower(&self) -> i64 {
        self.lower
    }

    pub fn upper(&self) -> i64 {
        self.upper
    }

    pub fn null_allowed(&self) -> bool {
        self.null_allowed
    }

    pub fn is_single_value(&self) -> bool {
        self.lower == self.upper
    }

    pub fn with_null_allowed(&self, null_allowed: bool) -> Self {
        Self {
            null_allowed,
            ..self.clone()
        }
    }

    #[inline]
    pub fn test_int64(&self, value: i64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn test_int64_range(&self, min: i64, max: i64, has_null: bool) -> bool {
        if has_null && self.null_allowed {
            return true;
        }
        !(min > self.upper || max < self.lower)
    }
}

/// Accepts integers outside the closed interval `[lower, upper]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NegatedBigintRange {
    lower: i64,
    upper: i64,
    null_allowed: bool,
}

impl NegatedBigintRange {
    pub fn new(lower: i64, upper: i64, null_allowed: bool) -> Self {
        assert!(
            lower <= upper,
            "NegatedBigintRange lower bound {lower} exceeds upper bound {upper}"
        );
        Self {
            lower,
            upper,
            null_allowed,
        }
    }

    pub fn try_new(lower: i64, upper: i64, null_allowed: bool) -> FilterResult<Self> {
        if lower > upper {
            return Err(FilterError::InvalidRange { lower, upper });
        }
        Ok(Self {
            lower,
            upper,
            null_allowed,
        })
    }

    pub fn lower(&self) -> i64 {
        self.lower
    }

    pub fn upper(&self) -> i64 {
        self.upper
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
        value < self.lower || value > self.upper
    }

    pub fn test_int64_range(&self, min: i64, max: i64, has_null: bool) -> bool {
        if has_null && self.null_allowed {
            return true;
        }
        !(min >= self.lower && max <= self.upper)
    }

    /// The accepted values as sorted disjoint closed intervals.
    pub(crate) fn accepted_ranges(&self) -> Vec<(i64, i64)> {
        let mut ranges = Vec::with_capacity(2);
        if self.lower > i64::MIN {
            ranges.push((i64::MIN, self.lower - 1));
        }
        if self.upper < i64::MAX {
            ranges.push((self.upper + 1, i64::MAX));
        }
        ranges
    }
}

/// Union of two or more sorted, non-overlapping ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigintMultiRange {
    ranges: Vec<BigintRange>,
    lower_bounds: Vec<i64>,
    null_allowed: bool,
}

impl BigintMultiRange {
    pub fn try_new(ranges: Vec<BigintRange>, null_allowed: bool) -> FilterResult<Self> {
        if ranges.len() < 2 {
            return Err(FilterError::TooFewValues {
                kind: "BigintMultiRange",
                required: 2,
                actual: ranges.len(),
            });
        }
        for pair in ranges.windows(2) {
            if pair[1].lower <= pair[0].upper {
                return Err(FilterError::OverlappingRanges(format!(
                    "[{}, {}] and [{}, {}]",
                    pair[0].lower, pair[0].upper, pair[1].lower, pair[1].upper
                )));
            }
        }
        let lower_bounds = ranges.iter().map(|r| r.lower).collect();
        Ok(Self {
            ranges,
            lower_bounds,
            null_allowed,
        })
    }

    pub fn ranges(&self) -> &[BigintRange] {
        &self.ranges
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
        // Index of the last range whose lower bound is <= value.
        let idx = self.lower_bounds.partition_point(|&lower| lower <= value);
        idx > 0 && self.ranges[idx - 1].test_int64(value)
    }

    pub fn test_int64_range(&self, min: i64, max: i64, has_null: bool) -> bool {
        if has_null && self.null_allowed {
            return true;
        }
        self.ranges
            .iter()
            .any(|range| range.test_int64_range(min, max, false))
    }

    pub(crate) fn accepted_ranges(&self) -> Vec<(i64, i64)> {
        self.ranges.iter().map(|r| (r.lower, r.upper)).collect()
    }
}

/// Builds the tightest filter accepting exactly `ranges`, which must be sorted and
/// disjoint.
pub(crate) fn combine_bigint_ranges(ranges: Vec<(i64, i64)>, null_allowed: bool) -> Filter {
    match ranges.as_slice() {
        [] => null_or_false(null_allowed),
        [(lower, upper)] => Filter::BigintRange(BigintRange {
            lower: *lower,
            upper: *upper,
            null_allowed,
        }),
        // A hole in the middle of the domain is a negated range.
        [(i64::MIN, first_upper), (second_lower, i64::MAX)] => {
            Filter::NegatedBigintRange(NegatedBigintRange {
                lower: first_upper + 1,
                upper: second_lower - 1,
                null_allowed,
            })
        }
        _ => {
            let ranges = ranges
                .into_iter()
                .map(|(lower, upper)| BigintRange {
                    lower,
                    upper,
                    null_allowed: false,
                })
                .collect::<Vec<_>>();
            let lower_bounds = ranges.iter().map(|r| r.lower).collect();
            Filter::BigintMultiRange(BigintMultiRange {
                ranges,
                lower_bounds,
                null_allowed,
            })
        }
    }
}

/// Intersects two sorted lists of disjoint closed intervals.
pub(crate) fn intersect_ranges(left: &[(i64, i64)], right: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        let lower = left[i].0.max(right[j].0);
        let upper = left[i].1.min(right[j].1);
        if lower <= upper {
            result.push((lower, upper));
        }
        if left[i].1 < right[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}

/// Removes the sorted `rejects` from the sorted disjoint `ranges`, splitting ranges
/// around each rejected value.
pub(crate) fn subtract_values(ranges: &[(i64, i64)], rejects: &[i64]) -> Vec<(i64, i64)> {
    let mut result = Vec::new();
    for &(lower, upper) in ranges {
        // Widened so that stepping past i64::MAX cannot overflow.
        let mut start = lower as i128;
        let first = rejects.partition_point(|&v| v < lower);
        for &reject in rejects[first..].iter().take_while(|&&v| v <= upper) {
            if reject as i128 > start {
                result.push((start as i64, reject - 1));
            }
            start = reject as i128 + 1;
        }
        if start <= upper as i128 {
            result.push((start as i64, upper));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds() {
        let range = BigintRange::new(5, 10, false);
        assert!(range.test_int64(5));
        assert!(range.test_int64(10));
        assert!(!range.test_int64(4));
        assert!(!range.test_int64(11));
        assert!(range.test_int64_range(0, 5, false));
        assert!(!range.test_int64_range(11, 20, false));
        assert!(BigintRange::try_new(3, 2, false).is_err());
    }

    #[test]
    fn negated_range_edges() {
        let negated = NegatedBigintRange::new(i64::MIN, 0, false);
        assert_eq!(negated.accepted_ranges(), vec![(1, i64::MAX)]);
        assert!(!negated.test_int64(i64::MIN));
        assert!(negated.test_int64(1));
        assert!(!negated.test_int64_range(-5, 0, false));
        assert!(negated.test_int64_range(-5, 1, false));
    }

    #[test]
    fn multi_range_lookup() {
        let multi = BigintMultiRange::try_new(
            vec![BigintRange::new(1, 3, false), BigintRange::new(10, 12, false)],
            false,
        )
        .unwrap();
        assert!(multi.test_int64(2));
        assert!(multi.test_int64(10));
        assert!(!multi.test_int64(5));
        assert!(!multi.test_int64(0));
        assert!(!multi.test_int64(13));
        assert!(multi.test_int64_range(4, 10, false));
        assert!(!multi.test_int64_range(4, 9, false));

        let overlapping = BigintMultiRange::try_new(
            vec![BigintRange::new(1, 5, false), BigintRange::new(5, 12, false)],
            false,
        );
        assert!(overlapping.is_err());
    }

    #[test]
    fn subtract_splits_ranges() {
        assert_eq!(
            subtract_values(&[(1, 10)], &[1, 5, 10]),
            vec![(2, 4), (6, 9)]
        );
        assert_eq!(subtract_values(&[(1, 3)], &[7]), vec![(1, 3)]);
        assert_eq!(
            subtract_values(&[(i64::MAX - 2, i64::MAX)], &[i64::MAX]),
            vec![(i64::MAX - 2, i64::MAX - 1)]
        );
    }

    #[test]
    fn intersect_interleaved() {
        assert_eq!(
            intersect_ranges(&[(0, 5), (10, 20)], &[(3, 12), (18, 30)]),
            vec![(3, 5), (10, 12), (18, 20)]
        );
    }
}
