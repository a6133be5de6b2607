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

//! Single-column filters over 64-bit integers.
//!
//! Filters are pushed down into scans and into hash join probes as dynamic
//! filters. Two filters on the same column are combined with
//! [`Filter::merge_with`], which returns the tightest filter accepting exactly
//! the values both accept. Merging is commutative.

mod bigint_range;
mod bigint_values;

use arrow::array::{Array, BooleanArray, Int64Array};

pub use bigint_range::{BigintMultiRange, BigintRange, NegatedBigintRange};
pub use bigint_values::{
    create_bigint_values, create_negated_bigint_values, BigintValuesUsingBitmask,
    BigintValuesUsingHashTable, NegatedBigintValues,
};

use bigint_range::{combine_bigint_ranges, intersect_ranges, subtract_values};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    AlwaysTrue,
    AlwaysFalse,
    IsNull,
    IsNotNull,
    BigintRange(BigintRange),
    NegatedBigintRange(NegatedBigintRange),
    BigintValuesUsingHashTable(BigintValuesUsingHashTable),
    BigintValuesUsingBitmask(BigintValuesUsingBitmask),
    NegatedBigintValues(NegatedBigintValues),
    BigintMultiRange(BigintMultiRange),
}

/// `IsNull` if nulls pass, otherwise `AlwaysFalse`.
pub fn null_or_false(null_allowed: bool) -> Filter {
    if null_allowed {
        Filter::IsNull
    } else {
        Filter::AlwaysFalse
    }
}

/// `AlwaysTrue` if nulls pass, otherwise `IsNotNull`.
pub fn not_null_or_true(null_allowed: bool) -> Filter {
    if null_allowed {
        Filter::AlwaysTrue
    } else {
        Filter::IsNotNull
    }
}

impl Filter {
    pub fn test_null(&self) -> bool {
        match self {
            Filter::AlwaysTrue | Filter::IsNull => true,
            Filter::AlwaysFalse | Filter::IsNotNull => false,
            Filter::BigintRange(f) => f.null_allowed(),
            Filter::NegatedBigintRange(f) => f.null_allowed(),
            Filter::BigintValuesUsingHashTable(f) => f.null_allowed(),
            Filter::BigintValuesUsingBitmask(f) => f.null_allowed(),
            Filter::NegatedBigintValues(f) => f.null_allowed(),
            Filter::BigintMultiRange(f) => f.null_allowed(),
        }
    }

    pub fn test_int64(&self, value: i64) -> bool {
        match self {
            Filter::AlwaysTrue | Filter::IsNotNull => true,
            Filter::AlwaysFalse | Filter::IsNull => false,
            Filter::BigintRange(f) => f.test_int64(value),
            Filter::NegatedBigintRange(f) => f.test_int64(value),
            Filter::BigintValuesUsingHashTable(f) => f.test_int64(value),
            Filter::BigintValuesUsingBitmask(f) => f.test_int64(value),
            Filter::NegatedBigintValues(f) => f.test_int64(value),
            Filter::BigintMultiRange(f) => f.test_int64(value),
        }
    }

    /// Returns false only if no value in `[min, max]` (or null, when `has_null`)
    /// can pass. Used to skip whole row groups or batches from their statistics.
    pub fn test_int64_range(&self, min: i64, max: i64, has_null: bool) -> bool {
        match self {
            Filter::AlwaysTrue | Filter::IsNotNull => true,
            Filter::AlwaysFalse => false,
            Filter::IsNull => has_null,
            Filter::BigintRange(f) => f.test_int64_range(min, max, has_null),
            Filter::NegatedBigintRange(f) => f.test_int64_range(min, max, has_null),
            Filter::BigintValuesUsingHashTable(f) => f.test_int64_range(min, max, has_null),
            Filter::BigintValuesUsingBitmask(f) => f.test_int64_range(min, max, has_null),
            Filter::NegatedBigintValues(f) => f.test_int64_range(min, max, has_null),
            Filter::BigintMultiRange(f) => f.test_int64_range(min, max, has_null),
        }
    }

    /// Tests a run of non-null values, appending one result per value.
    pub fn test_values(&self, values: &[i64], result: &mut Vec<bool>) {
        match self {
            Filter::BigintValuesUsingHashTable(f) => f.test_values(values, result),
            _ => result.extend(values.iter().map(|&v| self.test_int64(v))),
        }
    }

    /// Evaluates the filter over an Arrow column. Null slots pass iff the filter
    /// accepts nulls.
    pub fn evaluate(&self, array: &Int64Array) -> BooleanArray {
        let mut passed = Vec::with_capacity(array.len());
        self.test_values(array.values(), &mut passed);
        if let Some(nulls) = array.nulls() {
            let null_passes = self.test_null();
            for (i, pass) in passed.iter_mut().enumerate() {
                if nulls.is_null(i) {
                    *pass = null_passes;
                }
            }
        }
        BooleanArray::from(passed)
    }

    /// Copy of this filter with a different null policy. Filters whose kind fixes
    /// the null policy are returned unchanged.
    pub fn with_null_allowed(&self, null_allowed: bool) -> Filter {
        match self {
            Filter::AlwaysTrue | Filter::AlwaysFalse | Filter::IsNull | Filter::IsNotNull => {
                self.clone()
            }
            Filter::BigintRange(f) => Filter::BigintRange(f.with_null_allowed(null_allowed)),
            Filter::NegatedBigintRange(f) => {
                Filter::NegatedBigintRange(f.with_null_allowed(null_allowed))
            }
            Filter::BigintValuesUsingHashTable(f) => {
                Filter::BigintValuesUsingHashTable(f.with_null_allowed(null_allowed))
            }
            Filter::BigintValuesUsingBitmask(f) => {
                Filter::BigintValuesUsingBitmask(f.with_null_allowed(null_allowed))
            }
            Filter::NegatedBigintValues(f) => {
                Filter::NegatedBigintValues(f.with_null_allowed(null_allowed))
            }
            Filter::BigintMultiRange(f) => {
                Filter::BigintMultiRange(f.with_null_allowed(null_allowed))
            }
        }
    }

    /// Returns the tightest filter accepting exactly the values (and nulls)
    /// accepted by both `self` and `other`.
    pub fn merge_with(&self, other: &Filter) -> Filter {
        match self {
            Filter::AlwaysTrue => other.clone(),
            Filter::AlwaysFalse => Filter::AlwaysFalse,
            Filter::IsNull => match other {
                Filter::AlwaysTrue | Filter::IsNull => Filter::IsNull,
                Filter::AlwaysFalse | Filter::IsNotNull => Filter::AlwaysFalse,
                _ => null_or_false(other.test_null()),
            },
            Filter::IsNotNull => match other {
                Filter::AlwaysTrue | Filter::IsNotNull => Filter::IsNotNull,
                Filter::AlwaysFalse | Filter::IsNull => Filter::AlwaysFalse,
                _ => other.with_null_allowed(false),
            },
            _ => match other {
                Filter::AlwaysTrue | Filter::AlwaysFalse | Filter::IsNull => {
                    other.merge_with(self)
                }
                Filter::IsNotNull => self.with_null_allowed(false),
                _ => merge_bigint_filters(self, other),
            },
        }
    }

    /// Closed intervals accepted by a range-shaped filter.
    fn accepted_ranges(&self) -> Option<Vec<(i64, i64)>> {
        match self {
            Filter::BigintRange(f) => Some(vec![(f.lower(), f.upper())]),
            Filter::NegatedBigintRange(f) => Some(f.accepted_ranges()),
            Filter::BigintMultiRange(f) => Some(f.accepted_ranges()),
            _ => None,
        }
    }

    /// Accepted values of an IN-list filter.
    fn accepted_values(&self) -> Option<Vec<i64>> {
        match self {
            Filter::BigintValuesUsingHashTable(f) => Some(f.values().to_vec()),
            Filter::BigintValuesUsingBitmask(f) => Some(f.values()),
            _ => None,
        }
    }
}

/// Merges two value-testing filters.
fn merge_bigint_filters(left: &Filter, right: &Filter) -> Filter {
    let null_allowed = left.test_null() && right.test_null();

    // An IN-list intersected with anything is the subset of its values the other
    // side accepts.
    if let Some(values) = left.accepted_values() {
        return keep_accepted(values, right, null_allowed);
    }
    if let Some(values) = right.accepted_values() {
        return keep_accepted(values, left, null_allowed);
    }

    match (left, right) {
        (Filter::NegatedBigintValues(l), Filter::NegatedBigintValues(r)) => {
            let mut rejects = l.rejects().to_vec();
            rejects.extend_from_slice(r.rejects());
            create_negated_bigint_values(rejects, null_allowed)
        }
        (Filter::NegatedBigintValues(negated), ranged)
        | (ranged, Filter::NegatedBigintValues(negated)) => {
            let ranges = ranged.accepted_ranges().unwrap_or_default();
            combine_bigint_ranges(subtract_values(&ranges, negated.rejects()), null_allowed)
        }
        _ => {
            let l = left.accepted_ranges().unwrap_or_default();
            let r = right.accepted_ranges().unwrap_or_default();
            combine_bigint_ranges(intersect_ranges(&l, &r), null_allowed)
        }
    }
}

fn keep_accepted(values: Vec<i64>, other: &Filter, null_allowed: bool) -> Filter {
    let kept = values.into_iter().filter(|&v| other.test_int64(v)).collect();
    create_bigint_values(kept, null_allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lower: i64, upper: i64) -> Filter {
        Filter::BigintRange(BigintRange::new(lower, upper, false))
    }

    fn assert_merge(left: &Filter, right: &Filter, expected: &Filter) {
        assert_eq!(&left.merge_with(right), expected, "{left:?} merge {right:?}");
        assert_eq!(&right.merge_with(left), expected, "{right:?} merge {left:?}");
    }

    #[test]
    fn merge_overlapping_ranges() {
        assert_merge(&range(5, 10), &range(8, 20), &range(8, 10));
    }

    #[test]
    fn merge_disjoint_ranges() {
        assert_merge(&range(1, 4), &range(5, 10), &Filter::AlwaysFalse);
        let nullable = Filter::BigintRange(BigintRange::new(1, 4, true));
        let other = Filter::BigintRange(BigintRange::new(5, 10, true));
        assert_merge(&nullable, &other, &Filter::IsNull);
    }

    #[test]
    fn merge_nested_ranges_is_tightest() {
        assert_merge(&range(0, 100), &range(40, 60), &range(40, 60));
        assert_merge(&range(7, 7), &range(0, 10), &range(7, 7));
    }

    #[test]
    fn merge_null_policy() {
        let nullable = Filter::BigintRange(BigintRange::new(5, 10, true));
        assert_merge(&nullable, &Filter::IsNotNull, &range(5, 10));
        assert_merge(&nullable, &Filter::IsNull, &Filter::IsNull);
        assert_merge(&range(5, 10), &Filter::IsNull, &Filter::AlwaysFalse);
        assert_merge(&range(5, 10), &Filter::AlwaysTrue, &range(5, 10));
        assert_merge(&range(5, 10), &Filter::AlwaysFalse, &Filter::AlwaysFalse);
        assert_merge(&Filter::IsNull, &Filter::IsNotNull, &Filter::AlwaysFalse);
    }

    #[test]
    fn merge_range_with_negated_range() {
        let negated = Filter::NegatedBigintRange(NegatedBigintRange::new(4, 6, false));
        let expected = Filter::BigintMultiRange(
            BigintMultiRange::try_new(
                vec![BigintRange::new(0, 3, false), BigintRange::new(7, 10, false)],
                false,
            )
            .unwrap(),
        );
        assert_merge(&range(0, 10), &negated, &expected);
        assert_merge(&range(0, 5), &negated, &range(0, 3));
        assert_merge(&range(4, 6), &negated, &Filter::AlwaysFalse);
    }

    #[test]
    fn merge_negated_ranges() {
        let a = Filter::NegatedBigintRange(NegatedBigintRange::new(4, 6, false));
        let b = Filter::NegatedBigintRange(NegatedBigintRange::new(5, 9, false));
        assert_merge(
            &a,
            &b,
            &Filter::NegatedBigintRange(NegatedBigintRange::new(4, 9, false)),
        );
    }

    #[test]
    fn merge_values_with_range() {
        let values = create_bigint_values(vec![1, 5, 9, 200], false);
        assert_merge(
            &values,
            &range(4, 100),
            &create_bigint_values(vec![5, 9], false),
        );
        assert_merge(&values, &range(6, 8), &Filter::AlwaysFalse);
        assert_merge(&values, &range(9, 9), &range(9, 9));
    }

    #[test]
    fn merge_values_with_values() {
        let a = create_bigint_values(vec![1, 1 << 40, 7], false);
        let b = create_bigint_values(vec![7, 1 << 40, 12], false);
        assert_merge(&a, &b, &create_bigint_values(vec![7, 1 << 40], false));
    }

    #[test]
    fn merge_negated_values() {
        let negated = create_negated_bigint_values(vec![3, 7], false);
        let expected = Filter::BigintMultiRange(
            BigintMultiRange::try_new(
                vec![
                    BigintRange::new(0, 2, false),
                    BigintRange::new(4, 6, false),
                    BigintRange::new(8, 10, false),
                ],
                false,
            )
            .unwrap(),
        );
        assert_merge(&negated, &range(0, 10), &expected);

        let other = create_negated_bigint_values(vec![9, 11], false);
        assert_merge(
            &negated,
            &other,
            &create_negated_bigint_values(vec![3, 7, 9, 11], false),
        );
        let values = create_bigint_values(vec![3, 4, 100], false);
        assert_merge(&negated, &values, &create_bigint_values(vec![4, 100], false));
    }

    #[test]
    fn merge_multi_range() {
        let multi = Filter::BigintMultiRange(
            BigintMultiRange::try_new(
                vec![BigintRange::new(0, 10, false), BigintRange::new(20, 30, false)],
                false,
            )
            .unwrap(),
        );
        assert_merge(&multi, &range(5, 25), &Filter::BigintMultiRange(
            BigintMultiRange::try_new(
                vec![BigintRange::new(5, 10, false), BigintRange::new(20, 25, false)],
                false,
            )
            .unwrap(),
        ));
        assert_merge(&multi, &range(12, 18), &Filter::AlwaysFalse);
        assert_merge(&multi, &range(25, 40), &range(25, 30));
    }

    #[test]
    fn evaluate_arrow_column() {
        let column = Int64Array::from(vec![Some(4), None, Some(8), Some(12)]);
        let result = range(5, 10).evaluate(&column);
        assert_eq!(result, BooleanArray::from(vec![false, false, true, false]));

        let nullable = Filter::BigintRange(BigintRange::new(5, 10, true));
        let result = nullable.evaluate(&column);
        assert_eq!(result, BooleanArray::from(vec![false, true, true, false]));
    }
}
