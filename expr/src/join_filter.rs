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

//! Helpers for residual (non-equi) join filters expressed as DataFusion
//! physical expressions.

use std::sync::Arc;

use arrow::array::{AsArray, BooleanArray};
use arrow::record_batch::RecordBatch;
use datafusion::logical_expr::Operator;
use datafusion::physical_expr::expressions::{
    BinaryExpr, CastExpr, Column, Literal, NegativeExpr, NotExpr,
};
use datafusion::physical_expr::utils::collect_columns;
use datafusion::physical_expr::PhysicalExpr;

use crate::error::{FilterError, FilterResult};

/// Returns true if the expression evaluates to null whenever any column it
/// references is null. Rows with a null in such a column can never pass the
/// filter.
pub fn filter_propagates_nulls(expr: &Arc<dyn PhysicalExpr>) -> bool {
    let any = expr.as_any();
    if any.is::<Column>() || any.is::<Literal>() {
        return true;
    }
    if let Some(binary) = any.downcast_ref::<BinaryExpr>() {
        return match binary.op() {
            Operator::Eq
            | Operator::NotEq
            | Operator::Lt
            | Operator::LtEq
            | Operator::Gt
            | Operator::GtEq
            | Operator::Plus
            | Operator::Minus
            | Operator::Multiply
            | Operator::Divide
            | Operator::Modulo => {
                filter_propagates_nulls(binary.left()) && filter_propagates_nulls(binary.right())
            }
            _ => false,
        };
    }
    if let Some(cast) = any.downcast_ref::<CastExpr>() {
        return filter_propagates_nulls(cast.expr());
    }
    if let Some(negative) = any.downcast_ref::<NegativeExpr>() {
        return filter_propagates_nulls(negative.arg());
    }
    if let Some(not) = any.downcast_ref::<NotExpr>() {
        return filter_propagates_nulls(not.arg());
    }
    false
}

/// Sorted indices of the input columns the expression reads.
pub fn referenced_columns(expr: &Arc<dyn PhysicalExpr>) -> Vec<usize> {
    let mut indices: Vec<usize> = collect_columns(expr)
        .iter()
        .map(|column| column.index())
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Evaluates a boolean filter over `batch`. Null results are returned as null;
/// callers treat them as not passing.
pub fn evaluate_filter(
    expr: &Arc<dyn PhysicalExpr>,
    batch: &RecordBatch,
) -> FilterResult<BooleanArray> {
    let value = expr
        .evaluate(batch)
        .map_err(|e| FilterError::Internal(e.to_string()))?;
    let array = value
        .into_array(batch.num_rows())
        .map_err(|e| FilterError::Internal(e.to_string()))?;
    array
        .as_boolean_opt()
        .cloned()
        .ok_or_else(|| {
            FilterError::UnsupportedInput(format!(
                "join filter must produce booleans, got {}",
                array.data_type()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use datafusion::common::ScalarValue;
    use datafusion::physical_expr::expressions::{binary, col, lit, IsNullExpr};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
        ])
    }

    #[test]
    fn comparison_propagates_nulls() {
        let schema = schema();
        let expr = binary(
            col("a", &schema).unwrap(),
            Operator::Lt,
            col("b", &schema).unwrap(),
            &schema,
        )
        .unwrap();
        assert!(filter_propagates_nulls(&expr));
        assert_eq!(referenced_columns(&expr), vec![0, 1]);
    }

    #[test]
    fn or_and_is_null_do_not_propagate() {
        let schema = schema();
        let lt = binary(
            col("a", &schema).unwrap(),
            Operator::Lt,
            lit(ScalarValue::Int64(Some(3))),
            &schema,
        )
        .unwrap();
        let is_null: Arc<dyn PhysicalExpr> =
            Arc::new(IsNullExpr::new(col("b", &schema).unwrap()));
        let or = binary(Arc::clone(&lt), Operator::Or, is_null, &schema).unwrap();
        assert!(filter_propagates_nulls(&lt));
        assert!(!filter_propagates_nulls(&or));
    }

    #[test]
    fn evaluate_to_booleans() {
        let schema = Arc::new(schema());
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None, Some(5)])),
                Arc::new(Int64Array::from(vec![2, 2, 2])),
            ],
        )
        .unwrap();
        let expr = binary(
            col("a", &schema).unwrap(),
            Operator::Lt,
            col("b", &schema).unwrap(),
            &schema,
        )
        .unwrap();
        let result = evaluate_filter(&expr, &batch).unwrap();
        assert!(result.value(0));
        assert!(result.is_null(1));
        assert!(!result.value(2));

        let not_boolean = col("a", &schema).unwrap();
        assert!(evaluate_filter(&not_boolean, &batch).is_err());
    }
}
