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

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::errors::{JoinError, JoinResult};
use crate::execution::hash::is_supported_key_type;
use crate::execution::spill::codec::check_spillable;
use crate::execution::operators::resilient_join::simple_join::{
    ColumnRef, JoinContext, JoinPredicate, JoinType, RowPredicate,
};
use crate::execution::tuple::Tuple;

/// What to join and what to produce.
///
/// `on` pairs an outer column with an inner column. Output rows are laid out
/// by `projection`, which defaults to outer ++ inner columns for inner and
/// left joins and to the outer columns alone otherwise.
#[derive(Clone)]
pub struct JoinDefinition {
    pub join_type: JoinType,
    pub outer_schema: SchemaRef,
    pub inner_schema: SchemaRef,
    pub on: Vec<(usize, usize)>,
    /// Keys compare with IS NOT DISTINCT FROM semantics.
    pub null_equals_null: bool,
    /// Evaluated with key equality; a failing pair is no match.
    pub join_filter: Option<RowPredicate>,
    /// Applied to matched rows before they are produced.
    pub output_filter: Option<RowPredicate>,
    pub projection: Option<Vec<ColumnRef>>,
}

impl JoinDefinition {
    pub fn new(
        join_type: JoinType,
        outer_schema: SchemaRef,
        inner_schema: SchemaRef,
        on: Vec<(usize, usize)>,
    ) -> Self {
        Self {
            join_type,
            outer_schema,
            inner_schema,
            on,
            null_equals_null: false,
            join_filter: None,
            output_filter: None,
            projection: None,
        }
    }

    pub fn with_null_equals_null(mut self, null_equals_null: bool) -> Self {
        self.null_equals_null = null_equals_null;
        self
    }

    pub fn with_join_filter(mut self, filter: RowPredicate) -> Self {
        self.join_filter = Some(filter);
        self
    }

    pub fn with_output_filter(mut self, filter: RowPredicate) -> Self {
        self.output_filter = Some(filter);
        self
    }

    pub fn with_projection(mut self, projection: Vec<ColumnRef>) -> Self {
        self.projection = Some(projection);
        self
    }

    /// The output columns, defaults applied.
    pub fn output_columns(&self) -> Vec<ColumnRef> {
        if let Some(projection) = &self.projection {
            return projection.clone();
        }
        let outer = (0..self.outer_schema.fields().len()).map(ColumnRef::Outer);
        match self.join_type {
            JoinType::Inner | JoinType::Left => outer
                .chain((0..self.inner_schema.fields().len()).map(ColumnRef::Inner))
                .collect(),
            JoinType::Semi | JoinType::Anti | JoinType::NotIn => outer.collect(),
        }
    }

    pub fn validate(&self) -> JoinResult<()> {
        if self.on.is_empty() {
            return Err(JoinError::Config(
                "A resilient join needs at least one equi-join key".to_string(),
            ));
        }
        let outer_fields = self.outer_schema.fields();
        let inner_fields = self.inner_schema.fields();
        for &(outer, inner) in &self.on {
            let (Some(outer_field), Some(inner_field)) = (outer_fields.get(outer), inner_fields.get(inner))
            else {
                return Err(JoinError::Config(format!(
                    "Join key ({outer}, {inner}) is out of range for {} outer and {} inner columns",
                    outer_fields.len(),
                    inner_fields.len()
                )));
            };
            for field in [outer_field, inner_field] {
                if !is_supported_key_type(field.data_type()) {
                    return Err(JoinError::Config(format!(
                        "Unsupported join key type {} for column {}",
                        field.data_type(),
                        field.name()
                    )));
                }
            }
            if outer_field.data_type() != inner_field.data_type() {
                return Err(JoinError::Config(format!(
                    "Join key types differ: {} is {} but {} is {}",
                    outer_field.name(),
                    outer_field.data_type(),
                    inner_field.name(),
                    inner_field.data_type()
                )));
            }
        }
        // every row may end up in a spill file
        for field in outer_fields.iter().chain(inner_fields.iter()) {
            check_spillable(field.data_type())?;
        }
        for column in self.output_columns() {
            let in_range = match column {
                ColumnRef::Outer(i) => i < outer_fields.len(),
                ColumnRef::Inner(i) => i < inner_fields.len(),
            };
            if !in_range {
                return Err(JoinError::Config(format!(
                    "Projected column {column:?} is out of range"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn context(&self) -> JoinResult<Arc<JoinContext>> {
        Ok(Arc::new(JoinContext {
            join_type: self.join_type,
            predicate: Arc::new(JoinPredicate {
                on: self.on.clone(),
                null_equals_null: self.null_equals_null,
                filter: self.join_filter.clone(),
            }),
            output_filter: self.output_filter.clone(),
            projection: self.output_columns(),
            null_inner: Tuple::nulls_for(&self.inner_schema)?,
        }))
    }

    pub(crate) fn outer_keys(&self) -> Vec<usize> {
        self.on.iter().map(|(outer, _)| *outer).collect()
    }

    pub(crate) fn inner_keys(&self) -> Vec<usize> {
        self.on.iter().map(|(_, inner)| *inner).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema(types: &[DataType]) -> SchemaRef {
        Arc::new(Schema::new(
            types
                .iter()
                .enumerate()
                .map(|(i, t)| Field::new(format!("c{i}"), t.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn default_projection_depends_on_join_type() {
        let outer = schema(&[DataType::Int64, DataType::Utf8]);
        let inner = schema(&[DataType::Int64]);
        let left = JoinDefinition::new(JoinType::Left, Arc::clone(&outer), Arc::clone(&inner), vec![(0, 0)]);
        assert_eq!(
            left.output_columns(),
            vec![ColumnRef::Outer(0), ColumnRef::Outer(1), ColumnRef::Inner(0)]
        );
        let anti = JoinDefinition::new(JoinType::NotIn, outer, inner, vec![(0, 0)]);
        assert_eq!(anti.output_columns(), vec![ColumnRef::Outer(0), ColumnRef::Outer(1)]);
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let outer = schema(&[DataType::Int64]);
        let inner = schema(&[DataType::Int64, DataType::new_list(DataType::Int32, true)]);
        let cases = [
            JoinDefinition::new(JoinType::Inner, Arc::clone(&outer), Arc::clone(&inner), vec![]),
            JoinDefinition::new(JoinType::Inner, Arc::clone(&outer), Arc::clone(&inner), vec![(1, 0)]),
            JoinDefinition::new(JoinType::Inner, Arc::clone(&outer), Arc::clone(&inner), vec![(0, 1)]),
            JoinDefinition::new(JoinType::Inner, Arc::clone(&outer), Arc::clone(&inner), vec![(0, 0)])
                .with_projection(vec![ColumnRef::Inner(2)]),
        ];
        for definition in cases {
            assert!(matches!(definition.validate(), Err(JoinError::Config(_))));
        }
        let valid = JoinDefinition::new(JoinType::Inner, outer, inner, vec![(0, 0)]);
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn key_types_must_match() {
        let outer = schema(&[DataType::Int32]);
        let inner = schema(&[DataType::Int64]);
        let mismatched = JoinDefinition::new(JoinType::Inner, outer, inner, vec![(0, 0)]);
        let Err(JoinError::Config(msg)) = mismatched.validate() else {
            panic!("Int32 = Int64 keys must be rejected");
        };
        assert!(msg.contains("Join key types differ"), "{msg}");

        let views = schema(&[DataType::Utf8View, DataType::Decimal128(10, 2)]);
        let same = JoinDefinition::new(JoinType::Inner, Arc::clone(&views), views, vec![(0, 0)]);
        assert!(same.validate().is_ok());
    }
}
