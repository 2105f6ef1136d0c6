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

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use arrow::datatypes::Schema;
use datafusion::common::{DataFusionError, ScalarValue};

use crate::errors::JoinResult;

/// Bookkeeping bytes charged for every build tuple held by a hash table or
/// counted into a spill partition's in-memory estimate: hash value, chain link
/// and alignment.
pub const ENTRY_MEMORY_OVERHEAD: usize = 16;

/// A single row flowing through the join. Values are shared, so clones are cheap.
#[derive(Clone, PartialEq)]
pub struct Tuple {
    values: Arc<[ScalarValue]>,
}

impl Tuple {
    pub fn new(values: Vec<ScalarValue>) -> Self {
        Self {
            values: values.into(),
        }
    }

    /// A row of typed nulls matching `schema`, used to pad outer join misses.
    pub fn nulls_for(schema: &Schema) -> JoinResult<Self> {
        let values = schema
            .fields()
            .iter()
            .map(|field| ScalarValue::try_from(field.data_type()))
            .collect::<Result<Vec<_>, DataFusionError>>()?;
        Ok(Self::new(values))
    }

    pub fn values(&self) -> &[ScalarValue] {
        &self.values
    }
}

impl Deref for Tuple {
    type Target = [ScalarValue];

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl From<Vec<ScalarValue>> for Tuple {
    fn from(values: Vec<ScalarValue>) -> Self {
        Self::new(values)
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if value.is_null() {
                write!(f, "NULL")?;
            } else {
                write!(f, "{value}")?;
            }
        }
        write!(f, ")")
    }
}
