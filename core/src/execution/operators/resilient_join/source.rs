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

//! Pull-based tuple sources feeding the join.
//!
//! Every sub-join reads its inputs through [`TupleSource`]. Upstream
//! operators, hash table buckets, spill partitions and the spill-routing
//! probe decorator all implement it, so the join evaluator does not care
//! where a tuple comes from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use datafusion::common::{DataFusionError, ScalarValue};

use crate::errors::JoinResult;
use crate::execution::tuple::Tuple;

/// The row-producing operator interface of the host engine.
pub trait RowOperator: Send {
    fn next_row(&mut self) -> JoinResult<Option<Tuple>>;

    /// Restarts the operator from its first row.
    fn rescan(&mut self) -> JoinResult<()>;

    fn close(&mut self) -> JoinResult<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// A source of tuples for one side of a sub-join.
pub trait TupleSource: Send {
    /// Returns the next tuple, or `None` once the source is exhausted.
    fn next(&mut self) -> JoinResult<Option<Tuple>>;

    /// Prepares the source to be read again for `probe`. One-shot sources
    /// reject this with a contract violation.
    fn rescan(&mut self, probe: &Tuple) -> JoinResult<()>;

    /// Releases whatever the source reads from.
    fn end(&mut self) -> JoinResult<()>;

    fn name(&self) -> &'static str;
}

pub type BoxedSource = Box<dyn TupleSource>;

/// Delegates to an upstream [`RowOperator`].
pub struct OperatorSource {
    operator: Box<dyn RowOperator>,
}

impl OperatorSource {
    pub fn new(operator: Box<dyn RowOperator>) -> Self {
        Self { operator }
    }
}

impl TupleSource for OperatorSource {
    fn next(&mut self) -> JoinResult<Option<Tuple>> {
        self.operator.next_row()
    }

    fn rescan(&mut self, _probe: &Tuple) -> JoinResult<()> {
        self.operator.rescan()
    }

    fn end(&mut self) -> JoinResult<()> {
        self.operator.close()
    }

    fn name(&self) -> &'static str {
        "OperatorSource"
    }
}

/// Serves rows from memory and counts how many were handed out.
pub struct MemoryOperator {
    rows: Vec<Tuple>,
    position: usize,
    rows_read: Arc<AtomicUsize>,
}

impl MemoryOperator {
    pub fn new(rows: Vec<Tuple>) -> Self {
        Self {
            rows,
            position: 0,
            rows_read: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of rows returned by [`RowOperator::next_row`].
    pub fn rows_read(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.rows_read)
    }
}

impl RowOperator for MemoryOperator {
    fn next_row(&mut self) -> JoinResult<Option<Tuple>> {
        let row = self.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
            self.rows_read.fetch_add(1, Ordering::Relaxed);
        }
        Ok(row)
    }

    fn rescan(&mut self) -> JoinResult<()> {
        self.position = 0;
        Ok(())
    }

    fn name(&self) -> &str {
        "MemoryOperator"
    }
}

/// Turns Arrow record batches into rows of scalars.
pub struct RecordBatchOperator {
    batches: Vec<RecordBatch>,
    batch: usize,
    row: usize,
}

impl RecordBatchOperator {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches,
            batch: 0,
            row: 0,
        }
    }
}

impl RowOperator for RecordBatchOperator {
    fn next_row(&mut self) -> JoinResult<Option<Tuple>> {
        while let Some(batch) = self.batches.get(self.batch) {
            if self.row < batch.num_rows() {
                let values = batch
                    .columns()
                    .iter()
                    .map(|column| ScalarValue::try_from_array(column, self.row))
                    .collect::<Result<Vec<_>, DataFusionError>>()?;
                self.row += 1;
                return Ok(Some(Tuple::new(values)));
            }
            self.batch += 1;
            self.row = 0;
        }
        Ok(None)
    }

    fn rescan(&mut self) -> JoinResult<()> {
        self.batch = 0;
        self.row = 0;
        Ok(())
    }

    fn name(&self) -> &str {
        "RecordBatchOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    #[test]
    fn record_batches_become_rows() -> JoinResult<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, true),
            Field::new("v", DataType::Utf8, true),
        ]));
        let first = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int32Array::from(vec![Some(1), None])),
                Arc::new(StringArray::from(vec!["a", "b"])),
            ],
        )
        .unwrap();
        let empty = RecordBatch::new_empty(Arc::clone(&schema));
        let second = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![3])),
                Arc::new(StringArray::from(vec!["c"])),
            ],
        )
        .unwrap();

        let mut source = OperatorSource::new(Box::new(RecordBatchOperator::new(vec![
            first, empty, second,
        ])));
        let mut rows = Vec::new();
        while let Some(row) = source.next()? {
            rows.push(row.to_string());
        }
        assert_eq!(rows, vec!["(1, a)", "(NULL, b)", "(3, c)"]);

        source.rescan(&Tuple::new(vec![]))?;
        assert_eq!(source.next()?.map(|r| r.to_string()), Some("(1, a)".to_string()));
        Ok(())
    }

    #[test]
    fn memory_operator_counts_reads() -> JoinResult<()> {
        let mut op = MemoryOperator::new(vec![
            Tuple::new(vec![ScalarValue::Int64(Some(1))]),
            Tuple::new(vec![ScalarValue::Int64(Some(2))]),
        ]);
        let counter = op.rows_read();
        assert!(op.next_row()?.is_some());
        assert!(op.next_row()?.is_some());
        assert!(op.next_row()?.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        Ok(())
    }
}
