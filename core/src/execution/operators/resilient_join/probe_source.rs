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

use datafusion::physical_plan::metrics::Count;

use crate::errors::{JoinError, JoinResult};
use crate::execution::operators::resilient_join::hash_table::SharedTable;
use crate::execution::operators::resilient_join::source::{BoxedSource, TupleSource};
use crate::execution::operators::resilient_join::{lock, SharedHasher};
use crate::execution::tuple::Tuple;

/// Wraps the probe input of a hash sub-join. Tuples whose bucket was spilled
/// go to the matching outer spill partition and never reach the evaluator;
/// for the others the bucket and hash are left in the table for the
/// [`BucketSource`](super::bucket_source::BucketSource).
pub(crate) struct SpillableProbeSource {
    input: BoxedSource,
    hasher: SharedHasher,
    table: SharedTable,
    /// Counts rows read at the root, where the input is the upstream operator.
    input_rows: Option<Count>,
}

impl SpillableProbeSource {
    pub fn new(
        input: BoxedSource,
        hasher: SharedHasher,
        table: SharedTable,
        input_rows: Option<Count>,
    ) -> Self {
        Self {
            input,
            hasher,
            table,
            input_rows,
        }
    }
}

impl TupleSource for SpillableProbeSource {
    fn next(&mut self) -> JoinResult<Option<Tuple>> {
        while let Some(tuple) = self.input.next()? {
            if let Some(rows) = &self.input_rows {
                rows.add(1);
            }
            let (hash, _) = lock(&self.hasher)?.compute(&tuple)?;
            let mut table = lock(&self.table)?;
            let bucket = table.bucket_for(hash);
            if table.is_spilled(bucket) {
                table.spill_probe(bucket, &tuple)?;
                continue;
            }
            table.set_probe_cursor(bucket, hash);
            return Ok(Some(tuple));
        }
        Ok(None)
    }

    fn rescan(&mut self, _probe: &Tuple) -> JoinResult<()> {
        Err(JoinError::ContractViolation(
            "SpillableProbeSource cannot be rescanned".to_string(),
        ))
    }

    fn end(&mut self) -> JoinResult<()> {
        self.input.end()
    }

    fn name(&self) -> &'static str {
        "SpillableProbeSource"
    }
}
