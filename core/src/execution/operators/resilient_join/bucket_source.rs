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

use crate::errors::JoinResult;
use crate::execution::operators::resilient_join::hash_table::SharedTable;
use crate::execution::operators::resilient_join::lock;
use crate::execution::operators::resilient_join::simple_join::JoinPredicate;
use crate::execution::operators::resilient_join::source::TupleSource;
use crate::execution::tuple::Tuple;

/// Serves the in-memory entries that match the current probe tuple.
///
/// The bucket and hash come from the probe cursor the spillable probe source
/// leaves in the table. Entries are filtered by hash first, then by the full
/// join predicate, so the evaluator only sees genuine matches.
pub(crate) struct BucketSource {
    table: SharedTable,
    predicate: Arc<JoinPredicate>,
    role_reversed: bool,
    probe: Option<Tuple>,
    bucket: usize,
    hash: u32,
    cursor: Option<usize>,
}

impl BucketSource {
    pub fn new(table: SharedTable, predicate: Arc<JoinPredicate>, role_reversed: bool) -> Self {
        Self {
            table,
            predicate,
            role_reversed,
            probe: None,
            bucket: 0,
            hash: 0,
            cursor: None,
        }
    }
}

impl TupleSource for BucketSource {
    fn next(&mut self) -> JoinResult<Option<Tuple>> {
        let Some(probe) = &self.probe else {
            return Ok(None);
        };
        let table = lock(&self.table)?;
        let predicate = &self.predicate;
        let role_reversed = self.role_reversed;
        table.next_candidate(&mut self.cursor, self.bucket, self.hash, |candidate| {
            predicate.matches(probe, candidate, role_reversed)
        })
    }

    fn rescan(&mut self, probe: &Tuple) -> JoinResult<()> {
        let table = lock(&self.table)?;
        match table.probe_cursor() {
            Some(cursor) => {
                self.bucket = cursor.bucket;
                self.hash = cursor.hash;
                self.cursor = table.bucket_head(cursor.bucket);
                self.probe = Some(probe.clone());
            }
            None => {
                self.cursor = None;
                self.probe = None;
            }
        }
        Ok(())
    }

    fn end(&mut self) -> JoinResult<()> {
        self.cursor = None;
        self.probe = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "BucketSource"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::config::ResilientJoinConfig;
    use crate::execution::operators::resilient_join::hash_table::HashTable;
    use crate::execution::operators::resilient_join::metrics::SpillMetrics;
    use crate::execution::operators::resilient_join::sizing::TableSize;
    use datafusion::common::ScalarValue;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;
    use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
    use std::sync::Mutex;

    fn row(k: i64, v: &str) -> Tuple {
        Tuple::new(vec![
            ScalarValue::Int64(Some(k)),
            ScalarValue::Utf8(Some(v.to_string())),
        ])
    }

    fn drain(source: &mut BucketSource) -> JoinResult<Vec<String>> {
        let mut out = Vec::new();
        while let Some(t) = source.next()? {
            out.push(t.to_string());
        }
        Ok(out)
    }

    #[test]
    fn rescan_yields_the_same_matches() -> JoinResult<()> {
        let runtime = RuntimeEnvBuilder::new().build_arc().unwrap();
        let mut table = HashTable::new(
            0,
            TableSize {
                num_buckets: 2,
                num_spill_files: 1,
            },
            1 << 20,
            &ResilientJoinConfig::default(),
            &runtime,
            SpillMetrics::new(&ExecutionPlanMetricsSet::new(), 0),
        );
        // 1 and 3 collide in bucket 1 with the same hash, 5 has another hash
        table.insert(7, row(1, "a"))?;
        table.insert(7, row(3, "b"))?;
        table.insert(7, row(1, "c"))?;
        table.insert(9, row(1, "d"))?;
        table.set_probe_cursor(1, 7);
        let table = Arc::new(Mutex::new(table));

        let predicate = Arc::new(JoinPredicate {
            on: vec![(0, 0)],
            null_equals_null: false,
            filter: None,
        });
        let mut source = BucketSource::new(table, predicate, false);
        let probe = Tuple::new(vec![ScalarValue::Int64(Some(1))]);

        source.rescan(&probe)?;
        let first = drain(&mut source)?;
        source.rescan(&probe)?;
        let second = drain(&mut source)?;
        assert_eq!(first, vec!["(1, c)", "(1, a)"]);
        assert_eq!(first, second);
        Ok(())
    }
}
