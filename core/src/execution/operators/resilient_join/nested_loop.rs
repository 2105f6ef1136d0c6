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

use crate::errors::{JoinError, JoinResult};
use crate::execution::operators::resilient_join::simple_join::JoinPredicate;
use crate::execution::operators::resilient_join::source::{BoxedSource, TupleSource};
use crate::execution::spill::{SpillFile, SpillWorkSet};
use crate::execution::tuple::Tuple;

/// Candidate source of a nested-loop sub-join.
///
/// The build input is usually a one-shot [`SpilledSource`](super::spilled_source::SpilledSource),
/// so it is copied into a spool file on the first rescan. Every later rescan
/// rewinds the spool, and candidates are filtered with the full join
/// predicate since nothing was hashed.
pub(crate) struct NestedLoopSource {
    input: Option<BoxedSource>,
    work_set: SpillWorkSet,
    spool: Option<SpillFile>,
    predicate: Arc<JoinPredicate>,
    role_reversed: bool,
    probe: Option<Tuple>,
}

impl NestedLoopSource {
    pub fn new(
        input: BoxedSource,
        work_set: SpillWorkSet,
        predicate: Arc<JoinPredicate>,
        role_reversed: bool,
    ) -> Self {
        Self {
            input: Some(input),
            work_set,
            spool: None,
            predicate,
            role_reversed,
            probe: None,
        }
    }

    fn spool_input(&mut self) -> JoinResult<SpillFile> {
        let mut spool = self.work_set.create_file()?;
        if let Some(mut input) = self.input.take() {
            while let Some(tuple) = input.next()? {
                spool.append(&tuple)?;
            }
            input.end()?;
        }
        Ok(spool)
    }
}

impl TupleSource for NestedLoopSource {
    fn next(&mut self) -> JoinResult<Option<Tuple>> {
        let (Some(spool), Some(probe)) = (self.spool.as_mut(), self.probe.as_ref()) else {
            return Ok(None);
        };
        while let Some(candidate) = spool.read_next()? {
            if self.predicate.matches(probe, &candidate, self.role_reversed)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn rescan(&mut self, probe: &Tuple) -> JoinResult<()> {
        if self.spool.is_none() {
            self.spool = Some(self.spool_input()?);
        }
        let spool = self.spool.as_mut().ok_or_else(|| {
            JoinError::ContractViolation("nested loop spool is missing".to_string())
        })?;
        spool.rewind()?;
        self.probe = Some(probe.clone());
        Ok(())
    }

    fn end(&mut self) -> JoinResult<()> {
        self.probe = None;
        self.spool = None;
        match self.input.take() {
            Some(mut input) => input.end(),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "NestedLoopSource"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::resilient_join::source::{MemoryOperator, OperatorSource};
    use datafusion::common::ScalarValue;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;

    fn row(k: i64, v: &str) -> Tuple {
        Tuple::new(vec![
            ScalarValue::Int64(Some(k)),
            ScalarValue::Utf8(Some(v.to_string())),
        ])
    }

    #[test]
    fn every_rescan_reads_the_whole_spool() -> JoinResult<()> {
        let runtime = RuntimeEnvBuilder::new().build_arc().unwrap();
        let operator = MemoryOperator::new(vec![row(1, "a"), row(2, "b"), row(1, "c")]);
        let rows_read = operator.rows_read();
        let predicate = Arc::new(JoinPredicate {
            on: vec![(0, 0)],
            null_equals_null: false,
            filter: None,
        });
        let mut source = NestedLoopSource::new(
            Box::new(OperatorSource::new(Box::new(operator))),
            SpillWorkSet::new(Arc::clone(&runtime.disk_manager), "nested loop test"),
            predicate,
            false,
        );

        for (key, expected) in [(1, vec!["(1, a)", "(1, c)"]), (2, vec!["(2, b)"]), (1, vec!["(1, a)", "(1, c)"])] {
            source.rescan(&Tuple::new(vec![ScalarValue::Int64(Some(key))]))?;
            let mut seen = Vec::new();
            while let Some(t) = source.next()? {
                seen.push(t.to_string());
            }
            assert_eq!(seen, expected);
        }
        // the input is read once
        assert_eq!(rows_read.load(std::sync::atomic::Ordering::Relaxed), 3);
        source.end()
    }
}
