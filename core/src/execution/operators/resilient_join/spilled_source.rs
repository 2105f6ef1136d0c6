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

use std::collections::VecDeque;

use crate::errors::{JoinError, JoinResult};
use crate::execution::operators::resilient_join::source::TupleSource;
use crate::execution::spill::SpillPartition;
use crate::execution::tuple::Tuple;

/// Reads a set of spill partitions back, one after another, exactly once.
pub(crate) struct SpilledSource {
    pending: VecDeque<SpillPartition>,
    current: Option<SpillPartition>,
}

impl SpilledSource {
    pub fn new(partitions: Vec<SpillPartition>) -> Self {
        Self {
            pending: partitions.into(),
            current: None,
        }
    }
}

impl TupleSource for SpilledSource {
    fn next(&mut self) -> JoinResult<Option<Tuple>> {
        loop {
            if let Some(partition) = self.current.as_mut() {
                if let Some(tuple) = partition.read_next()? {
                    return Ok(Some(tuple));
                }
                self.current = None;
            }
            let Some(mut partition) = self.pending.pop_front() else {
                return Ok(None);
            };
            partition.rewind()?;
            self.current = Some(partition);
        }
    }

    fn rescan(&mut self, _probe: &Tuple) -> JoinResult<()> {
        Err(JoinError::ContractViolation(
            "SpilledSource cannot be rescanned".to_string(),
        ))
    }

    fn end(&mut self) -> JoinResult<()> {
        self.current = None;
        self.pending.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SpilledSource"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::spill::SpillWorkSet;
    use datafusion::common::ScalarValue;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;
    use std::sync::Arc;

    fn partition(work_set: &mut SpillWorkSet, rows: &[&str]) -> JoinResult<SpillPartition> {
        let mut partition = SpillPartition::new(work_set.create_file()?);
        for row in rows {
            partition.append(&Tuple::new(vec![
                ScalarValue::Utf8(Some(row.to_string())),
                ScalarValue::Null,
            ]))?;
        }
        Ok(partition)
    }

    #[test]
    fn partitions_are_read_in_order_once() -> JoinResult<()> {
        let runtime = RuntimeEnvBuilder::new().build_arc().unwrap();
        let mut work_set = SpillWorkSet::new(Arc::clone(&runtime.disk_manager), "test");
        let mut source = SpilledSource::new(vec![
            partition(&mut work_set, &["a", "b"])?,
            partition(&mut work_set, &[])?,
            partition(&mut work_set, &["c"])?,
        ]);
        let mut seen = Vec::new();
        while let Some(t) = source.next()? {
            seen.push(t.to_string());
        }
        assert_eq!(seen, vec!["(a, NULL)", "(b, NULL)", "(c, NULL)"]);
        assert!(source.next()?.is_none());

        let probe = Tuple::new(vec![]);
        assert!(matches!(
            source.rescan(&probe),
            Err(JoinError::ContractViolation(_))
        ));
        source.end()
    }
}
