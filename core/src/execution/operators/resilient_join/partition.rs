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

//! Spill partitions of one sub-join and the choice of what the next child
//! sub-join processes.

use log::debug;

use crate::errors::{JoinError, JoinResult};
use crate::execution::operators::resilient_join::metrics::SpillMetrics;
use crate::execution::spill::{SpillPartition, SpillPartitionPair, SpillSide, SpillWorkSet};
use crate::execution::tuple::{Tuple, ENTRY_MEMORY_OVERHEAD};

/// The partitions a child sub-join will process.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PartitionSet {
    pub indices: Vec<usize>,
    /// Exact tuple count of the side the child builds on.
    pub build_rows: usize,
    /// Average width of a build tuple, entry overhead excluded.
    pub build_width: usize,
    /// Role reversal of the child relative to the original plan.
    pub role_reversed: bool,
}

pub(crate) struct SpillSet {
    work_set: SpillWorkSet,
    partitions: Vec<Option<SpillPartitionPair>>,
    next_partition: usize,
    metrics: SpillMetrics,
}

impl SpillSet {
    pub fn new(work_set: SpillWorkSet, num_spill_files: usize, metrics: SpillMetrics) -> Self {
        Self {
            work_set,
            partitions: (0..num_spill_files.max(1)).map(|_| None).collect(),
            next_partition: 0,
            metrics,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_index(&self, bucket: usize) -> usize {
        bucket % self.partitions.len()
    }

    pub fn has_spilled(&self) -> bool {
        self.partitions.iter().any(Option::is_some)
    }

    pub fn files_created(&self) -> usize {
        self.work_set.files_created()
    }

    /// Appends a build tuple of `bucket` to its inner partition.
    pub fn spill_inner(&mut self, bucket: usize, tuple: &Tuple) -> JoinResult<()> {
        let index = self.partition_index(bucket);
        let pair = self.partitions[index].get_or_insert_with(SpillPartitionPair::default);
        if pair.inner.is_none() {
            pair.inner = Some(SpillPartition::new(self.work_set.create_file()?));
        }
        if let Some(partition) = pair.inner.as_mut() {
            let written = partition.append(tuple)?;
            self.metrics.record_spilled_tuple(written);
        }
        Ok(())
    }

    /// Appends a probe tuple of spilled `bucket` to its outer partition.
    pub fn spill_outer(&mut self, bucket: usize, tuple: &Tuple) -> JoinResult<()> {
        let index = self.partition_index(bucket);
        let Some(pair) = self.partitions[index].as_mut().filter(|p| p.inner.is_some()) else {
            return Err(JoinError::ContractViolation(format!(
                "probe tuple routed to spill partition {index} which holds no build tuples"
            )));
        };
        if pair.outer.is_none() {
            pair.outer = Some(SpillPartition::new(self.work_set.create_file()?));
        }
        if let Some(partition) = pair.outer.as_mut() {
            let written = partition.append(tuple)?;
            self.metrics.record_spilled_tuple(written);
        }
        Ok(())
    }

    /// Picks the partitions for the next child sub-join, or `None` once every
    /// partition has been handed out.
    ///
    /// Partitions are taken in index order while the side the child would
    /// build on fits `quota` bytes; the first one is always taken. A quota of
    /// zero takes everything that is left. Only partitions holding probe
    /// tuples are useful, except that outer-style joins must still see
    /// their probe tuples with no build tuples at all.
    pub fn choose_next_partition_set(
        &mut self,
        quota: usize,
        reversal_allowed: bool,
        parent_reversed: bool,
        emits_unmatched: bool,
        partition_tuning: bool,
    ) -> Option<PartitionSet> {
        if !self.has_spilled() || self.next_partition >= self.partitions.len() {
            return None;
        }

        let mut indices = Vec::new();
        let (mut inner_size, mut inner_count) = (0usize, 0usize);
        let (mut outer_size, mut outer_count) = (0usize, 0usize);
        let mut index = self.next_partition;
        while index < self.partitions.len() {
            if let Some(pair) = &self.partitions[index] {
                let wanted = pair.outer.is_some() && (emits_unmatched || pair.inner.is_some());
                if wanted {
                    let totals = |side| {
                        pair.side(side)
                            .map_or((0, 0), |p| (p.memory_size(), p.tuple_count()))
                    };
                    let (pi_size, pi_count) = totals(SpillSide::Inner);
                    let (po_size, po_count) = totals(SpillSide::Outer);
                    let new_inner = (inner_size + pi_size, inner_count + pi_count);
                    let new_outer = (outer_size + po_size, outer_count + po_count);
                    let smaller = if reversal_allowed && new_outer.1 < new_inner.1 {
                        new_outer.0
                    } else {
                        new_inner.0
                    };
                    if quota != 0 && smaller > quota && !indices.is_empty() {
                        break;
                    }
                    indices.push(index);
                    (inner_size, inner_count) = new_inner;
                    (outer_size, outer_count) = new_outer;
                    if !partition_tuning {
                        index += 1;
                        break;
                    }
                }
            }
            index += 1;
        }
        self.next_partition = index;

        if indices.is_empty() {
            return None;
        }

        let reversed_here = reversal_allowed && inner_count > outer_count;
        let (build_size, build_rows) = if reversed_here {
            (outer_size, outer_count)
        } else {
            (inner_size, inner_count)
        };
        let build_width = if build_rows == 0 {
            0
        } else {
            build_size
                .saturating_sub(build_rows * ENTRY_MEMORY_OVERHEAD)
                .div_ceil(build_rows)
        };
        debug!(
            "Chose spill partitions {indices:?}: inner {inner_count} tuples/{inner_size} bytes, \
             outer {outer_count} tuples/{outer_size} bytes, reversed here: {reversed_here}"
        );
        Some(PartitionSet {
            indices,
            build_rows,
            build_width,
            role_reversed: parent_reversed ^ reversed_here,
        })
    }

    /// Moves one side of the given partitions out of the set.
    pub fn take_partitions(&mut self, indices: &[usize], side: SpillSide) -> Vec<SpillPartition> {
        let mut taken = Vec::with_capacity(indices.len());
        for &index in indices {
            let Some(slot) = self.partitions.get_mut(index) else {
                continue;
            };
            if let Some(pair) = slot.as_mut() {
                taken.extend(pair.take(side));
                if pair.is_empty() {
                    *slot = None;
                }
            }
        }
        taken
    }

    /// Estimated sizes of the build side partitions still held.
    pub fn inner_partition_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.partitions
            .iter()
            .filter_map(|p| p.as_ref()?.inner.as_ref().map(SpillPartition::memory_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::common::ScalarValue;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;
    use datafusion::physical_plan::metrics::ExecutionPlanMetricsSet;
    use std::sync::Arc;

    fn spill_set(partitions: usize) -> SpillSet {
        let runtime = RuntimeEnvBuilder::new().build_arc().unwrap();
        let work_set = SpillWorkSet::new(Arc::clone(&runtime.disk_manager), "partition test");
        SpillSet::new(
            work_set,
            partitions,
            SpillMetrics::new(&ExecutionPlanMetricsSet::new(), 0),
        )
    }

    fn row(k: i64) -> Tuple {
        Tuple::new(vec![ScalarValue::Int64(Some(k))])
    }

    /// Spills `inner` build and `outer` probe tuples into partition `index`.
    fn fill(set: &mut SpillSet, index: usize, inner: usize, outer: usize) -> JoinResult<()> {
        for i in 0..inner {
            set.spill_inner(index, &row(i as i64))?;
        }
        for i in 0..outer {
            set.spill_outer(index, &row(i as i64))?;
        }
        Ok(())
    }

    #[test]
    fn every_partition_is_chosen_exactly_once() -> JoinResult<()> {
        let mut set = spill_set(7);
        for index in 0..7 {
            fill(&mut set, index, index + 1, 2)?;
        }
        let mut seen = Vec::new();
        // a quota smaller than any partition forces one partition per child
        while let Some(chosen) = set.choose_next_partition_set(1, false, false, false, true) {
            assert_eq!(chosen.indices.len(), 1);
            seen.extend(chosen.indices);
        }
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert!(set
            .choose_next_partition_set(1, false, false, false, true)
            .is_none());
        Ok(())
    }

    #[test]
    fn quota_zero_takes_everything_left() -> JoinResult<()> {
        let mut set = spill_set(4);
        for index in 0..4 {
            fill(&mut set, index, 3, 3)?;
        }
        let chosen = set
            .choose_next_partition_set(0, false, false, false, true)
            .unwrap();
        assert_eq!(chosen.indices, vec![0, 1, 2, 3]);
        assert_eq!(chosen.build_rows, 12);
        assert!(set
            .choose_next_partition_set(0, false, false, false, true)
            .is_none());
        Ok(())
    }

    #[test]
    fn partitions_without_probe_tuples_are_skipped() -> JoinResult<()> {
        let mut set = spill_set(3);
        fill(&mut set, 0, 2, 0)?;
        fill(&mut set, 1, 2, 1)?;
        fill(&mut set, 2, 2, 0)?;
        let chosen = set
            .choose_next_partition_set(0, false, false, true, true)
            .unwrap();
        assert_eq!(chosen.indices, vec![1]);
        Ok(())
    }

    #[test]
    fn tuning_disabled_takes_one_partition() -> JoinResult<()> {
        let mut set = spill_set(3);
        for index in 0..3 {
            fill(&mut set, index, 1, 1)?;
        }
        let first = set
            .choose_next_partition_set(0, false, false, false, false)
            .unwrap();
        assert_eq!(first.indices, vec![0]);
        let second = set
            .choose_next_partition_set(0, false, false, false, false)
            .unwrap();
        assert_eq!(second.indices, vec![1]);
        Ok(())
    }

    #[test]
    fn smaller_outer_side_becomes_the_build_side() -> JoinResult<()> {
        let mut set = spill_set(2);
        fill(&mut set, 0, 10, 2)?;
        let entry = codec_entry_size(&row(0));

        let chosen = set
            .choose_next_partition_set(0, true, false, false, true)
            .unwrap();
        assert!(chosen.role_reversed);
        assert_eq!(chosen.build_rows, 2);
        assert_eq!(chosen.build_width, entry - ENTRY_MEMORY_OVERHEAD);

        // reversal is relative to the parent
        let mut set = spill_set(2);
        fill(&mut set, 0, 10, 2)?;
        let chosen = set
            .choose_next_partition_set(0, true, true, false, true)
            .unwrap();
        assert!(!chosen.role_reversed);

        // not allowed for this join type
        let mut set = spill_set(2);
        fill(&mut set, 0, 10, 2)?;
        let chosen = set
            .choose_next_partition_set(0, false, false, false, true)
            .unwrap();
        assert!(!chosen.role_reversed);
        assert_eq!(chosen.build_rows, 10);
        Ok(())
    }

    #[test]
    fn taken_partitions_leave_the_set() -> JoinResult<()> {
        let mut set = spill_set(2);
        fill(&mut set, 1, 2, 3)?;
        let inner = set.take_partitions(&[1], SpillSide::Inner);
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].tuple_count(), 2);
        assert_eq!(set.inner_partition_sizes().count(), 0);
        let outer = set.take_partitions(&[1], SpillSide::Outer);
        assert_eq!(outer[0].tuple_count(), 3);
        assert!(!set.has_spilled());
        Ok(())
    }

    #[test]
    fn probe_spill_needs_a_build_partition() {
        let mut set = spill_set(2);
        assert!(matches!(
            set.spill_outer(0, &row(1)),
            Err(JoinError::ContractViolation(_))
        ));
    }

    fn codec_entry_size(tuple: &Tuple) -> usize {
        crate::execution::spill::codec::encoded_len(tuple) + ENTRY_MEMORY_OVERHEAD
    }
}
