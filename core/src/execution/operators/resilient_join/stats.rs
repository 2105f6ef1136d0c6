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

//! Per sub-join statistics and their EXPLAIN rendering.

use std::fmt::{self, Write};

/// How a sub-join pairs its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAlgorithm {
    Hash,
    NestedLoop,
}

impl JoinAlgorithm {
    fn short_name(&self) -> &'static str {
        match self {
            JoinAlgorithm::Hash => "HJ",
            JoinAlgorithm::NestedLoop => "NLJ",
        }
    }
}

impl fmt::Display for JoinAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinAlgorithm::Hash => f.write_str("hash"),
            JoinAlgorithm::NestedLoop => f.write_str("nested loop"),
        }
    }
}

/// Count, sum and range of a series of sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub count: usize,
    pub total: usize,
    pub min: usize,
    pub max: usize,
}

impl Aggregate {
    pub fn record(&mut self, value: usize) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        self.max = self.max.max(value);
        self.total += value;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubJoinStats {
    pub id: usize,
    pub parent_id: Option<usize>,
    pub algorithm: JoinAlgorithm,
    pub role_reversed: bool,
    /// Entries per non-empty in-memory bucket.
    pub chain_length: Aggregate,
    /// Bytes per non-empty in-memory bucket.
    pub bucket_bytes: Aggregate,
    pub empty_buckets: usize,
    pub total_buckets: usize,
    /// Estimated bytes per spilled build partition.
    pub spilled_bytes: Aggregate,
}

impl SubJoinStats {
    pub fn new(
        id: usize,
        parent_id: Option<usize>,
        algorithm: JoinAlgorithm,
        role_reversed: bool,
    ) -> Self {
        Self {
            id,
            parent_id,
            algorithm,
            role_reversed,
            chain_length: Aggregate::default(),
            bucket_bytes: Aggregate::default(),
            empty_buckets: 0,
            total_buckets: 0,
            spilled_bytes: Aggregate::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinStats {
    sub_joins: Vec<SubJoinStats>,
}

impl JoinStats {
    pub(crate) fn push(&mut self, stats: SubJoinStats) {
        self.sub_joins.push(stats);
    }

    pub(crate) fn get_mut(&mut self, id: usize) -> Option<&mut SubJoinStats> {
        self.sub_joins.iter_mut().find(|s| s.id == id)
    }

    /// Sub-joins in creation order.
    pub fn sub_joins(&self) -> &[SubJoinStats] {
        &self.sub_joins
    }

    /// Build bytes the root kept in memory.
    pub fn work_mem_used(&self) -> usize {
        self.root().map_or(0, |root| root.bucket_bytes.total)
    }

    /// Memory the root would have needed to avoid spilling.
    pub fn work_mem_wanted(&self) -> usize {
        self.root()
            .map_or(0, |root| root.bucket_bytes.total + root.spilled_bytes.total)
    }

    fn root(&self) -> Option<&SubJoinStats> {
        self.sub_joins.iter().find(|s| s.parent_id.is_none())
    }

    /// One line per sub-join, indented as the parent of consecutive
    /// sub-joins changes.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        let mut indent = 0usize;
        let mut previous_parent: Option<usize> = None;
        for (i, stats) in self.sub_joins.iter().enumerate() {
            if i > 0 {
                match (stats.parent_id, previous_parent) {
                    (Some(_), None) => indent += 1,
                    (Some(current), Some(previous)) if current > previous => indent += 1,
                    (Some(current), Some(previous)) if current < previous => {
                        indent = indent.saturating_sub(1)
                    }
                    _ => {}
                }
                out.push('\n');
            }
            previous_parent = stats.parent_id;
            let _ = write!(
                out,
                "{:width$}{}-{}: Chain length {:.1} avg, {:.0} max, using {} of {} buckets.",
                "",
                stats.algorithm.short_name(),
                if stats.role_reversed { "R" } else { "O" },
                stats.chain_length.avg(),
                stats.chain_length.max as f64,
                stats.chain_length.count,
                stats.total_buckets,
                width = indent * 2
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_join(id: usize, parent: Option<usize>, chains: &[usize]) -> SubJoinStats {
        let mut stats = SubJoinStats::new(id, parent, JoinAlgorithm::Hash, false);
        for &c in chains {
            stats.chain_length.record(c);
        }
        stats.total_buckets = 1033;
        stats
    }

    #[test]
    fn aggregate_tracks_range() {
        let mut agg = Aggregate::default();
        assert_eq!(agg.avg(), 0.0);
        for v in [4, 2, 9] {
            agg.record(v);
        }
        assert_eq!((agg.min, agg.max, agg.total, agg.count), (2, 9, 15, 3));
        assert_eq!(agg.avg(), 5.0);
    }

    #[test]
    fn explain_indents_children() {
        let mut stats = JoinStats::default();
        stats.push(sub_join(0, None, &[1, 2]));
        stats.push(sub_join(1, Some(0), &[3]));
        stats.push(sub_join(2, Some(1), &[]));
        let mut nested = sub_join(3, Some(0), &[1]);
        nested.algorithm = JoinAlgorithm::NestedLoop;
        nested.role_reversed = true;
        stats.push(nested);
        assert_eq!(
            stats.explain(),
            "HJ-O: Chain length 1.5 avg, 2 max, using 2 of 1033 buckets.\n\
             \x20 HJ-O: Chain length 3.0 avg, 3 max, using 1 of 1033 buckets.\n\
             \x20   HJ-O: Chain length 0.0 avg, 0 max, using 0 of 1033 buckets.\n\
             \x20 NLJ-R: Chain length 1.0 avg, 1 max, using 1 of 1033 buckets."
        );
    }

    #[test]
    fn work_memory_comes_from_the_root() {
        let mut stats = JoinStats::default();
        let mut root = sub_join(0, None, &[]);
        root.bucket_bytes.record(100);
        root.spilled_bytes.record(400);
        stats.push(root);
        let mut child = sub_join(1, Some(0), &[]);
        child.bucket_bytes.record(1000);
        stats.push(child);
        assert_eq!(stats.work_mem_used(), 100);
        assert_eq!(stats.work_mem_wanted(), 500);
    }
}
