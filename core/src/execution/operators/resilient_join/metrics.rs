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

use datafusion::physical_plan::metrics::{
    BaselineMetrics, Count, ExecutionPlanMetricsSet, MetricBuilder, Time,
};

/// Metrics of one resilient join, shared by all of its sub-joins.
pub(crate) struct ResilientJoinMetrics {
    /// Baseline metrics (output rows, elapsed compute)
    pub baseline: BaselineMetrics,
    /// Time spent building hash tables, all levels
    pub build_time: Time,
    /// Time spent probing, all levels
    pub probe_time: Time,
    pub spill: SpillMetrics,
    /// Rows read from the build input
    pub build_input_rows: Count,
    /// Rows read from the probe input
    pub input_rows: Count,
    /// Hash sub-joins below the root
    pub hash_sub_joins: Count,
    /// Nested-loop sub-joins
    pub nested_loop_sub_joins: Count,
}

impl ResilientJoinMetrics {
    pub fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            baseline: BaselineMetrics::new(metrics, partition),
            build_time: MetricBuilder::new(metrics).subset_time("build_time", partition),
            probe_time: MetricBuilder::new(metrics).subset_time("probe_time", partition),
            spill: SpillMetrics::new(metrics, partition),
            build_input_rows: MetricBuilder::new(metrics).counter("build_input_rows", partition),
            input_rows: MetricBuilder::new(metrics).counter("input_rows", partition),
            hash_sub_joins: MetricBuilder::new(metrics).counter("hash_sub_joins", partition),
            nested_loop_sub_joins: MetricBuilder::new(metrics)
                .counter("nested_loop_sub_joins", partition),
        }
    }
}

/// Spill counters handed to each hash table.
#[derive(Clone)]
pub(crate) struct SpillMetrics {
    /// Number of buckets spilled
    pub spill_count: Count,
    /// Bytes written to spill files
    pub spilled_bytes: Count,
    /// Tuples written to spill files
    pub spilled_rows: Count,
    /// Eviction passes
    pub evictions: Count,
}

impl SpillMetrics {
    pub fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            spilled_rows: MetricBuilder::new(metrics).spilled_rows(partition),
            evictions: MetricBuilder::new(metrics).counter("evictions", partition),
        }
    }

    pub fn record_spilled_tuple(&self, bytes: usize) {
        self.spilled_bytes.add(bytes);
        self.spilled_rows.add(1);
    }
}
