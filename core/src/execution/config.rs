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
use std::str::FromStr;

use crate::errors::{JoinError, JoinResult};

/// Memory budget used when none is configured.
pub const DEFAULT_MEMORY_BUDGET: usize = 64 * 1024 * 1024;
/// Row estimate used when the planner estimate is unusable.
pub const DEFAULT_EXPECTED_ROWS: f64 = 1000.0;
pub const DEFAULT_EXPECTED_WIDTH: usize = 32;
pub const DEFAULT_MEMORY_GROUP_COUNT: usize = 200;
pub const DEFAULT_TOP_K_HEAP_SIZE: usize = 64;
pub const DEFAULT_TOP_K_FREE_FRACTION: f64 = 0.1;
pub const DEFAULT_TUPLES_PER_BUCKET: usize = 5;
pub const DEFAULT_METADATA_MEMORY_PERCENT: usize = 10;
pub const DEFAULT_MIN_SPILL_FILES: usize = 100;
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 8;

/// Optional prefix accepted on option keys.
const OPTION_PREFIX: &str = "resilient_join.";

/// How a hash table frees memory once it goes over budget.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Spill the largest in-memory bucket until the table fits.
    LargestBucket,
    /// Spill the largest buckets of a bounded min-heap until a fraction of
    /// the in-memory bytes has been freed.
    TopKBuckets,
    /// Spill every bucket of the memory group holding the most bytes.
    LargestMemoryGroup,
}

impl FromStr for EvictionPolicy {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "largest_bucket" => Ok(EvictionPolicy::LargestBucket),
            "default" | "top_k" => Ok(EvictionPolicy::TopKBuckets),
            "largest_group" => Ok(EvictionPolicy::LargestMemoryGroup),
            _ => Err(JoinError::Config(format!(
                "Unsupported eviction policy: {s}"
            ))),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionPolicy::LargestBucket => "largest_bucket",
            EvictionPolicy::TopKBuckets => "top_k",
            EvictionPolicy::LargestMemoryGroup => "largest_group",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ResilientJoinConfig {
    /// Bytes of build tuples each sub-join may keep in memory. Zero selects
    /// [`DEFAULT_MEMORY_BUDGET`].
    pub memory_budget: usize,
    /// Planner estimate of build rows, used to size the root hash table.
    pub expected_rows: f64,
    /// Planner estimate of the average build row width in bytes.
    pub expected_width: usize,
    /// Number of data segments the build estimate is spread across.
    pub segment_count: usize,
    pub eviction_policy: EvictionPolicy,
    pub top_k_heap_size: usize,
    pub top_k_free_fraction: f64,
    pub memory_group_count: usize,
    pub tuples_per_bucket: usize,
    /// Share of the memory budget the bucket array may occupy.
    pub metadata_memory_percent: usize,
    pub min_spill_files: usize,
    /// Upper bound on root spill files, zero for unbounded.
    pub max_spill_files: usize,
    pub num_buckets: Option<usize>,
    pub num_spill_files: Option<usize>,
    /// Merge several spill partitions into one child while they fit the budget.
    pub partition_tuning: bool,
    /// Let a sub-join whose partitions stop shrinking switch to nested loop.
    pub nested_loop_switch: bool,
    /// Deepest hash sub-join; anything deeper runs as a nested loop.
    pub max_recursion_depth: usize,
    pub collect_statistics: bool,
}

impl Default for ResilientJoinConfig {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            expected_rows: DEFAULT_EXPECTED_ROWS,
            expected_width: DEFAULT_EXPECTED_WIDTH,
            segment_count: 1,
            eviction_policy: EvictionPolicy::TopKBuckets,
            top_k_heap_size: DEFAULT_TOP_K_HEAP_SIZE,
            top_k_free_fraction: DEFAULT_TOP_K_FREE_FRACTION,
            memory_group_count: DEFAULT_MEMORY_GROUP_COUNT,
            tuples_per_bucket: DEFAULT_TUPLES_PER_BUCKET,
            metadata_memory_percent: DEFAULT_METADATA_MEMORY_PERCENT,
            min_spill_files: DEFAULT_MIN_SPILL_FILES,
            max_spill_files: 0,
            num_buckets: None,
            num_spill_files: None,
            partition_tuning: true,
            nested_loop_switch: false,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            collect_statistics: false,
        }
    }
}

impl ResilientJoinConfig {
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_expected_rows(mut self, rows: f64, width: usize) -> Self {
        self.expected_rows = rows;
        self.expected_width = width;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_num_buckets(mut self, buckets: usize) -> Self {
        self.num_buckets = Some(buckets);
        self
    }

    pub fn with_num_spill_files(mut self, files: usize) -> Self {
        self.num_spill_files = Some(files);
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.collect_statistics = enabled;
        self
    }

    /// The memory budget with the zero value resolved.
    pub fn effective_memory_budget(&self) -> usize {
        if self.memory_budget == 0 {
            DEFAULT_MEMORY_BUDGET
        } else {
            self.memory_budget
        }
    }

    pub fn validate(&self) -> JoinResult<()> {
        let positive = [
            ("segment_count", self.segment_count),
            ("top_k_heap_size", self.top_k_heap_size),
            ("memory_group_count", self.memory_group_count),
            ("tuples_per_bucket", self.tuples_per_bucket),
            ("min_spill_files", self.min_spill_files),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(JoinError::Config(format!("{name} must be positive")));
            }
        }
        if !(self.top_k_free_fraction > 0.0 && self.top_k_free_fraction <= 1.0) {
            return Err(JoinError::Config(format!(
                "top_k_free_fraction must be in (0, 1], got {}",
                self.top_k_free_fraction
            )));
        }
        if self.metadata_memory_percent > 100 {
            return Err(JoinError::Config(format!(
                "metadata_memory_percent must be at most 100, got {}",
                self.metadata_memory_percent
            )));
        }
        if self.num_buckets == Some(0) || self.num_spill_files == Some(0) {
            return Err(JoinError::Config(
                "num_buckets and num_spill_files must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds a configuration from string options on top of the defaults.
    pub fn from_options<'a, I>(options: I) -> JoinResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> JoinResult<()> {
        let name = key.strip_prefix(OPTION_PREFIX).unwrap_or(key);
        match name {
            "memory_budget" => self.memory_budget = parse(name, value)?,
            "expected_rows" => self.expected_rows = parse(name, value)?,
            "expected_width" => self.expected_width = parse(name, value)?,
            "segment_count" => self.segment_count = parse(name, value)?,
            "eviction_policy" => self.eviction_policy = value.parse()?,
            "top_k_heap_size" => self.top_k_heap_size = parse(name, value)?,
            "top_k_free_fraction" => self.top_k_free_fraction = parse(name, value)?,
            "memory_group_count" => self.memory_group_count = parse(name, value)?,
            "tuples_per_bucket" => self.tuples_per_bucket = parse(name, value)?,
            "metadata_memory_percent" => self.metadata_memory_percent = parse(name, value)?,
            "min_spill_files" => self.min_spill_files = parse(name, value)?,
            "max_spill_files" => self.max_spill_files = parse(name, value)?,
            "num_buckets" => self.num_buckets = Some(parse(name, value)?),
            "num_spill_files" => self.num_spill_files = Some(parse(name, value)?),
            "partition_tuning" => self.partition_tuning = parse(name, value)?,
            "nested_loop_switch" => self.nested_loop_switch = parse(name, value)?,
            "max_recursion_depth" => self.max_recursion_depth = parse(name, value)?,
            "collect_statistics" => self.collect_statistics = parse(name, value)?,
            _ => {
                return Err(JoinError::Config(format!(
                    "Unsupported resilient join option: {key}"
                )))
            }
        }
        Ok(())
    }
}

fn parse<T>(name: &str, value: &str) -> JoinResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| JoinError::Config(format!("Invalid value for {name}: {value} ({e})")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_override_defaults() -> JoinResult<()> {
        let config = ResilientJoinConfig::from_options([
            ("resilient_join.memory_budget", "4096"),
            ("eviction_policy", "largest_group"),
            ("num_buckets", "3"),
            ("partition_tuning", "false"),
        ])?;
        assert_eq!(config.memory_budget, 4096);
        assert_eq!(config.eviction_policy, EvictionPolicy::LargestMemoryGroup);
        assert_eq!(config.num_buckets, Some(3));
        assert!(!config.partition_tuning);
        assert_eq!(config.top_k_heap_size, DEFAULT_TOP_K_HEAP_SIZE);
        Ok(())
    }

    #[test]
    fn unknown_and_malformed_options_are_rejected() {
        let err = ResilientJoinConfig::from_options([("hash_buckets", "3")]).unwrap_err();
        assert!(matches!(err, JoinError::Config(_)));

        let err = ResilientJoinConfig::from_options([("memory_budget", "lots")]).unwrap_err();
        assert!(err.to_string().contains("memory_budget"), "{err}");

        let err = ResilientJoinConfig::from_options([("eviction_policy", "lru")]).unwrap_err();
        assert!(err.to_string().contains("lru"), "{err}");
    }

    #[test]
    fn validation_catches_degenerate_settings() {
        let config = ResilientJoinConfig {
            top_k_free_fraction: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ResilientJoinConfig::default().with_num_buckets(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_budget_uses_default() {
        let config = ResilientJoinConfig::default().with_memory_budget(0);
        assert_eq!(config.effective_memory_budget(), DEFAULT_MEMORY_BUDGET);
    }
}
