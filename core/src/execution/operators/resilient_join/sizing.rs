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

//! Bucket and spill-file counts for a sub-join's hash table.

use crate::execution::config::{ResilientJoinConfig, DEFAULT_EXPECTED_ROWS};
use crate::execution::tuple::ENTRY_MEMORY_OVERHEAD;

/// Prime bucket counts, roughly doubling.
const BUCKET_PRIMES: [usize; 21] = [
    1033, 2063, 4111, 8219, 16417, 32779, 65539, 131111, 262151, 524341, 1048589, 2097211,
    4194329, 8388619, 16777289, 33554473, 67108913, 134217773, 268435463, 536870951,
    1073741831,
];

/// Bytes the bucket array spends per bucket.
const BUCKET_POINTER_SIZE: usize = 8;

/// Upper bound for bucket and spill-file counts derived from estimates.
const MAX_DERIVED_COUNT: usize = i32::MAX as usize / 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableSize {
    pub num_buckets: usize,
    pub num_spill_files: usize,
}

/// The smallest listed prime at least `buckets`, or the largest one.
pub(crate) fn prime_bucket_count(buckets: usize) -> usize {
    BUCKET_PRIMES
        .iter()
        .copied()
        .find(|&prime| prime >= buckets)
        .unwrap_or(BUCKET_PRIMES[BUCKET_PRIMES.len() - 1])
}

/// Sizes a hash table for `rows` build tuples of `width` bytes.
///
/// `exact` is set below the root, where the counts come from spilled data
/// rather than planner estimates.
pub(crate) fn choose_table_size(
    exact: bool,
    rows: f64,
    width: usize,
    memory_budget: usize,
    config: &ResilientJoinConfig,
) -> TableSize {
    let tuples_per_bucket = config.tuples_per_bucket.max(1);
    let (buckets, spill_files) = if exact {
        let buckets = rows.max(0.0) as usize / tuples_per_bucket;
        let buckets = limit_to_metadata_budget(buckets, memory_budget, config);
        (buckets, (buckets / 4).max(config.min_spill_files))
    } else {
        let mut rows = rows / config.segment_count.max(1) as f64;
        if !rows.is_finite() || rows < 0.0 {
            rows = DEFAULT_EXPECTED_ROWS;
        }
        let rows = rows as usize;
        let entry_size = width + ENTRY_MEMORY_OVERHEAD;
        let total = rows.saturating_mul(entry_size);
        let budget = memory_budget.max(1);

        let (buckets, spill_files) = if total > budget {
            let in_memory_rows = budget / entry_size;
            let buckets = (in_memory_rows / tuples_per_bucket).min(MAX_DERIVED_COUNT);
            let mut spill_files = total.div_ceil(budget).min(MAX_DERIVED_COUNT);
            if config.max_spill_files > 0 {
                spill_files = spill_files.min(config.max_spill_files);
            }
            (buckets, spill_files)
        } else {
            let from_rows = rows / tuples_per_bucket;
            let from_memory = budget / (entry_size * tuples_per_bucket);
            let buckets = if from_memory > from_rows {
                (from_rows + from_memory).div_ceil(2)
            } else {
                from_rows
            };
            (buckets, 1)
        };
        let buckets = limit_to_metadata_budget(buckets, memory_budget, config);
        (buckets, spill_files.max(config.min_spill_files))
    };

    TableSize {
        num_buckets: config
            .num_buckets
            .unwrap_or_else(|| prime_bucket_count(buckets)),
        num_spill_files: config.num_spill_files.unwrap_or(spill_files).max(1),
    }
}

/// Fits the bucket array to its share of the memory budget. The array uses
/// that share in full: smaller requests are raised to it.
fn limit_to_metadata_budget(
    buckets: usize,
    memory_budget: usize,
    config: &ResilientJoinConfig,
) -> usize {
    let metadata_budget = memory_budget / 100 * config.metadata_memory_percent
        + memory_budget % 100 * config.metadata_memory_percent / 100;
    let affordable = metadata_budget / BUCKET_POINTER_SIZE;
    if buckets.saturating_mul(BUCKET_POINTER_SIZE) > metadata_budget {
        affordable
    } else {
        buckets.max(affordable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primes_round_up_and_saturate() {
        assert_eq!(prime_bucket_count(0), 1033);
        assert_eq!(prime_bucket_count(1033), 1033);
        assert_eq!(prime_bucket_count(1034), 2063);
        assert_eq!(prime_bucket_count(usize::MAX), 1073741831);
    }

    #[test]
    fn small_budgets_use_the_smallest_prime() {
        let config = ResilientJoinConfig::default();
        let size = choose_table_size(false, 1_000_000.0, 100, 64 * 1024, &config);
        assert_eq!(size.num_buckets, 1033);
        // 1M rows of 116 bytes over a 64 KiB budget
        assert_eq!(size.num_spill_files, (116_000_000usize).div_ceil(64 * 1024));
    }

    #[test]
    fn metadata_share_sets_the_bucket_count() {
        let config = ResilientJoinConfig::default();
        // 10% of 64 MiB spent on 8 byte slots
        let size = choose_table_size(false, 1000.0, 32, 64 * 1024 * 1024, &config);
        assert_eq!(size.num_buckets, prime_bucket_count(64 * 1024 * 1024 / 10 / 8));
        assert_eq!(size.num_spill_files, config.min_spill_files);
    }

    #[test]
    fn spill_files_respect_the_cap() {
        let config = ResilientJoinConfig {
            max_spill_files: 150,
            ..Default::default()
        };
        let size = choose_table_size(false, 1_000_000.0, 100, 64 * 1024, &config);
        assert_eq!(size.num_spill_files, 150);

        let config = ResilientJoinConfig {
            max_spill_files: 10,
            ..Default::default()
        };
        let size = choose_table_size(false, 1_000_000.0, 100, 64 * 1024, &config);
        assert_eq!(size.num_spill_files, config.min_spill_files);
    }

    #[test]
    fn segments_divide_the_estimate() {
        let config = ResilientJoinConfig {
            segment_count: 4,
            min_spill_files: 1,
            ..Default::default()
        };
        let size = choose_table_size(false, 4_000_000.0, 100, 64 * 1024 * 1024, &config);
        // 1M rows of 116 bytes against 64 MiB
        assert_eq!(size.num_spill_files, 116_000_000usize.div_ceil(64 * 1024 * 1024));
    }

    #[test]
    fn children_derive_spill_files_from_buckets() {
        let config = ResilientJoinConfig::default();
        let size = choose_table_size(true, 10_000_000.0, 10, 1024 * 1024 * 1024, &config);
        // the metadata share outweighs rows / tuples_per_bucket
        let buckets = 1024 * 1024 * 1024 / 10 / 8;
        assert_eq!(size.num_spill_files, buckets / 4);
        assert_eq!(size.num_buckets, prime_bucket_count(buckets));
    }

    #[test]
    fn overrides_win() {
        let config = ResilientJoinConfig::default()
            .with_num_buckets(3)
            .with_num_spill_files(2);
        let size = choose_table_size(true, 100.0, 8, 1024, &config);
        assert_eq!(
            size,
            TableSize {
                num_buckets: 3,
                num_spill_files: 2
            }
        );
    }
}
