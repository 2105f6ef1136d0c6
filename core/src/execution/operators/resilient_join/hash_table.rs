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

//! The in-memory hash table of one hash sub-join.
//!
//! Buckets are a tagged array; entries live in memory groups, arenas shared
//! by every bucket with the same index modulo the group count. When the table
//! goes over its memory budget the configured [`EvictionPolicy`] moves whole
//! buckets to spill partitions, and later build and probe tuples for those
//! buckets follow them there.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use datafusion::execution::memory_pool::{MemoryConsumer, MemoryReservation};
use datafusion::execution::runtime_env::RuntimeEnv;
use log::debug;

use crate::errors::{JoinError, JoinResult};
use crate::execution::config::{EvictionPolicy, ResilientJoinConfig};
use crate::execution::operators::resilient_join::metrics::SpillMetrics;
use crate::execution::operators::resilient_join::partition::SpillSet;
use crate::execution::operators::resilient_join::sizing::TableSize;
use crate::execution::operators::resilient_join::stats::SubJoinStats;
use crate::execution::spill::codec::encoded_len;
use crate::execution::spill::SpillWorkSet;
use crate::execution::tuple::{Tuple, ENTRY_MEMORY_OVERHEAD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Empty,
    /// Head of the entry chain in the bucket's memory group.
    InMemory { head: usize },
    Spilled,
}

/// Externally visible state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketState {
    Empty,
    InMemory,
    Spilled,
}

struct Entry {
    hash: u32,
    /// `None` once the tuple has moved to a spill partition.
    tuple: Option<Tuple>,
    next: Option<usize>,
}

#[derive(Default)]
struct MemoryGroup {
    entries: Vec<Entry>,
    live_bytes: usize,
}

/// Bucket and hash of the probe tuple most recently routed to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeCursor {
    pub bucket: usize,
    pub hash: u32,
}

/// A table shared by the sub-join that builds it and the sources that probe it.
pub(crate) type SharedTable = Arc<Mutex<HashTable>>;

pub(crate) struct HashTable {
    joiner_id: usize,
    num_buckets: usize,
    buckets: Vec<Bucket>,
    bucket_sizes: Vec<usize>,
    groups: Vec<MemoryGroup>,
    in_memory_bytes: usize,
    memory_budget: usize,
    policy: EvictionPolicy,
    top_k_heap_size: usize,
    top_k_free_fraction: f64,
    spill: SpillSet,
    reservation: MemoryReservation,
    probe_cursor: Option<ProbeCursor>,
    metrics: SpillMetrics,
}

impl HashTable {
    pub fn new(
        joiner_id: usize,
        size: TableSize,
        memory_budget: usize,
        config: &ResilientJoinConfig,
        runtime: &Arc<RuntimeEnv>,
        metrics: SpillMetrics,
    ) -> Self {
        let num_buckets = size.num_buckets.max(1);
        let reservation = MemoryConsumer::new(format!("ResilientJoin[{joiner_id}]"))
            .with_can_spill(true)
            .register(&runtime.memory_pool);
        let work_set = SpillWorkSet::new(
            Arc::clone(&runtime.disk_manager),
            format!("ResilientJoin[{joiner_id}] spill"),
        );
        Self {
            joiner_id,
            num_buckets,
            buckets: vec![Bucket::Empty; num_buckets],
            bucket_sizes: vec![0; num_buckets],
            groups: (0..config.memory_group_count.max(1))
                .map(|_| MemoryGroup::default())
                .collect(),
            in_memory_bytes: 0,
            memory_budget,
            policy: config.eviction_policy,
            top_k_heap_size: config.top_k_heap_size.max(1),
            top_k_free_fraction: config.top_k_free_fraction,
            spill: SpillSet::new(work_set, size.num_spill_files, metrics.clone()),
            reservation,
            probe_cursor: None,
            metrics,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn bucket_for(&self, hash: u32) -> usize {
        hash as usize % self.num_buckets
    }

    pub fn bucket_state(&self, bucket: usize) -> BucketState {
        match self.buckets.get(bucket) {
            Some(Bucket::InMemory { .. }) => BucketState::InMemory,
            Some(Bucket::Spilled) => BucketState::Spilled,
            Some(Bucket::Empty) | None => BucketState::Empty,
        }
    }

    pub fn is_spilled(&self, bucket: usize) -> bool {
        self.bucket_state(bucket) == BucketState::Spilled
    }

    pub fn in_memory_bytes(&self) -> usize {
        self.in_memory_bytes
    }

    pub fn memory_budget(&self) -> usize {
        self.memory_budget
    }

    pub fn spill_set(&self) -> &SpillSet {
        &self.spill
    }

    pub fn spill_set_mut(&mut self) -> &mut SpillSet {
        &mut self.spill
    }

    /// Adds a build tuple. Tuples of spilled buckets go straight to disk;
    /// otherwise the tuple is kept and the table evicts if it went over budget.
    pub fn insert(&mut self, hash: u32, tuple: Tuple) -> JoinResult<()> {
        let bucket = self.bucket_for(hash);
        match self.buckets.get(bucket) {
            Some(Bucket::Spilled) => return self.spill.spill_inner(bucket, &tuple),
            Some(_) => {}
            None => {
                return Err(JoinError::ContractViolation(format!(
                    "ResilientJoin[{}]: insert into a released hash table",
                    self.joiner_id
                )))
            }
        }

        let size = encoded_len(&tuple) + ENTRY_MEMORY_OVERHEAD;
        self.reserve(size)?;
        let head = match self.buckets[bucket] {
            Bucket::InMemory { head } => Some(head),
            Bucket::Empty => None,
            // spilled to make room for this tuple
            Bucket::Spilled => {
                self.reservation.shrink(size);
                return self.spill.spill_inner(bucket, &tuple);
            }
        };

        let group_count = self.groups.len();
        let group = &mut self.groups[bucket % group_count];
        group.entries.push(Entry {
            hash,
            tuple: Some(tuple),
            next: head,
        });
        group.live_bytes += size;
        self.buckets[bucket] = Bucket::InMemory {
            head: group.entries.len() - 1,
        };
        self.bucket_sizes[bucket] += size;
        self.in_memory_bytes += size;

        if self.in_memory_bytes > self.memory_budget {
            self.evict()?;
        }
        Ok(())
    }

    /// Reserves `size` bytes from the runtime memory pool, spilling the
    /// largest buckets while the pool refuses.
    fn reserve(&mut self, size: usize) -> JoinResult<()> {
        while let Err(e) = self.reservation.try_grow(size) {
            let Some(largest) = self.largest_in_memory_bucket() else {
                return Err(JoinError::ResourcesExhausted(format!(
                    "ResilientJoin[{}]: memory pool refused {size} bytes with nothing left \
                     to spill: {e}",
                    self.joiner_id
                )));
            };
            debug!(
                "ResilientJoin[{}]: memory pool refused {size} bytes, spilling bucket {largest} \
                 ({} bytes)",
                self.joiner_id, self.bucket_sizes[largest]
            );
            self.spill_bucket(largest, true)?;
            self.metrics.evictions.add(1);
        }
        Ok(())
    }

    /// Brings the table back within its memory budget.
    pub fn evict(&mut self) -> JoinResult<()> {
        let before = self.in_memory_bytes;
        match self.policy {
            EvictionPolicy::LargestBucket => self.spill_largest_buckets()?,
            EvictionPolicy::TopKBuckets => self.spill_top_k_buckets()?,
            EvictionPolicy::LargestMemoryGroup => self.spill_largest_memory_group()?,
        }
        // top-k and group eviction free a share that may fall short of the budget
        if self.in_memory_bytes > self.memory_budget {
            self.spill_largest_buckets()?;
        }
        self.metrics.evictions.add(1);
        debug!(
            "ResilientJoin[{}]: {} eviction freed {} of {} bytes (budget {})",
            self.joiner_id,
            self.policy,
            before - self.in_memory_bytes,
            before,
            self.memory_budget
        );
        Ok(())
    }

    fn largest_in_memory_bucket(&self) -> Option<usize> {
        self.bucket_sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size > 0)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
            .map(|(bucket, _)| bucket)
    }

    fn spill_largest_buckets(&mut self) -> JoinResult<()> {
        while self.in_memory_bytes > self.memory_budget {
            let largest = self.largest_in_memory_bucket().ok_or_else(|| {
                JoinError::ResourcesExhausted(format!(
                    "ResilientJoin[{}]: Could not find a bucket to spill",
                    self.joiner_id
                ))
            })?;
            self.spill_bucket(largest, true)?;
        }
        Ok(())
    }

    fn spill_top_k_buckets(&mut self) -> JoinResult<()> {
        let capacity = self.top_k_heap_size;
        let mut heap: BinaryHeap<Reverse<(usize, usize)>> = BinaryHeap::with_capacity(capacity);
        for (bucket, &size) in self.bucket_sizes.iter().enumerate() {
            if size == 0 {
                continue;
            }
            if heap.len() < capacity {
                heap.push(Reverse((size, bucket)));
            } else if heap
                .peek()
                .is_some_and(|Reverse((smallest, _))| size > *smallest)
            {
                heap.pop();
                heap.push(Reverse((size, bucket)));
            }
        }
        if heap.is_empty() {
            return Err(JoinError::ResourcesExhausted(format!(
                "ResilientJoin[{}]: Could not find a bucket to spill",
                self.joiner_id
            )));
        }

        let target = (self.in_memory_bytes as f64 * self.top_k_free_fraction).ceil() as usize;
        let mut freed = 0;
        // largest first
        for Reverse((_, bucket)) in heap.into_sorted_vec() {
            if freed >= target {
                break;
            }
            freed += self.spill_bucket(bucket, true)?;
        }
        Ok(())
    }

    fn spill_largest_memory_group(&mut self) -> JoinResult<()> {
        let group = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, group)| group.live_bytes > 0)
            .max_by(|a, b| a.1.live_bytes.cmp(&b.1.live_bytes).then(b.0.cmp(&a.0)))
            .map(|(index, _)| index)
            .ok_or_else(|| {
                JoinError::ResourcesExhausted(format!(
                    "ResilientJoin[{}]: Could not find a memory group to spill",
                    self.joiner_id
                ))
            })?;

        let group_count = self.groups.len();
        for bucket in (group..self.buckets.len()).step_by(group_count) {
            if matches!(self.buckets[bucket], Bucket::InMemory { .. }) {
                self.spill_bucket(bucket, false)?;
            }
        }
        let group = &mut self.groups[group];
        group.entries.clear();
        group.live_bytes = 0;
        Ok(())
    }

    /// Writes every tuple of an in-memory bucket to its inner spill partition
    /// and marks the bucket spilled. Returns the bytes released. With
    /// `free_entries` unset the entries stay until their group is reset.
    fn spill_bucket(&mut self, bucket: usize, free_entries: bool) -> JoinResult<usize> {
        let Some(Bucket::InMemory { head }) = self.buckets.get(bucket).copied() else {
            return Err(JoinError::ContractViolation(format!(
                "ResilientJoin[{}]: bucket {bucket} is not in memory",
                self.joiner_id
            )));
        };
        let group_index = bucket % self.groups.len();
        let entries = &mut self.groups[group_index].entries;
        let mut cursor = Some(head);
        while let Some(index) = cursor {
            let entry = entries.get_mut(index).ok_or_else(|| {
                JoinError::Execution(format!("broken entry chain in bucket {bucket}"))
            })?;
            cursor = entry.next;
            if let Some(tuple) = &entry.tuple {
                self.spill.spill_inner(bucket, tuple)?;
            }
            if free_entries {
                entry.tuple = None;
            }
        }

        let freed = std::mem::take(&mut self.bucket_sizes[bucket]);
        self.buckets[bucket] = Bucket::Spilled;
        let group = &mut self.groups[group_index];
        group.live_bytes -= freed;
        if group.live_bytes == 0 {
            group.entries.clear();
        }
        self.in_memory_bytes -= freed;
        self.reservation.shrink(freed);
        self.metrics.spill_count.add(1);
        Ok(freed)
    }

    /// Routes a probe tuple of a spilled bucket to its outer partition.
    pub fn spill_probe(&mut self, bucket: usize, tuple: &Tuple) -> JoinResult<()> {
        self.spill.spill_outer(bucket, tuple)
    }

    pub fn set_probe_cursor(&mut self, bucket: usize, hash: u32) {
        self.probe_cursor = Some(ProbeCursor { bucket, hash });
    }

    pub fn probe_cursor(&self) -> Option<ProbeCursor> {
        self.probe_cursor
    }

    /// First entry of an in-memory bucket.
    pub fn bucket_head(&self, bucket: usize) -> Option<usize> {
        match self.buckets.get(bucket) {
            Some(Bucket::InMemory { head }) => Some(*head),
            _ => None,
        }
    }

    /// Walks the chain of `bucket` from `cursor`, returning the next tuple
    /// with hash `hash` that `accept` takes. `cursor` is left after it.
    pub fn next_candidate<F>(
        &self,
        cursor: &mut Option<usize>,
        bucket: usize,
        hash: u32,
        mut accept: F,
    ) -> JoinResult<Option<Tuple>>
    where
        F: FnMut(&Tuple) -> JoinResult<bool>,
    {
        let Some(group) = self.groups.get(bucket % self.groups.len().max(1)) else {
            return Ok(None);
        };
        while let Some(index) = *cursor {
            let Some(entry) = group.entries.get(index) else {
                *cursor = None;
                break;
            };
            *cursor = entry.next;
            if entry.hash != hash {
                continue;
            }
            if let Some(tuple) = &entry.tuple {
                if accept(tuple)? {
                    return Ok(Some(tuple.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Records bucket occupancy and spilled partition sizes.
    pub fn collect_stats(&self, stats: &mut SubJoinStats) {
        for (bucket, state) in self.buckets.iter().enumerate() {
            match state {
                Bucket::Empty => stats.empty_buckets += 1,
                Bucket::Spilled => {}
                Bucket::InMemory { head } => {
                    stats.chain_length.record(self.chain_length(bucket, *head));
                    stats.bucket_bytes.record(self.bucket_sizes[bucket]);
                }
            }
        }
        stats.total_buckets = self.num_buckets;
        for size in self.spill.inner_partition_sizes() {
            stats.spilled_bytes.record(size);
        }
    }

    fn chain_length(&self, bucket: usize, head: usize) -> usize {
        let entries = &self.groups[bucket % self.groups.len()].entries;
        let mut length = 0;
        let mut cursor = Some(head);
        while let Some(entry) = cursor.and_then(|index| entries.get(index)) {
            length += usize::from(entry.tuple.is_some());
            cursor = entry.next;
        }
        length
    }

    /// Drops the bucket array and memory groups once probing is over. Spill
    /// partitions stay for the child sub-joins.
    pub fn release_in_memory(&mut self) {
        self.buckets = Vec::new();
        self.bucket_sizes = Vec::new();
        self.groups = Vec::new();
        self.in_memory_bytes = 0;
        self.probe_cursor = None;
        self.reservation.free();
    }
}
