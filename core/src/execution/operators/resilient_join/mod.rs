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

//! A hash join that degrades gracefully when its build side does not fit in
//! memory.
//!
//! The build side is loaded into a bucketed hash table. When the table goes
//! over budget whole buckets are evicted to spill partitions on disk, and
//! probe tuples of evicted buckets follow them there. Once the in-memory part
//! is probed, the spilled partitions are joined by child sub-joins with a
//! fresh hash seed, recursively, falling back to a nested loop join when
//! recursion stops making progress.

mod bucket_source;
mod definition;
mod hash_table;
mod joiner;
mod metrics;
mod nested_loop;
mod partition;
mod probe_source;
mod simple_join;
mod sizing;
mod source;
mod spilled_source;
mod stats;

use std::sync::{Arc, Mutex, MutexGuard};

pub use definition::JoinDefinition;
pub use joiner::ResilientJoin;
pub use simple_join::{ColumnRef, JoinType, RowPredicate};
pub use source::{
    BoxedSource, MemoryOperator, OperatorSource, RecordBatchOperator, RowOperator, TupleSource,
};
pub use stats::{Aggregate, JoinAlgorithm, JoinStats, SubJoinStats};

use crate::errors::{JoinError, JoinResult};
use crate::execution::hash::HashComputer;

pub(crate) type SharedHasher = Arc<Mutex<HashComputer>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> JoinResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| JoinError::Execution(format!("lock poisoned: {e}")))
}
