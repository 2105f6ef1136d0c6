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

//! A resilient, adaptive hash join for row streams.
//!
//! [`ResilientJoin`] joins an inner (build) and an outer (probe) row stream
//! within a fixed memory budget. Buckets that do not fit are spilled to
//! temporary files through DataFusion's disk manager and joined recursively.

// The lint makes easier for code reader/reviewer separate references clones from more heavyweight ones
#![deny(clippy::clone_on_ref_ptr)]

pub mod errors;
pub mod execution;

pub use errors::{JoinError, JoinResult};
pub use execution::config::{EvictionPolicy, ResilientJoinConfig};
pub use execution::operators::resilient_join::{
    ColumnRef, JoinDefinition, JoinStats, JoinType, MemoryOperator, RecordBatchOperator,
    ResilientJoin, RowOperator, RowPredicate,
};
pub use execution::tuple::Tuple;
