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

//! The stack of sub-joins and the stage machine that drives it.
//!
//! The root sub-join reads the upstream operators. Every sub-join that
//! spills hands its partitions, a few at a time, to child sub-joins pushed
//! on top of it. Only the top of the stack does work; when it is done it is
//! popped and its parent carries on with its next partition set.

use std::sync::{Arc, Mutex};

use datafusion::execution::runtime_env::RuntimeEnv;
use datafusion::physical_plan::metrics::{ExecutionPlanMetricsSet, MetricsSet};
use log::{info, warn};

use crate::errors::{JoinError, JoinResult};
use crate::execution::config::ResilientJoinConfig;
use crate::execution::hash::HashComputer;
use crate::execution::operators::resilient_join::bucket_source::BucketSource;
use crate::execution::operators::resilient_join::definition::JoinDefinition;
use crate::execution::operators::resilient_join::hash_table::{HashTable, SharedTable};
use crate::execution::operators::resilient_join::metrics::ResilientJoinMetrics;
use crate::execution::operators::resilient_join::nested_loop::NestedLoopSource;
use crate::execution::operators::resilient_join::probe_source::SpillableProbeSource;
use crate::execution::operators::resilient_join::simple_join::{JoinContext, JoinType, SimpleJoin};
use crate::execution::operators::resilient_join::sizing::choose_table_size;
use crate::execution::operators::resilient_join::source::{
    BoxedSource, OperatorSource, RowOperator,
};
use crate::execution::operators::resilient_join::spilled_source::SpilledSource;
use crate::execution::operators::resilient_join::stats::{JoinAlgorithm, JoinStats, SubJoinStats};
use crate::execution::operators::resilient_join::{lock, SharedHasher};
use crate::execution::spill::{SpillSide, SpillWorkSet};
use crate::execution::tuple::Tuple;

/// A sub-join switches its children to nested loop when its largest spill
/// partition is still above this share of its parent's largest.
const NESTED_LOOP_SWITCH_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinStage {
    PreBuild,
    Build,
    Probe,
    ProcessSpilled,
    /// A child sub-join sits above this one on the stack.
    ProcessSpillChild,
    Done,
    NestedLoop,
    NestedLoopDone,
}

enum Step {
    Emit(Tuple),
    Continue,
    Finished,
}

struct Joiner {
    id: usize,
    /// Stack position of the parent sub-join.
    parent: Option<usize>,
    depth: usize,
    algorithm: JoinAlgorithm,
    stage: JoinStage,
    /// Sizing inputs are exact counts below the root.
    exact: bool,
    expected_rows: f64,
    expected_width: usize,
    /// Net build/probe swap relative to the plan.
    role_reversed: bool,
    seed: u16,
    build: Option<BoxedSource>,
    probe: Option<BoxedSource>,
    table: Option<SharedTable>,
    /// Held while this sub-join is producing rows.
    evaluator: Option<SimpleJoin>,
    largest_spill_partition: usize,
    parent_largest_spill_partition: usize,
}

impl Joiner {
    fn contract_violation(&self, what: &str) -> JoinError {
        JoinError::ContractViolation(format!("ResilientJoin[{}]: {what}", self.id))
    }
}

/// A hash join that stays within its memory budget by spilling buckets and
/// joining the spilled partitions recursively.
///
/// Rows are pulled with [`ResilientJoin::next_tuple`] or through the
/// [`Iterator`] implementation. Output order is unspecified, except that the
/// rows of one probe tuple come out together.
pub struct ResilientJoin {
    context: Arc<JoinContext>,
    config: ResilientJoinConfig,
    runtime: Arc<RuntimeEnv>,
    null_equals_null: bool,
    inner_hasher: SharedHasher,
    outer_hasher: SharedHasher,
    /// The shared evaluator while no sub-join holds it.
    evaluator: Option<SimpleJoin>,
    joiners: Vec<Joiner>,
    next_id: usize,
    stats: JoinStats,
    metrics_set: ExecutionPlanMetricsSet,
    metrics: ResilientJoinMetrics,
    finished: bool,
}

impl ResilientJoin {
    pub fn try_new(
        definition: JoinDefinition,
        config: ResilientJoinConfig,
        runtime: Arc<RuntimeEnv>,
        inner: Box<dyn RowOperator>,
        outer: Box<dyn RowOperator>,
    ) -> JoinResult<Self> {
        definition.validate()?;
        config.validate()?;
        let context = definition.context()?;
        let metrics_set = ExecutionPlanMetricsSet::new();
        let metrics = ResilientJoinMetrics::new(&metrics_set, 0);
        info!(
            "ResilientJoin: {} join on {} key(s) of {} and {}, memory budget {} bytes, {} eviction",
            definition.join_type,
            definition.on.len(),
            outer.name(),
            inner.name(),
            config.effective_memory_budget(),
            config.eviction_policy,
        );

        let root = Joiner {
            id: 0,
            parent: None,
            depth: 0,
            algorithm: JoinAlgorithm::Hash,
            stage: JoinStage::PreBuild,
            exact: false,
            expected_rows: config.expected_rows,
            expected_width: config.expected_width,
            role_reversed: false,
            seed: 0,
            build: Some(Box::new(OperatorSource::new(inner))),
            probe: Some(Box::new(OperatorSource::new(outer))),
            table: None,
            evaluator: None,
            largest_spill_partition: 0,
            parent_largest_spill_partition: 0,
        };
        let mut join = Self {
            evaluator: Some(SimpleJoin::new(Arc::clone(&context))),
            context,
            null_equals_null: definition.null_equals_null,
            inner_hasher: Arc::new(Mutex::new(HashComputer::new(definition.inner_keys()))),
            outer_hasher: Arc::new(Mutex::new(HashComputer::new(definition.outer_keys()))),
            config,
            runtime,
            joiners: Vec::new(),
            next_id: 0,
            stats: JoinStats::default(),
            metrics_set,
            metrics,
            finished: false,
        };
        join.push_joiner(root);
        Ok(join)
    }

    /// Returns the next output row, or `None` once the join is complete.
    ///
    /// On error every sub-join is released before the error is returned.
    pub fn next_tuple(&mut self) -> JoinResult<Option<Tuple>> {
        if self.finished {
            return Ok(None);
        }
        let elapsed_compute = self.metrics.baseline.elapsed_compute().clone();
        let timer = elapsed_compute.timer();
        let step = loop {
            match self.advance() {
                Ok(Step::Continue) => continue,
                other => break other,
            }
        };
        timer.done();

        match step {
            Ok(Step::Emit(tuple)) => {
                self.metrics.baseline.record_output(1);
                Ok(Some(tuple))
            }
            Ok(_) => {
                self.finished = true;
                self.metrics.baseline.done();
                info!(
                    "ResilientJoin: complete, {} sub-joins, {} rows produced",
                    self.next_id,
                    self.metrics.baseline.output_rows().value()
                );
                Ok(None)
            }
            Err(e) => {
                if let Err(cleanup) = self.close() {
                    warn!("ResilientJoin: cleanup after error failed: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Releases every sub-join with its sources, spill files and memory.
    /// The join produces no further rows afterwards.
    pub fn close(&mut self) -> JoinResult<()> {
        let mut result = Ok(());
        while let Some(mut joiner) = self.joiners.pop() {
            result = result.and(self.release_joiner(&mut joiner));
        }
        for hasher in [&self.inner_hasher, &self.outer_hasher] {
            result = result.and(lock(hasher).map(|mut hasher| hasher.reset()));
        }
        self.finished = true;
        result
    }

    /// Per sub-join statistics, collected when enabled in the config.
    pub fn stats(&self) -> &JoinStats {
        &self.stats
    }

    pub fn explain(&self) -> String {
        self.stats.explain()
    }

    pub fn metrics(&self) -> MetricsSet {
        self.metrics_set.clone_inner()
    }

    fn advance(&mut self) -> JoinResult<Step> {
        let Some(top) = self.joiners.len().checked_sub(1) else {
            return Ok(Step::Finished);
        };
        match self.joiners[top].stage {
            JoinStage::PreBuild => {
                self.joiners[top].stage = JoinStage::Build;
                Ok(Step::Continue)
            }
            JoinStage::Build => {
                self.build(top)?;
                Ok(Step::Continue)
            }
            JoinStage::Probe => self.probe(top),
            JoinStage::ProcessSpilled => {
                self.process_spilled(top)?;
                Ok(Step::Continue)
            }
            JoinStage::ProcessSpillChild => {
                // the child was popped
                self.joiners[top].stage = JoinStage::ProcessSpilled;
                Ok(Step::Continue)
            }
            JoinStage::NestedLoop => self.nested_loop(top),
            JoinStage::Done | JoinStage::NestedLoopDone => {
                self.finish_top()?;
                Ok(Step::Continue)
            }
        }
    }

    fn push_joiner(&mut self, mut joiner: Joiner) {
        joiner.id = self.next_id;
        self.next_id += 1;
        if joiner.depth > 0 {
            match joiner.algorithm {
                JoinAlgorithm::Hash => self.metrics.hash_sub_joins.add(1),
                JoinAlgorithm::NestedLoop => self.metrics.nested_loop_sub_joins.add(1),
            }
        }
        if self.config.collect_statistics {
            let parent_id = joiner
                .parent
                .and_then(|parent| self.joiners.get(parent))
                .map(|parent| parent.id);
            self.stats.push(SubJoinStats::new(
                joiner.id,
                parent_id,
                joiner.algorithm,
                joiner.role_reversed,
            ));
        }
        self.joiners.push(joiner);
    }

    fn build(&mut self, top: usize) -> JoinResult<()> {
        let build_time = self.metrics.build_time.clone();
        let _timer = build_time.timer();
        let memory_budget = self.config.effective_memory_budget();
        let joiner = &mut self.joiners[top];
        let hasher = if joiner.role_reversed {
            &self.outer_hasher
        } else {
            &self.inner_hasher
        };

        let size = choose_table_size(
            joiner.exact,
            joiner.expected_rows,
            joiner.expected_width,
            memory_budget,
            &self.config,
        );
        info!(
            "ResilientJoin[{}]: building at depth {} with {} buckets and {} spill files, \
             expecting {} rows of {} bytes, reversed={}",
            joiner.id,
            joiner.depth,
            size.num_buckets,
            size.num_spill_files,
            joiner.expected_rows,
            joiner.expected_width,
            joiner.role_reversed,
        );
        let mut table = HashTable::new(
            joiner.id,
            size,
            memory_budget,
            &self.config,
            &self.runtime,
            self.metrics.spill.clone(),
        );
        let mut source = joiner
            .build
            .take()
            .ok_or_else(|| joiner.contract_violation("build input already consumed"))?;

        lock(hasher)?.begin(joiner.id, joiner.seed)?;
        let mut rows = 0;
        let mut null_key_under_not_in = false;
        while let Some(tuple) = source.next()? {
            rows += 1;
            let (hash, all_null) = lock(hasher)?.compute(&tuple)?;
            if all_null {
                if self.context.join_type == JoinType::NotIn {
                    null_key_under_not_in = true;
                    break;
                }
                if !self.null_equals_null {
                    continue;
                }
            }
            table.insert(hash, tuple)?;
        }
        source.end()?;
        lock(hasher)?.end(joiner.id)?;
        if joiner.depth == 0 {
            self.metrics.build_input_rows.add(rows);
        }

        if null_key_under_not_in {
            info!(
                "ResilientJoin[{}]: null build key under NOT IN after {rows} rows, \
                 the join produces no rows",
                joiner.id
            );
            if let Some(evaluator) = self.evaluator.as_mut() {
                evaluator.set_join_done();
            }
            for joiner in self.joiners.iter_mut() {
                joiner.stage = JoinStage::Done;
            }
            return Ok(());
        }

        if self.config.collect_statistics {
            if let Some(stats) = self.stats.get_mut(joiner.id) {
                table.collect_stats(stats);
            }
        }
        info!(
            "ResilientJoin[{}]: build complete, {rows} rows, {} of {} bytes in memory \
             over {} buckets, spilled={}",
            joiner.id,
            table.in_memory_bytes(),
            table.memory_budget(),
            table.num_buckets(),
            table.spill_set().has_spilled(),
        );
        joiner.table = Some(Arc::new(Mutex::new(table)));
        joiner.stage = JoinStage::Probe;
        Ok(())
    }

    fn probe(&mut self, top: usize) -> JoinResult<Step> {
        if self.joiners[top].evaluator.is_none() {
            self.begin_probe(top)?;
        }
        let probe_time = self.metrics.probe_time.clone();
        let _timer = probe_time.timer();
        if let Some(tuple) = self.evaluate(top)? {
            return Ok(Step::Emit(tuple));
        }

        let joiner = &mut self.joiners[top];
        let (mut probe, mut candidates) = Self::release_evaluator(joiner, &mut self.evaluator)?;
        probe.end()?;
        candidates.end()?;
        let hasher = if joiner.role_reversed {
            &self.inner_hasher
        } else {
            &self.outer_hasher
        };
        lock(hasher)?.end(joiner.id)?;
        if let Some(table) = &joiner.table {
            let mut table = lock(table)?;
            table.release_in_memory();
            joiner.largest_spill_partition = table
                .spill_set()
                .inner_partition_sizes()
                .max()
                .unwrap_or(0);
        }
        joiner.stage = JoinStage::ProcessSpilled;
        Ok(Step::Continue)
    }

    fn begin_probe(&mut self, top: usize) -> JoinResult<()> {
        let joiner = &mut self.joiners[top];
        let table = joiner
            .table
            .clone()
            .ok_or_else(|| joiner.contract_violation("probe without a hash table"))?;
        let input = joiner
            .probe
            .take()
            .ok_or_else(|| joiner.contract_violation("probe input already consumed"))?;
        let hasher = Arc::clone(if joiner.role_reversed {
            &self.inner_hasher
        } else {
            &self.outer_hasher
        });
        lock(&hasher)?.begin(joiner.id, joiner.seed)?;

        let input_rows = (joiner.depth == 0).then(|| self.metrics.input_rows.clone());
        let probe = SpillableProbeSource::new(input, hasher, Arc::clone(&table), input_rows);
        let candidates = BucketSource::new(
            table,
            Arc::clone(&self.context.predicate),
            joiner.role_reversed,
        );
        Self::acquire_evaluator(joiner, &mut self.evaluator, Box::new(probe), Box::new(candidates))
    }

    fn begin_nested_loop(&mut self, top: usize) -> JoinResult<()> {
        let joiner = &mut self.joiners[top];
        let build = joiner
            .build
            .take()
            .ok_or_else(|| joiner.contract_violation("build input already consumed"))?;
        let probe = joiner
            .probe
            .take()
            .ok_or_else(|| joiner.contract_violation("probe input already consumed"))?;
        let work_set = SpillWorkSet::new(
            Arc::clone(&self.runtime.disk_manager),
            format!("ResilientJoin[{}] nested loop", joiner.id),
        );
        let candidates = NestedLoopSource::new(
            build,
            work_set,
            Arc::clone(&self.context.predicate),
            joiner.role_reversed,
        );
        info!(
            "ResilientJoin[{}]: nested loop at depth {}, reversed={}",
            joiner.id, joiner.depth, joiner.role_reversed
        );
        Self::acquire_evaluator(joiner, &mut self.evaluator, probe, Box::new(candidates))
    }

    fn nested_loop(&mut self, top: usize) -> JoinResult<Step> {
        if self.joiners[top].evaluator.is_none() {
            self.begin_nested_loop(top)?;
        }
        let probe_time = self.metrics.probe_time.clone();
        let _timer = probe_time.timer();
        if let Some(tuple) = self.evaluate(top)? {
            return Ok(Step::Emit(tuple));
        }

        let joiner = &mut self.joiners[top];
        let (mut probe, mut candidates) = Self::release_evaluator(joiner, &mut self.evaluator)?;
        probe.end()?;
        candidates.end()?;
        joiner.stage = JoinStage::NestedLoopDone;
        Ok(Step::Continue)
    }

    fn evaluate(&mut self, top: usize) -> JoinResult<Option<Tuple>> {
        let joiner = &mut self.joiners[top];
        match joiner.evaluator.as_mut() {
            Some(evaluator) => evaluator.next(),
            None => Err(joiner.contract_violation("evaluator not held")),
        }
    }

    /// Moves the shared evaluator into `joiner` and binds it to the sources.
    fn acquire_evaluator(
        joiner: &mut Joiner,
        shared: &mut Option<SimpleJoin>,
        probe: BoxedSource,
        candidates: BoxedSource,
    ) -> JoinResult<()> {
        let mut evaluator = shared
            .take()
            .ok_or_else(|| joiner.contract_violation("evaluator is held by another sub-join"))?;
        if let Err(e) = evaluator.begin(joiner.id, probe, candidates, joiner.role_reversed) {
            *shared = Some(evaluator);
            return Err(e);
        }
        joiner.evaluator = Some(evaluator);
        Ok(())
    }

    /// Hands the evaluator back and returns the sources it was bound to.
    fn release_evaluator(
        joiner: &mut Joiner,
        shared: &mut Option<SimpleJoin>,
    ) -> JoinResult<(BoxedSource, BoxedSource)> {
        let mut evaluator = joiner
            .evaluator
            .take()
            .ok_or_else(|| joiner.contract_violation("evaluator not held"))?;
        let sources = evaluator.end(joiner.id);
        *shared = Some(evaluator);
        sources
    }

    fn child_algorithm(&self, top: usize) -> JoinAlgorithm {
        let joiner = &self.joiners[top];
        if joiner.depth + 1 > self.config.max_recursion_depth {
            warn!(
                "ResilientJoin[{}]: recursion depth {} exceeds {}, joining the remaining \
                 partitions with a nested loop",
                joiner.id,
                joiner.depth + 1,
                self.config.max_recursion_depth
            );
            return JoinAlgorithm::NestedLoop;
        }
        if joiner.parent.is_some()
            && self.config.nested_loop_switch
            && NESTED_LOOP_SWITCH_FACTOR * (joiner.parent_largest_spill_partition as f64)
                < joiner.largest_spill_partition as f64
        {
            info!(
                "ResilientJoin[{}]: largest spill partition {} bytes did not shrink enough \
                 from {} bytes, switching to nested loop",
                joiner.id, joiner.largest_spill_partition, joiner.parent_largest_spill_partition
            );
            return JoinAlgorithm::NestedLoop;
        }
        JoinAlgorithm::Hash
    }

    fn process_spilled(&mut self, top: usize) -> JoinResult<()> {
        let algorithm = self.child_algorithm(top);
        let quota = match algorithm {
            JoinAlgorithm::NestedLoop => 0,
            JoinAlgorithm::Hash => self.config.effective_memory_budget(),
        };
        let join_type = self.context.join_type;
        let joiner = &mut self.joiners[top];
        let Some(shared) = joiner.table.as_ref().map(Arc::clone) else {
            joiner.stage = JoinStage::Done;
            return Ok(());
        };
        let mut table = lock(&shared)?;
        let spill_set = table.spill_set_mut();
        let Some(set) = spill_set.choose_next_partition_set(
            quota,
            join_type.allows_role_reversal(),
            joiner.role_reversed,
            join_type.emits_unmatched(),
            self.config.partition_tuning,
        ) else {
            joiner.stage = JoinStage::Done;
            return Ok(());
        };
        let inner = spill_set.take_partitions(&set.indices, SpillSide::Inner);
        let outer = spill_set.take_partitions(&set.indices, SpillSide::Outer);
        drop(table);

        // spill partitions keep this sub-join's orientation
        let (build, probe) = if set.role_reversed != joiner.role_reversed {
            (outer, inner)
        } else {
            (inner, outer)
        };
        info!(
            "ResilientJoin[{}]: {algorithm} sub-join over spill partitions {:?}, \
             {} build rows of {} bytes, reversed={}",
            joiner.id, set.indices, set.build_rows, set.build_width, set.role_reversed
        );
        let child = Joiner {
            id: 0,
            parent: Some(top),
            depth: joiner.depth + 1,
            algorithm,
            stage: match algorithm {
                JoinAlgorithm::Hash => JoinStage::PreBuild,
                JoinAlgorithm::NestedLoop => JoinStage::NestedLoop,
            },
            exact: true,
            expected_rows: set.build_rows as f64,
            expected_width: set.build_width,
            role_reversed: set.role_reversed,
            seed: joiner.seed.saturating_add(1),
            build: Some(Box::new(SpilledSource::new(build))),
            probe: Some(Box::new(SpilledSource::new(probe))),
            table: None,
            evaluator: None,
            largest_spill_partition: 0,
            parent_largest_spill_partition: joiner.largest_spill_partition,
        };
        joiner.stage = JoinStage::ProcessSpillChild;
        self.push_joiner(child);
        Ok(())
    }

    fn finish_top(&mut self) -> JoinResult<()> {
        let Some(mut joiner) = self.joiners.pop() else {
            return Ok(());
        };
        let result = self.release_joiner(&mut joiner);
        let files = joiner
            .table
            .as_ref()
            .map_or(Ok(0), |table| lock(table).map(|t| t.spill_set().files_created()));
        info!(
            "ResilientJoin[{}]: {} sub-join done, {} spill files",
            joiner.id,
            joiner.algorithm,
            files.unwrap_or(0)
        );
        joiner.table = None;
        result
    }

    /// Ends whatever `joiner` still holds. The first error wins, but every
    /// resource is released.
    fn release_joiner(&mut self, joiner: &mut Joiner) -> JoinResult<()> {
        let mut result = Ok(());
        if joiner.evaluator.is_some() {
            match Self::release_evaluator(joiner, &mut self.evaluator) {
                Ok((mut probe, mut candidates)) => {
                    result = result.and(probe.end()).and(candidates.end());
                }
                Err(e) => result = result.and(Err(e)),
            }
        }
        for mut source in [joiner.build.take(), joiner.probe.take()]
            .into_iter()
            .flatten()
        {
            result = result.and(source.end());
        }
        result
    }
}

impl Iterator for ResilientJoin {
    type Item = JoinResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tuple().transpose()
    }
}

impl Drop for ResilientJoin {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("ResilientJoin: failed to release resources on drop: {e}");
        }
    }
}
