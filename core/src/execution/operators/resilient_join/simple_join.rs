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

//! Joins one probe tuple at a time against a stream of candidate tuples.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use datafusion::common::ScalarValue;

use crate::errors::{JoinError, JoinResult};
use crate::execution::operators::resilient_join::source::BoxedSource;
use crate::execution::tuple::Tuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    /// At most one output row per matched outer row.
    Semi,
    /// Outer rows without a match.
    Anti,
    /// Anti join that yields nothing once the inner side holds a null key.
    NotIn,
}

impl JoinType {
    /// Unmatched outer rows are emitted padded with nulls.
    pub fn emits_unmatched(&self) -> bool {
        matches!(self, JoinType::Left | JoinType::Anti | JoinType::NotIn)
    }

    pub fn is_anti(&self) -> bool {
        matches!(self, JoinType::Anti | JoinType::NotIn)
    }

    /// Only a plain inner join may build on either side.
    pub fn allows_role_reversal(&self) -> bool {
        matches!(self, JoinType::Inner)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Semi => "semi",
            JoinType::Anti => "anti",
            JoinType::NotIn => "not_in",
        };
        f.write_str(name)
    }
}

impl FromStr for JoinType {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" | "left_outer" => Ok(JoinType::Left),
            "semi" | "in" => Ok(JoinType::Semi),
            "anti" => Ok(JoinType::Anti),
            "not_in" | "notin" => Ok(JoinType::NotIn),
            other => Err(JoinError::Config(format!("Unsupported join type: {other}"))),
        }
    }
}

/// A column of the output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRef {
    Outer(usize),
    Inner(usize),
}

/// Predicate over an (outer, inner) row pair.
pub type RowPredicate = Arc<dyn Fn(&Tuple, &Tuple) -> JoinResult<bool> + Send + Sync>;

/// Orders a (probe, candidate) pair as (outer, inner) of the original plan.
pub(crate) fn orient<'a>(
    probe: &'a Tuple,
    candidate: &'a Tuple,
    role_reversed: bool,
) -> (&'a Tuple, &'a Tuple) {
    if role_reversed {
        (candidate, probe)
    } else {
        (probe, candidate)
    }
}

pub(crate) fn keys_equal(left: &ScalarValue, right: &ScalarValue, null_equals_null: bool) -> bool {
    match (left.is_null(), right.is_null()) {
        (false, false) => left == right,
        (true, true) => null_equals_null,
        _ => false,
    }
}

/// Key equality plus the optional ON-clause filter.
pub(crate) struct JoinPredicate {
    pub on: Vec<(usize, usize)>,
    pub null_equals_null: bool,
    pub filter: Option<RowPredicate>,
}

impl JoinPredicate {
    pub fn matches(&self, probe: &Tuple, candidate: &Tuple, role_reversed: bool) -> JoinResult<bool> {
        let (outer, inner) = orient(probe, candidate, role_reversed);
        for &(outer_col, inner_col) in &self.on {
            let (Some(left), Some(right)) = (outer.get(outer_col), inner.get(inner_col)) else {
                return Err(JoinError::Execution(format!(
                    "Join key ({outer_col}, {inner_col}) is out of range"
                )));
            };
            if !keys_equal(left, right, self.null_equals_null) {
                return Ok(false);
            }
        }
        match &self.filter {
            Some(filter) => filter(outer, inner),
            None => Ok(true),
        }
    }
}

/// Everything the evaluator needs that does not change between sub-joins.
pub(crate) struct JoinContext {
    pub join_type: JoinType,
    pub predicate: Arc<JoinPredicate>,
    pub output_filter: Option<RowPredicate>,
    pub projection: Vec<ColumnRef>,
    pub null_inner: Tuple,
}

impl JoinContext {
    fn project(&self, outer: &Tuple, inner: &Tuple) -> JoinResult<Tuple> {
        self.projection
            .iter()
            .map(|column| {
                let value = match column {
                    ColumnRef::Outer(i) => outer.get(*i),
                    ColumnRef::Inner(i) => inner.get(*i),
                };
                value.cloned().ok_or_else(|| {
                    JoinError::Execution(format!("Projected column {column:?} is out of range"))
                })
            })
            .collect::<JoinResult<Vec<_>>>()
            .map(Tuple::new)
    }
}

/// The shared single-probe evaluator. A sub-join binds it with
/// [`SimpleJoin::begin`], pulls rows, and hands the sources back with
/// [`SimpleJoin::end`].
pub struct SimpleJoin {
    context: Arc<JoinContext>,
    owner: Option<usize>,
    probe_source: Option<BoxedSource>,
    candidates: Option<BoxedSource>,
    role_reversed: bool,
    probe: Option<Tuple>,
    need_new_probe: bool,
    emit_unmatched: bool,
    join_done: bool,
}

impl SimpleJoin {
    pub(crate) fn new(context: Arc<JoinContext>) -> Self {
        Self {
            context,
            owner: None,
            probe_source: None,
            candidates: None,
            role_reversed: false,
            probe: None,
            need_new_probe: true,
            emit_unmatched: false,
            join_done: false,
        }
    }

    pub fn begin(
        &mut self,
        owner: usize,
        probe_source: BoxedSource,
        candidates: BoxedSource,
        role_reversed: bool,
    ) -> JoinResult<()> {
        if let Some(current) = self.owner {
            return Err(JoinError::ContractViolation(format!(
                "Cannot acquire SimpleJoin for sub-join {owner}: owned by sub-join {current}"
            )));
        }
        self.owner = Some(owner);
        self.probe_source = Some(probe_source);
        self.candidates = Some(candidates);
        self.role_reversed = role_reversed;
        self.probe = None;
        self.need_new_probe = true;
        self.emit_unmatched = self.context.join_type.emits_unmatched();
        Ok(())
    }

    pub fn end(&mut self, owner: usize) -> JoinResult<(BoxedSource, BoxedSource)> {
        if self.owner != Some(owner) {
            return Err(JoinError::ContractViolation(format!(
                "Cannot release SimpleJoin for sub-join {owner}: owner is {:?}",
                self.owner
            )));
        }
        self.owner = None;
        self.probe = None;
        match (self.probe_source.take(), self.candidates.take()) {
            (Some(probe), Some(candidates)) => Ok((probe, candidates)),
            _ => Err(JoinError::ContractViolation(
                "SimpleJoin released without bound sources".to_string(),
            )),
        }
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    /// Makes every further `next` call report the end of the join.
    pub fn set_join_done(&mut self) {
        self.join_done = true;
    }

    pub fn is_join_done(&self) -> bool {
        self.join_done
    }

    pub fn next(&mut self) -> JoinResult<Option<Tuple>> {
        let join_type = self.context.join_type;
        loop {
            if self.join_done {
                return Ok(None);
            }
            if self.need_new_probe && (self.join_done || !self.read_new_probe()?) {
                return Ok(None);
            }

            let (Some(candidates), Some(probe)) = (self.candidates.as_mut(), self.probe.as_ref())
            else {
                return Err(JoinError::ContractViolation(
                    "SimpleJoin used without an owner".to_string(),
                ));
            };

            loop {
                let Some(candidate) = candidates.next()? else {
                    self.need_new_probe = true;
                    if self.emit_unmatched {
                        self.emit_unmatched = false;
                        let (outer, inner) = orient(probe, &self.context.null_inner, false);
                        let row = self.context.project(outer, inner)?;
                        return Ok(Some(row));
                    }
                    break;
                };

                // candidates already satisfy the join predicate
                self.emit_unmatched = false;
                if join_type.is_anti() {
                    self.need_new_probe = true;
                    break;
                }

                let (outer, inner) = orient(probe, &candidate, self.role_reversed);
                let passes = match &self.context.output_filter {
                    Some(filter) => filter(outer, inner)?,
                    None => true,
                };
                if passes {
                    if join_type == JoinType::Semi {
                        self.need_new_probe = true;
                    }
                    return self.context.project(outer, inner).map(Some);
                }
            }
        }
    }

    /// Returns false once the probe source is exhausted.
    fn read_new_probe(&mut self) -> JoinResult<bool> {
        self.need_new_probe = false;
        let (Some(probe_source), Some(candidates)) =
            (self.probe_source.as_mut(), self.candidates.as_mut())
        else {
            return Err(JoinError::ContractViolation(
                "SimpleJoin used without an owner".to_string(),
            ));
        };
        let Some(probe) = probe_source.next()? else {
            self.probe = None;
            return Ok(false);
        };
        if self.context.join_type.emits_unmatched() {
            self.emit_unmatched = true;
        }
        candidates.rescan(&probe)?;
        self.probe = Some(probe);
        Ok(true)
    }
}
