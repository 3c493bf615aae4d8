//! 3D state shared between the draw path and the query coordinator.
//!
//! `Render3d` owns the pipeline and the queries. It is the `QueryRing` owner of
//! the command parser: losing the render ring pauses every pausable active
//! query, getting it back resumes them, and the owner reservation always
//! covers the pause captures.

use std::sync::Arc;

use tracing::{debug, error};

use crate::cp::CommandParser;
use crate::error::Result;
use crate::owner::OwnerRelease;
use crate::pipeline::{Invalidate, Pipeline, PipelineAction};
use crate::query::{QueryArena, QueryId, QueryType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderConditionMode {
    Wait,
    NoWait,
    ByRegionWait,
    ByRegionNoWait,
}

impl RenderConditionMode {
    pub fn waits(self) -> bool {
        matches!(self, Self::Wait | Self::ByRegionWait)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderCondition {
    pub query: QueryId,
    pub mode: RenderConditionMode,
    pub inverted: bool,
}

pub struct Render3d {
    pub(crate) pipeline: Box<dyn Pipeline>,
    pub(crate) queries: QueryArena,
    active: [Vec<QueryId>; 6],
    owner_reserve: u32,
    new_batch: bool,
}

impl Render3d {
    pub fn new(pipeline: Box<dyn Pipeline>) -> Self {
        Self {
            pipeline,
            queries: QueryArena::new(),
            active: Default::default(),
            owner_reserve: 0,
            new_batch: true,
        }
    }

    /// Dwords the pause captures of every active query take.
    pub fn owner_reserve(&self) -> u32 {
        self.owner_reserve
    }

    /// Whether nothing was drawn since the last submission.
    pub fn is_new_batch(&self) -> bool {
        self.new_batch
    }

    pub(crate) fn set_drawn(&mut self) {
        self.new_batch = false;
    }

    pub fn active_queries(&self, kind: QueryType) -> &[QueryId] {
        &self.active[kind.index()]
    }

    pub(crate) fn query_cost(&self, kind: QueryType) -> u32 {
        self.pipeline.estimate(PipelineAction::Query(kind))
    }

    /// Puts `id` in the active set of its type and grows the reservation by
    /// what pausing it costs.
    pub(crate) fn activate(&mut self, id: QueryId, kind: QueryType) -> Result<()> {
        self.queries.get_mut(id)?.set_active(true);
        self.active[kind.index()].push(id);
        if kind.is_pausable() {
            self.owner_reserve += self.query_cost(kind);
        }
        Ok(())
    }

    pub(crate) fn deactivate(&mut self, id: QueryId, kind: QueryType) -> Result<()> {
        self.queries.get_mut(id)?.set_active(false);
        self.active[kind.index()].retain(|q| *q != id);
        if kind.is_pausable() {
            self.owner_reserve -= self.query_cost(kind);
        }
        Ok(())
    }

    /// Writes one capture of query `id` into its next slot.
    pub(crate) fn capture(&mut self, cp: &mut CommandParser, id: QueryId) -> Result<()> {
        let query = self.queries.get_mut(id)?;
        let kind = query.kind();
        let Some(bo) = query.bo().cloned() else {
            return Ok(());
        };
        let offset = query.claim_slot();
        self.pipeline.emit_query(cp, kind, &bo, offset)
    }

    fn pausable_active(&self) -> Vec<QueryId> {
        QueryType::ALL
            .iter()
            .filter(|kind| kind.is_pausable())
            .flat_map(|kind| self.active[kind.index()].iter().copied())
            .collect()
    }

    /// Emits the end capture of every active pausable query.
    pub fn pause_queries(&mut self, cp: &mut CommandParser) -> Result<()> {
        for id in self.pausable_active() {
            self.capture(cp, id)?;
        }
        Ok(())
    }

    /// Emits a begin capture for every active pausable query, draining the
    /// ones whose buffer has no room for another pair first.
    pub fn resume_queries(&mut self, cp: &mut CommandParser) -> Result<()> {
        let winsys = Arc::clone(cp.winsys());
        for id in self.pausable_active() {
            let query = self.queries.get_mut(id)?;
            if query.needs_drain() {
                debug_assert!(
                    !query.bo().is_some_and(|bo| cp.has_reloc(bo)),
                    "draining a query captured in the current batch"
                );
                query.process(winsys.as_ref());
                cp.stats().inc_query_drains();
                debug!(?id, "drained full query buffer");
            }
            self.capture(cp, id)?;
        }
        Ok(())
    }

    /// Runs after every successful submission.
    pub(crate) fn on_flush(&mut self) {
        self.pipeline
            .invalidate(Invalidate::BATCH_BO | Invalidate::STATE_BO);
        self.new_batch = true;
    }

    /// Counts a draw into the CPU-side primitive queries.
    pub(crate) fn count_primitives(&mut self, generated: u64, emitted: u64) -> Result<()> {
        for (kind, value) in [
            (QueryType::PrimitivesGenerated, generated),
            (QueryType::PrimitivesEmitted, emitted),
        ] {
            for id in self.active[kind.index()].clone() {
                self.queries.get_mut(id)?.add(value);
            }
        }
        Ok(())
    }
}

impl OwnerRelease for Render3d {
    fn release(&mut self, cp: &mut CommandParser) {
        if let Err(err) = self.pause_queries(cp) {
            error!(%err, "failed to pause queries");
        }
    }
}

impl std::fmt::Debug for Render3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Render3d")
            .field("queries", &self.queries.len())
            .field("owner_reserve", &self.owner_reserve)
            .field("new_batch", &self.new_batch)
            .finish_non_exhaustive()
    }
}
