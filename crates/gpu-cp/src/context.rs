//! The public entry point: one command parser plus the 3D state driving it.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::blit;
use crate::bo::BufferObject;
use crate::config::{CpConfig, DebugFlags};
use crate::cp::{CommandParser, FlushOutcome};
use crate::error::{CpError, Result};
use crate::owner::{OwnerId, ReleaseHook};
use crate::pipeline::{
    DirtyFlags, DrawInfo, Invalidate, KernelBinding, Pipeline, PipelineAction, ReferencePipeline,
};
use crate::query::{QueryId, QueryResult, QueryType};
use crate::render::{Render3d, RenderCondition, RenderConditionMode};
use crate::shader_cache::{KernelId, ShaderCache};
use crate::stats::CpStatsSnapshot;
use crate::winsys::{Ring, Winsys};

/// A rendering context.
///
/// Everything runs on the calling thread. Release hooks and the flush callback
/// borrow the 3D state, so the context never holds that borrow across an
/// operation that may flush.
pub struct Context {
    cp: CommandParser,
    render: Rc<RefCell<Render3d>>,
    shader_cache: Rc<RefCell<ShaderCache>>,
    render_condition: Option<RenderCondition>,
    query_buffer_bytes: u32,
}

impl Context {
    /// A context encoding with [`ReferencePipeline`].
    pub fn new(winsys: Arc<dyn Winsys>, config: &CpConfig) -> Result<Self> {
        Self::with_pipeline(winsys, config, Box::new(ReferencePipeline::new()))
    }

    pub fn with_pipeline(
        winsys: Arc<dyn Winsys>,
        config: &CpConfig,
        pipeline: Box<dyn Pipeline>,
    ) -> Result<Self> {
        let mut cp = CommandParser::new(winsys, config)?;
        let render = Rc::new(RefCell::new(Render3d::new(pipeline)));
        let shader_cache = Rc::new(RefCell::new(ShaderCache::new()));

        let weak = Rc::downgrade(&render);
        let hook: ReleaseHook = weak.clone();
        cp.register_owner(OwnerId::QueryRing, hook);
        let dropped = weak.clone();
        cp.set_flush_callback(move || {
            if let Some(render) = weak.upgrade() {
                render.borrow_mut().on_flush();
            }
        });
        // State emitted into a rejected batch never reached the GPU.
        cp.set_discard_callback(move || {
            if let Some(render) = dropped.upgrade() {
                render.borrow_mut().on_flush();
            }
        });
        cp.set_shader_cache(Rc::clone(&shader_cache));

        debug!(
            batch_dwords = config.batch_dwords,
            debug = ?config.debug,
            context = ?cp.render_context(),
            "created context"
        );
        Ok(Self {
            cp,
            render,
            shader_cache,
            render_condition: None,
            query_buffer_bytes: config.query_buffer_bytes,
        })
    }

    pub fn cp(&self) -> &CommandParser {
        &self.cp
    }

    pub fn stats(&self) -> CpStatsSnapshot {
        self.cp.stats().snapshot()
    }

    pub fn render(&self) -> std::cell::Ref<'_, Render3d> {
        self.render.borrow()
    }

    pub fn add_kernel(&mut self, code: Vec<u32>) -> KernelId {
        self.shader_cache.borrow_mut().add(code)
    }

    pub fn flush(&mut self) -> Result<FlushOutcome> {
        self.cp.flush("user flush")
    }

    /// Takes the render ring as the query owner, resuming paused queries when
    /// the ring was lost since the last call.
    fn own_render_ring(&mut self) -> Result<()> {
        self.cp.set_ring(Ring::Render)?;
        let reserve = self.render.borrow().owner_reserve();
        self.set_query_owner(reserve)
    }

    fn set_query_owner(&mut self, reserve: u32) -> Result<()> {
        if self.cp.set_owner(OwnerId::QueryRing, reserve)? {
            let mut render = self.render.borrow_mut();
            self.cp
                .without_implicit_flush(|cp| render.resume_queries(cp))?;
        }
        Ok(())
    }

    /// Flushes unless `dwords` fit the current batch, then owns the render
    /// ring again.
    fn make_room(&mut self, dwords: u32, reason: &str) -> Result<()> {
        if dwords > self.cp.space() {
            self.cp.flush(reason)?;
            self.own_render_ring()?;
            assert!(
                dwords <= self.cp.space(),
                "{dwords} dwords do not fit an empty batch"
            );
        }
        Ok(())
    }

    pub fn create_query(&mut self, kind: QueryType) -> QueryId {
        self.render.borrow_mut().queries.create(kind)
    }

    pub fn destroy_query(&mut self, id: QueryId) -> Result<()> {
        let active = self.render.borrow().queries.get(id)?.is_active();
        if active {
            self.end_query(id)?;
        }
        if self.render_condition.is_some_and(|c| c.query == id) {
            self.render_condition = None;
        }
        self.render.borrow_mut().queries.remove(id);
        Ok(())
    }

    pub fn begin_query(&mut self, id: QueryId) -> Result<()> {
        let winsys = Arc::clone(self.cp.winsys());
        let kind = {
            let mut render = self.render.borrow_mut();
            let query = render.queries.get_mut(id)?;
            if query.is_active() {
                return Err(CpError::QueryActive(id));
            }
            query.restart(winsys.as_ref(), self.query_buffer_bytes)?;
            query.kind()
        };

        match kind {
            // Captured once, at the end.
            QueryType::Timestamp => Ok(()),
            QueryType::PrimitivesGenerated | QueryType::PrimitivesEmitted => {
                self.render.borrow_mut().activate(id, kind)
            }
            QueryType::Occlusion | QueryType::TimeElapsed | QueryType::PipelineStatistics => {
                self.own_render_ring()?;
                let reserve = {
                    let render = self.render.borrow();
                    render.owner_reserve() + render.query_cost(kind)
                };
                self.set_query_owner(reserve)?;

                let mut render = self.render.borrow_mut();
                self.cp.without_implicit_flush(|cp| render.capture(cp, id))?;
                render.activate(id, kind)?;
                trace!(?id, ?kind, reserve, "began query");
                Ok(())
            }
        }
    }

    pub fn end_query(&mut self, id: QueryId) -> Result<()> {
        let (kind, active) = {
            let render = self.render.borrow();
            let query = render.queries.get(id)?;
            (query.kind(), query.is_active())
        };

        match kind {
            QueryType::Timestamp => {
                let winsys = Arc::clone(self.cp.winsys());
                self.render
                    .borrow_mut()
                    .queries
                    .get_mut(id)?
                    .restart(winsys.as_ref(), self.query_buffer_bytes)?;
                self.own_render_ring()?;
                let cost = self.render.borrow().query_cost(kind);
                self.make_room(cost, "out of space (timestamp)")?;
                let mut render = self.render.borrow_mut();
                self.cp.without_implicit_flush(|cp| render.capture(cp, id))
            }
            _ if !active => Err(CpError::QueryNotActive(id)),
            QueryType::PrimitivesGenerated | QueryType::PrimitivesEmitted => {
                self.render.borrow_mut().deactivate(id, kind)
            }
            QueryType::Occlusion | QueryType::TimeElapsed | QueryType::PipelineStatistics => {
                self.own_render_ring()?;
                let reserve = {
                    let mut render = self.render.borrow_mut();
                    render.deactivate(id, kind)?;
                    render.owner_reserve()
                };
                // Shrinking the reservation frees exactly what the end
                // capture needs.
                self.set_query_owner(reserve)?;
                let mut render = self.render.borrow_mut();
                self.cp.without_implicit_flush(|cp| render.capture(cp, id))?;
                trace!(?id, ?kind, reserve, "ended query");
                Ok(())
            }
        }
    }

    /// Returns the result of an ended query, or `None` when `wait` is false
    /// and the GPU has not finished writing it yet.
    pub fn get_query_result(&mut self, id: QueryId, wait: bool) -> Result<Option<QueryResult>> {
        let bo = {
            let render = self.render.borrow();
            let query = render.queries.get(id)?;
            if query.is_active() {
                return Err(CpError::QueryActive(id));
            }
            query.bo().cloned()
        };

        let winsys = Arc::clone(self.cp.winsys());
        if let Some(bo) = &bo {
            if self.cp.has_reloc(bo) {
                self.cp.flush("syncing for queries")?;
            }
            if !wait && winsys.is_busy(bo) {
                return Ok(None);
            }
        }

        let mut render = self.render.borrow_mut();
        let query = render.queries.get_mut(id)?;
        query.process(winsys.as_ref());
        Ok(Some(query.result()))
    }

    /// Conditions subsequent draws on the result of `query`. `None` removes
    /// the condition.
    pub fn set_render_condition(
        &mut self,
        condition: Option<(QueryId, RenderConditionMode)>,
        inverted: bool,
    ) {
        self.render_condition = condition.map(|(query, mode)| RenderCondition {
            query,
            mode,
            inverted,
        });
    }

    fn render_condition_passes(&mut self) -> Result<bool> {
        let Some(condition) = self.render_condition else {
            return Ok(true);
        };
        let result = self.get_query_result(condition.query, condition.mode.waits())?;
        Ok(match result {
            Some(result) => (result.as_u64() == 0) == condition.inverted,
            None => true,
        })
    }

    fn upload_kernels(&mut self, info: &DrawInfo) -> Result<KernelBinding> {
        let winsys = Arc::clone(self.cp.winsys());
        let mut cache = self.shader_cache.borrow_mut();
        if cache.upload(winsys.as_ref())? {
            self.render
                .borrow_mut()
                .pipeline
                .invalidate(Invalidate::KERNEL_BO);
        }
        Ok(KernelBinding {
            bo: cache.bo().cloned(),
            vs_offset: info.vs.and_then(|k| cache.kernel_offset(k)),
            fs_offset: info.fs.and_then(|k| cache.kernel_offset(k)),
        })
    }

    fn draw_cost(&self, info: &DrawInfo) -> (u32, bool) {
        let render = self.render.borrow();
        let need_flush = !render.is_new_batch()
            && info
                .dirty
                .intersects(DirtyFlags::FRAMEBUFFER | DirtyFlags::STREAM_OUTPUT);
        let flush_cost = render.pipeline.estimate(PipelineAction::Flush);
        let mut cost = render.pipeline.estimate(PipelineAction::Draw(info));
        if need_flush {
            cost += flush_cost;
        }
        if self.cp.debug_flags().contains(DebugFlags::NO_CACHE) {
            cost += flush_cost;
        }
        (cost, need_flush)
    }

    pub fn draw(&mut self, info: &DrawInfo) -> Result<()> {
        if !self.render_condition_passes()? {
            debug!("draw skipped by render condition");
            return Ok(());
        }
        trace!(dirty = %info.dirty.dump(), count = info.count, "draw");

        let kernels = self.upload_kernels(info)?;
        self.own_render_ring()?;
        let (cost, _) = self.draw_cost(info);
        self.make_room(cost, "out of space (draw)")?;

        let no_cache = self.cp.debug_flags().contains(DebugFlags::NO_CACHE);
        let mut retried = false;
        loop {
            let (_, need_flush) = self.draw_cost(info);
            let snapshot = self.cp.snapshot();
            {
                let mut render = self.render.borrow_mut();
                self.cp.without_implicit_flush(|cp| -> Result<()> {
                    if need_flush {
                        render.pipeline.emit_flush(cp)?;
                    }
                    render.pipeline.emit_draw(cp, info, &kernels)?;
                    if no_cache {
                        render.pipeline.emit_flush(cp)?;
                    }
                    Ok(())
                })?;
            }
            if self.cp.validate(&[]) {
                break;
            }

            let required = self.cp.builder().working_set(&[]);
            self.cp.rewind(&snapshot);
            self.render
                .borrow_mut()
                .pipeline
                .invalidate(Invalidate::BATCH_BO | Invalidate::STATE_BO);
            let aperture = self.cp.winsys().aperture_size();
            if retried || self.cp.is_empty() {
                return Err(CpError::ApertureExceeded { required, aperture });
            }

            warn!(required, aperture, "draw exceeds aperture, flushing and retrying");
            self.cp.stats().inc_aperture_retries();
            self.cp.flush("aperture")?;
            self.own_render_ring()?;
            let (cost, _) = self.draw_cost(info);
            self.make_room(cost, "out of space (draw retry)")?;
            retried = true;
        }

        let generated = info.primitive_count();
        let emitted = info.so_capacity.map_or(0, |cap| generated.min(cap));
        let mut render = self.render.borrow_mut();
        render.count_primitives(generated, emitted)?;
        render.set_drawn();
        Ok(())
    }

    /// Copies `size` bytes between buffers on the blit ring.
    pub fn copy_buffer(
        &mut self,
        dst: &Arc<BufferObject>,
        dst_offset: u64,
        src: &Arc<BufferObject>,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        blit::copy_buffer(&mut self.cp, dst, dst_offset, src, src_offset, size)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cp", &self.cp)
            .field("render", &self.render)
            .field("render_condition", &self.render_condition)
            .finish_non_exhaustive()
    }
}
