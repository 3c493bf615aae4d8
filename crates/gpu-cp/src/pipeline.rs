//! Estimation and emission of logical 3D commands.
//!
//! The command parser never looks inside commands; it only needs to know how
//! many dwords a logical operation may take before it is emitted, so it can
//! flush ahead of time instead of in the middle of a sequence. A [`Pipeline`]
//! provides both halves, and its estimates must never be smaller than what it
//! emits.

use std::sync::Arc;

use bitflags::bitflags;

use crate::bo::BufferObject;
use crate::builder::Builder;
use crate::cp::CommandParser;
use crate::error::Result;
use crate::packet::{
    header, vertex_buffers_len, Opcode, PipeControlFlags, CC_STATE_POINTERS_LEN, PIPE_CONTROL_LEN,
    PRIMITIVE_LEN, SHADER_POINTERS_LEN, STATE_BASE_ADDRESS_LEN, STORE_DATA_IMM_LEN,
    STORE_REGISTER_MEM_LEN,
};
use crate::query::QueryType;
use crate::shader_cache::KernelId;
use crate::winsys::Domains;

pub const HS_INVOCATIONS: u32 = 0x2300;
pub const DS_INVOCATIONS: u32 = 0x2308;
pub const IA_VERTICES: u32 = 0x2310;
pub const IA_PRIMITIVES: u32 = 0x2318;
pub const VS_INVOCATIONS: u32 = 0x2320;
pub const GS_INVOCATIONS: u32 = 0x2328;
pub const GS_PRIMITIVES: u32 = 0x2330;
pub const CL_INVOCATIONS: u32 = 0x2338;
pub const CL_PRIMITIVES: u32 = 0x2340;
pub const PS_INVOCATIONS: u32 = 0x2348;

/// Counters captured by a pipeline-statistics query, in result order. There is
/// no compute invocation counter; its slot is written as zero.
pub const STATISTICS_REGISTERS: [Option<u32>; 11] = [
    Some(IA_VERTICES),
    Some(IA_PRIMITIVES),
    Some(VS_INVOCATIONS),
    Some(GS_INVOCATIONS),
    Some(GS_PRIMITIVES),
    Some(CL_INVOCATIONS),
    Some(CL_PRIMITIVES),
    Some(PS_INVOCATIONS),
    Some(HS_INVOCATIONS),
    Some(DS_INVOCATIONS),
    None,
];

const CC_STATE_DWORDS: u32 = 6;
const CC_STATE_ALIGN: u32 = 16;

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Topology {
    PointList = 0,
    LineList = 1,
    LineStrip = 2,
    TriangleList = 3,
    TriangleStrip = 4,
}

impl Topology {
    pub fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            0 => Self::PointList,
            1 => Self::LineList,
            2 => Self::LineStrip,
            3 => Self::TriangleList,
            4 => Self::TriangleStrip,
            _ => return None,
        })
    }

    /// Primitives assembled from `vertices` vertices of one instance.
    pub fn primitive_count(self, vertices: u32) -> u32 {
        match self {
            Self::PointList => vertices,
            Self::LineList => vertices / 2,
            Self::LineStrip => vertices.saturating_sub(1),
            Self::TriangleList => vertices / 3,
            Self::TriangleStrip => vertices.saturating_sub(2),
        }
    }
}

bitflags! {
    /// Logical states changed since the last draw.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DirtyFlags: u32 {
        const FRAMEBUFFER = 1 << 0;
        const STREAM_OUTPUT = 1 << 1;
        const VERTEX_BUFFERS = 1 << 2;
        const VS = 1 << 3;
        const FS = 1 << 4;
        const BLEND = 1 << 5;
        const DEPTH_STENCIL_ALPHA = 1 << 6;
        const RASTERIZER = 1 << 7;
        const VIEWPORT = 1 << 8;
        const SCISSOR = 1 << 9;
        const CONSTANT_BUFFERS = 1 << 10;
        const SAMPLERS = 1 << 11;
    }
}

impl DirtyFlags {
    /// Space separated names of the dirty states, for debugging.
    pub fn dump(self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        if names.is_empty() {
            "none".to_owned()
        } else {
            names.join(" ")
        }
    }
}

bitflags! {
    /// Hardware state a pipeline must re-emit because what it pointed at is gone.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Invalidate: u32 {
        /// Nothing has been emitted yet.
        const HW = 1 << 0;
        const BATCH_BO = 1 << 1;
        const STATE_BO = 1 << 2;
        const KERNEL_BO = 1 << 3;
    }
}

#[derive(Debug, Clone)]
pub struct VertexBuffer {
    pub bo: Arc<BufferObject>,
    pub offset: u64,
    pub stride: u32,
}

#[derive(Debug, Clone)]
pub struct DrawInfo {
    pub topology: Topology,
    pub start: u32,
    pub count: u32,
    pub instance_count: u32,
    pub vertex_buffers: Vec<VertexBuffer>,
    pub vs: Option<KernelId>,
    pub fs: Option<KernelId>,
    pub dirty: DirtyFlags,
    /// Primitives the bound stream-output targets can still take; `None` when
    /// stream output is off.
    pub so_capacity: Option<u64>,
}

impl DrawInfo {
    pub fn new(topology: Topology, count: u32) -> Self {
        Self {
            topology,
            start: 0,
            count,
            instance_count: 1,
            vertex_buffers: Vec::new(),
            vs: None,
            fs: None,
            dirty: DirtyFlags::empty(),
            so_capacity: None,
        }
    }

    pub fn primitive_count(&self) -> u64 {
        u64::from(self.topology.primitive_count(self.count)) * u64::from(self.instance_count)
    }
}

/// Where the kernels of a draw live once uploaded.
#[derive(Debug, Clone, Default)]
pub struct KernelBinding {
    pub bo: Option<Arc<BufferObject>>,
    pub vs_offset: Option<u32>,
    pub fs_offset: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub enum PipelineAction<'a> {
    Draw(&'a DrawInfo),
    Flush,
    Query(QueryType),
}

pub trait Pipeline {
    /// Upper bound, in dwords, of what emitting `action` writes, stolen state
    /// and its alignment included.
    fn estimate(&self, action: PipelineAction<'_>) -> u32;

    fn emit_draw(
        &mut self,
        cp: &mut CommandParser,
        draw: &DrawInfo,
        kernels: &KernelBinding,
    ) -> Result<()>;

    /// Flushes render caches and stalls the command streamer.
    fn emit_flush(&mut self, cp: &mut CommandParser) -> Result<()>;

    /// Captures the counters of `kind` into `bo` at byte `offset`.
    fn emit_query(
        &mut self,
        cp: &mut CommandParser,
        kind: QueryType,
        bo: &Arc<BufferObject>,
        offset: u64,
    ) -> Result<()>;

    fn invalidate(&mut self, flags: Invalidate);
}

/// Encoder for the packet set in [`crate::packet`].
#[derive(Debug)]
pub struct ReferencePipeline {
    invalid: Invalidate,
    cc_valid: bool,
}

impl Default for ReferencePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferencePipeline {
    pub fn new() -> Self {
        Self {
            invalid: Invalidate::all(),
            cc_valid: false,
        }
    }

    fn statistics_len() -> u32 {
        PIPE_CONTROL_LEN
            + STATISTICS_REGISTERS
                .iter()
                .map(|reg| match reg {
                    Some(_) => STORE_REGISTER_MEM_LEN,
                    None => STORE_DATA_IMM_LEN,
                })
                .sum::<u32>()
    }

    fn emit_pipe_control(
        cp: &mut CommandParser,
        flags: PipeControlFlags,
        target: Option<(&Arc<BufferObject>, u64)>,
    ) -> Result<()> {
        cp.begin_command(PIPE_CONTROL_LEN)?;
        cp.write(header(Opcode::PipeControl, PIPE_CONTROL_LEN));
        cp.write(flags.bits());
        match target {
            Some((bo, offset)) => {
                cp.write_bo(offset, bo, Domains::INSTRUCTION, Domains::INSTRUCTION)
            }
            None => cp.write(0),
        }
        cp.write_multi(&[0, 0]);
        cp.end_command();
        Ok(())
    }

    fn emit_state_base_address(
        &mut self,
        cp: &mut CommandParser,
        kernels: &KernelBinding,
    ) -> Result<()> {
        cp.begin_command(STATE_BASE_ADDRESS_LEN)?;
        cp.write(header(Opcode::StateBaseAddress, STATE_BASE_ADDRESS_LEN));
        // Stolen state is addressed relative to the batch itself.
        match cp.batch_bo() {
            Some(batch) => {
                cp.write_bo(0, &batch, Domains::RENDER | Domains::SAMPLER, Domains::empty())
            }
            None => cp.write(0),
        }
        match &kernels.bo {
            Some(bo) => cp.write_bo(0, bo, Domains::INSTRUCTION, Domains::empty()),
            None => cp.write(0),
        }
        cp.end_command();
        Ok(())
    }
}

impl Pipeline for ReferencePipeline {
    fn estimate(&self, action: PipelineAction<'_>) -> u32 {
        match action {
            PipelineAction::Draw(draw) => {
                STATE_BASE_ADDRESS_LEN
                    + Builder::steal_cost(CC_STATE_DWORDS, CC_STATE_ALIGN)
                    + CC_STATE_POINTERS_LEN
                    + SHADER_POINTERS_LEN
                    + vertex_buffers_len(draw.vertex_buffers.len() as u32)
                    + PRIMITIVE_LEN
            }
            PipelineAction::Flush => PIPE_CONTROL_LEN,
            PipelineAction::Query(kind) => match kind {
                QueryType::Occlusion | QueryType::Timestamp | QueryType::TimeElapsed => {
                    PIPE_CONTROL_LEN
                }
                QueryType::PipelineStatistics => Self::statistics_len(),
                QueryType::PrimitivesGenerated | QueryType::PrimitivesEmitted => 0,
            },
        }
    }

    fn emit_draw(
        &mut self,
        cp: &mut CommandParser,
        draw: &DrawInfo,
        kernels: &KernelBinding,
    ) -> Result<()> {
        if !self.invalid.is_empty() {
            self.emit_state_base_address(cp, kernels)?;
            self.invalid = Invalidate::empty();
            self.cc_valid = false;
        }

        let cc_dirty = draw
            .dirty
            .intersects(DirtyFlags::BLEND | DirtyFlags::DEPTH_STENCIL_ALPHA);
        if !self.cc_valid || cc_dirty {
            let offset = cp.steal(CC_STATE_DWORDS, CC_STATE_ALIGN)?;
            cp.write_stolen(offset, &[0, 0, 0, 0, 0, 0]);
            cp.begin_command(CC_STATE_POINTERS_LEN)?;
            cp.write(header(Opcode::CcStatePointers, CC_STATE_POINTERS_LEN));
            cp.write(offset | 1);
            cp.end_command();
            self.cc_valid = true;
        }

        cp.begin_command(SHADER_POINTERS_LEN)?;
        cp.write(header(Opcode::ShaderPointers, SHADER_POINTERS_LEN));
        cp.write(kernels.vs_offset.unwrap_or(0));
        cp.write(kernels.fs_offset.unwrap_or(0));
        cp.end_command();

        if !draw.vertex_buffers.is_empty() {
            let len = vertex_buffers_len(draw.vertex_buffers.len() as u32);
            cp.begin_command(len)?;
            cp.write(header(Opcode::VertexBuffers, len));
            for (index, vb) in draw.vertex_buffers.iter().enumerate() {
                cp.write(((index as u32) << 26) | (vb.stride & 0xfff));
                cp.write_bo(vb.offset, &vb.bo, Domains::VERTEX, Domains::empty());
                let last = vb.bo.size().saturating_sub(1);
                cp.write_bo(last, &vb.bo, Domains::VERTEX, Domains::empty());
            }
            cp.end_command();
        }

        cp.begin_command(PRIMITIVE_LEN)?;
        cp.write(header(Opcode::Primitive, PRIMITIVE_LEN));
        cp.write(draw.topology as u32);
        cp.write(draw.count);
        cp.write(draw.start);
        cp.write(draw.instance_count);
        cp.end_command();
        Ok(())
    }

    fn emit_flush(&mut self, cp: &mut CommandParser) -> Result<()> {
        Self::emit_pipe_control(
            cp,
            PipeControlFlags::CS_STALL
                | PipeControlFlags::RENDER_CACHE_FLUSH
                | PipeControlFlags::DEPTH_CACHE_FLUSH
                | PipeControlFlags::TEXTURE_CACHE_INVALIDATE,
            None,
        )
    }

    fn emit_query(
        &mut self,
        cp: &mut CommandParser,
        kind: QueryType,
        bo: &Arc<BufferObject>,
        offset: u64,
    ) -> Result<()> {
        match kind {
            QueryType::Occlusion => Self::emit_pipe_control(
                cp,
                PipeControlFlags::DEPTH_STALL | PipeControlFlags::WRITE_DEPTH_COUNT,
                Some((bo, offset)),
            ),
            QueryType::Timestamp | QueryType::TimeElapsed => Self::emit_pipe_control(
                cp,
                PipeControlFlags::CS_STALL | PipeControlFlags::WRITE_TIMESTAMP,
                Some((bo, offset)),
            ),
            QueryType::PipelineStatistics => {
                Self::emit_pipe_control(cp, PipeControlFlags::CS_STALL, None)?;
                for (i, reg) in STATISTICS_REGISTERS.iter().enumerate() {
                    let slot = offset + i as u64 * 8;
                    match reg {
                        Some(reg) => {
                            cp.begin_command(STORE_REGISTER_MEM_LEN)?;
                            cp.write(header(Opcode::StoreRegisterMem, STORE_REGISTER_MEM_LEN));
                            cp.write(*reg);
                            cp.write_bo(slot, bo, Domains::INSTRUCTION, Domains::INSTRUCTION);
                        }
                        None => {
                            cp.begin_command(STORE_DATA_IMM_LEN)?;
                            cp.write(header(Opcode::StoreDataImm, STORE_DATA_IMM_LEN));
                            cp.write_bo(slot, bo, Domains::INSTRUCTION, Domains::INSTRUCTION);
                            cp.write_multi(&[0, 0]);
                        }
                    }
                    cp.end_command();
                }
                Ok(())
            }
            QueryType::PrimitivesGenerated | QueryType::PrimitivesEmitted => {
                debug_assert!(false, "{kind:?} is counted on the CPU");
                Ok(())
            }
        }
    }

    fn invalidate(&mut self, flags: Invalidate) {
        self.invalid |= flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_counts_follow_topology() {
        assert_eq!(Topology::TriangleList.primitive_count(7), 2);
        assert_eq!(Topology::TriangleStrip.primitive_count(7), 5);
        assert_eq!(Topology::LineStrip.primitive_count(0), 0);
        assert_eq!(Topology::PointList.primitive_count(4), 4);
    }

    #[test]
    fn dirty_dump_lists_names() {
        assert_eq!(DirtyFlags::empty().dump(), "none");
        assert_eq!(
            (DirtyFlags::FRAMEBUFFER | DirtyFlags::BLEND).dump(),
            "FRAMEBUFFER BLEND"
        );
    }

    #[test]
    fn statistics_estimate_covers_every_counter() {
        let pipeline = ReferencePipeline::new();
        assert_eq!(
            pipeline.estimate(PipelineAction::Query(QueryType::PipelineStatistics)),
            PIPE_CONTROL_LEN + 10 * STORE_REGISTER_MEM_LEN + STORE_DATA_IMM_LEN
        );
        assert_eq!(
            pipeline.estimate(PipelineAction::Query(QueryType::PrimitivesGenerated)),
            0
        );
    }
}
