//! Hardware queries and how their captured counters turn into results.
//!
//! A pausable query owns a buffer of slots. Every time the render ring is
//! (re)acquired a begin capture goes into the next free slot, and every time
//! it is released the matching end capture follows, so the buffer fills with
//! `(begin, end)` pairs. Processing sums the pair deltas into the accumulated
//! result and frees the slots again.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::bo::BufferObject;
use crate::error::{CpError, Result};
use crate::pipeline::STATISTICS_REGISTERS;
use crate::winsys::Winsys;

const STATISTICS_COUNT: usize = STATISTICS_REGISTERS.len();

/// Nanoseconds per timestamp tick.
const TIMESTAMP_PERIOD_NS: u64 = 80;

/// Converts a raw timestamp to nanoseconds. Only the low 32 bits of the
/// counter are meaningful.
pub fn timestamp_to_ns(timestamp: u64) -> u64 {
    (timestamp & 0xffff_ffff) * TIMESTAMP_PERIOD_NS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Occlusion,
    Timestamp,
    TimeElapsed,
    PrimitivesGenerated,
    PrimitivesEmitted,
    PipelineStatistics,
}

impl QueryType {
    pub const ALL: [QueryType; 6] = [
        QueryType::Occlusion,
        QueryType::Timestamp,
        QueryType::TimeElapsed,
        QueryType::PrimitivesGenerated,
        QueryType::PrimitivesEmitted,
        QueryType::PipelineStatistics,
    ];

    /// Bytes one capture occupies in the query buffer. Zero for queries that
    /// are counted on the CPU.
    pub fn stride(self) -> u32 {
        match self {
            QueryType::Occlusion | QueryType::Timestamp | QueryType::TimeElapsed => 8,
            QueryType::PipelineStatistics => 8 * STATISTICS_COUNT as u32,
            QueryType::PrimitivesGenerated | QueryType::PrimitivesEmitted => 0,
        }
    }

    /// Whether the query brackets a range of commands with hardware captures,
    /// and so must be paused whenever the render ring is given up.
    pub fn is_pausable(self) -> bool {
        matches!(
            self,
            QueryType::Occlusion | QueryType::TimeElapsed | QueryType::PipelineStatistics
        )
    }

    pub fn uses_buffer(self) -> bool {
        self.stride() > 0
    }

    pub(crate) fn index(self) -> usize {
        match self {
            QueryType::Occlusion => 0,
            QueryType::Timestamp => 1,
            QueryType::TimeElapsed => 2,
            QueryType::PrimitivesGenerated => 3,
            QueryType::PrimitivesEmitted => 4,
            QueryType::PipelineStatistics => 5,
        }
    }
}

/// Counters of a pipeline-statistics query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    pub ia_vertices: u64,
    pub ia_primitives: u64,
    pub vs_invocations: u64,
    pub gs_invocations: u64,
    pub gs_primitives: u64,
    pub c_invocations: u64,
    pub c_primitives: u64,
    pub ps_invocations: u64,
    pub hs_invocations: u64,
    pub ds_invocations: u64,
    pub cs_invocations: u64,
}

impl PipelineStatistics {
    fn from_counters(c: &[u64; STATISTICS_COUNT]) -> Self {
        Self {
            ia_vertices: c[0],
            ia_primitives: c[1],
            vs_invocations: c[2],
            gs_invocations: c[3],
            gs_primitives: c[4],
            c_invocations: c[5],
            c_primitives: c[6],
            ps_invocations: c[7],
            hs_invocations: c[8],
            ds_invocations: c[9],
            cs_invocations: c[10],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    U64(u64),
    PipelineStatistics(PipelineStatistics),
}

impl QueryResult {
    /// The scalar result; pipeline statistics report `ia_vertices`.
    pub fn as_u64(&self) -> u64 {
        match self {
            QueryResult::U64(value) => *value,
            QueryResult::PipelineStatistics(stats) => stats.ia_vertices,
        }
    }
}

#[derive(Debug)]
pub struct Query {
    kind: QueryType,
    bo: Option<Arc<BufferObject>>,
    slots: u32,
    used_slots: u32,
    active: bool,
    counters: [u64; STATISTICS_COUNT],
}

impl Query {
    pub fn new(kind: QueryType) -> Self {
        Self {
            kind,
            bo: None,
            slots: 0,
            used_slots: 0,
            active: false,
            counters: [0; STATISTICS_COUNT],
        }
    }

    pub fn kind(&self) -> QueryType {
        self.kind
    }

    pub fn bo(&self) -> Option<&Arc<BufferObject>> {
        self.bo.as_ref()
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn used_slots(&self) -> u32 {
        self.used_slots
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Clears the accumulated result and makes sure a buffer is attached.
    pub(crate) fn restart(&mut self, winsys: &dyn Winsys, buffer_bytes: u32) -> Result<()> {
        self.counters = [0; STATISTICS_COUNT];
        self.used_slots = 0;
        if !self.kind.uses_buffer() || self.bo.is_some() {
            return Ok(());
        }

        let stride = self.kind.stride();
        let slots = if self.kind == QueryType::Timestamp {
            1
        } else {
            ((buffer_bytes / stride) & !1).max(2)
        };
        let bo = winsys
            .alloc_buffer("query", u64::from(slots * stride))
            .map_err(CpError::OutOfMemory)?;
        self.bo = Some(bo);
        self.slots = slots;
        Ok(())
    }

    /// Whether another `(begin, end)` pair would overflow the buffer.
    pub(crate) fn needs_drain(&self) -> bool {
        self.used_slots + 2 > self.slots
    }

    /// Takes the next free slot and returns its byte offset.
    pub(crate) fn claim_slot(&mut self) -> u64 {
        assert!(
            self.used_slots < self.slots,
            "{:?} query buffer overflow",
            self.kind
        );
        let offset = u64::from(self.used_slots) * u64::from(self.kind.stride());
        self.used_slots += 1;
        offset
    }

    /// Counts primitives of a draw into a CPU-side query.
    pub(crate) fn add(&mut self, value: u64) {
        self.counters[0] += value;
    }

    /// Folds every captured slot into the accumulated result, blocking until
    /// the GPU is done with the buffer.
    pub(crate) fn process(&mut self, winsys: &dyn Winsys) {
        let Some(bo) = &self.bo else {
            return;
        };
        if self.used_slots == 0 {
            return;
        }
        winsys.wait(bo);

        match self.kind {
            QueryType::Timestamp => {
                self.counters[0] = timestamp_to_ns(bo.read_u64(0));
            }
            QueryType::Occlusion | QueryType::TimeElapsed => {
                let mut values = vec![0u64; self.used_slots as usize];
                bo.read_u64s(0, &mut values);
                let delta = values
                    .chunks_exact(2)
                    .fold(0u64, |sum, pair| sum.wrapping_add(pair[1].wrapping_sub(pair[0])));
                self.counters[0] += if self.kind == QueryType::TimeElapsed {
                    timestamp_to_ns(delta)
                } else {
                    delta
                };
            }
            QueryType::PipelineStatistics => {
                let stride = u64::from(self.kind.stride());
                let mut begin = [0u64; STATISTICS_COUNT];
                let mut end = [0u64; STATISTICS_COUNT];
                for pair in 0..u64::from(self.used_slots / 2) {
                    bo.read_u64s(pair * 2 * stride, &mut begin);
                    bo.read_u64s((pair * 2 + 1) * stride, &mut end);
                    for (counter, (b, e)) in self.counters.iter_mut().zip(begin.iter().zip(&end)) {
                        *counter += e.wrapping_sub(*b);
                    }
                }
            }
            QueryType::PrimitivesGenerated | QueryType::PrimitivesEmitted => {}
        }
        trace!(kind = ?self.kind, slots = self.used_slots, "processed query slots");
        self.used_slots = 0;
    }

    pub fn result(&self) -> QueryResult {
        match self.kind {
            QueryType::PipelineStatistics => {
                QueryResult::PipelineStatistics(PipelineStatistics::from_counters(&self.counters))
            }
            _ => QueryResult::U64(self.counters[0]),
        }
    }
}

/// Owns every query created on a context.
#[derive(Debug, Default)]
pub struct QueryArena {
    queries: HashMap<QueryId, Query>,
    next_id: u32,
}

impl QueryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, kind: QueryType) -> QueryId {
        let id = QueryId(self.next_id);
        self.next_id += 1;
        self.queries.insert(id, Query::new(kind));
        id
    }

    pub fn remove(&mut self, id: QueryId) -> Option<Query> {
        self.queries.remove(&id)
    }

    pub fn get(&self, id: QueryId) -> Result<&Query> {
        self.queries.get(&id).ok_or(CpError::UnknownQuery(id))
    }

    pub fn get_mut(&mut self, id: QueryId) -> Result<&mut Query> {
        self.queries.get_mut(&id).ok_or(CpError::UnknownQuery(id))
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
