//! A winsys that executes batches on the CPU.
//!
//! Submissions run synchronously: every packet of the batch is decoded and the
//! ones with memory side effects (counter captures, immediate stores, buffer
//! copies) are carried out against the buffer objects named by the batch's
//! relocations. Draws advance a small model of the GPU counters, so queries
//! produce real, predictable numbers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::bo::{BoId, BufferObject};
use crate::packet::{
    CmdPacket, CmdStream, Opcode, PipeControlFlags, PIPE_CONTROL_LEN, PRIMITIVE_LEN,
    SRC_COPY_BLT_LEN, STORE_DATA_IMM_LEN, STORE_REGISTER_MEM_LEN,
};
use crate::pipeline::{
    Topology, CL_INVOCATIONS, CL_PRIMITIVES, IA_PRIMITIVES, IA_VERTICES, PS_INVOCATIONS,
    VS_INVOCATIONS,
};
use crate::winsys::{
    ContextId, Relocation, Ring, SubmitFlags, Submission, Winsys, WinsysError,
};

const GPU_ADDR_BASE: u64 = 0x1_0000;
const GPU_ADDR_ALIGN: u64 = 0x1000;

/// Shortest packet the software GPU can execute for `opcode`.
fn min_len(opcode: Opcode) -> u32 {
    match opcode {
        Opcode::PipeControl => PIPE_CONTROL_LEN,
        Opcode::StoreRegisterMem => STORE_REGISTER_MEM_LEN,
        Opcode::StoreDataImm => STORE_DATA_IMM_LEN,
        Opcode::Primitive => PRIMITIVE_LEN,
        Opcode::SrcCopyBlt => SRC_COPY_BLT_LEN,
        _ => 1,
    }
}

/// What the software GPU saw of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub ring: Ring,
    pub batch: BoId,
    pub used_dwords: u32,
    pub words: Vec<u32>,
    pub relocation_targets: Vec<BoId>,
    pub context: Option<ContextId>,
    pub flags: SubmitFlags,
}

#[derive(Debug, Default)]
struct GpuCounters {
    depth_count: u64,
    timestamp: u64,
    registers: HashMap<u32, u64>,
}

#[derive(Debug)]
struct SoftState {
    next_id: u64,
    next_gpu_addr: u64,
    counters: GpuCounters,
    submissions: Vec<SubmissionRecord>,
    submit_failures: u32,
    alloc_failures: u32,
    defer_completion: bool,
    busy: HashSet<BoId>,
}

#[derive(Debug)]
pub struct SoftwareWinsys {
    aperture_size: u64,
    samples_per_primitive: u64,
    state: Mutex<SoftState>,
}

impl SoftwareWinsys {
    pub fn new(aperture_size: u64) -> Self {
        Self {
            aperture_size,
            samples_per_primitive: 64,
            state: Mutex::new(SoftState {
                next_id: 1,
                next_gpu_addr: GPU_ADDR_BASE,
                counters: GpuCounters::default(),
                submissions: Vec::new(),
                submit_failures: 0,
                alloc_failures: 0,
                defer_completion: false,
                busy: HashSet::new(),
            }),
        }
    }

    /// Depth samples that pass for every primitive drawn.
    pub fn with_samples_per_primitive(mut self, samples: u64) -> Self {
        self.samples_per_primitive = samples;
        self
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state().submissions.clone()
    }

    /// Rejects the next `count` submissions.
    pub fn fail_next_submits(&self, count: u32) {
        self.state().submit_failures = count;
    }

    /// Fails the next `count` allocations.
    pub fn fail_next_allocs(&self, count: u32) {
        self.state().alloc_failures = count;
    }

    /// When set, buffers referenced by a submission stay busy until
    /// [`SoftwareWinsys::retire`] or a [`Winsys::wait`] on them.
    pub fn set_deferred_completion(&self, defer: bool) {
        self.state().defer_completion = defer;
    }

    pub fn retire(&self) {
        self.state().busy.clear();
    }

    pub fn depth_count(&self) -> u64 {
        self.state().counters.depth_count
    }

    pub fn register(&self, reg: u32) -> u64 {
        self.state().counters.registers.get(&reg).copied().unwrap_or(0)
    }

    fn execute(&self, counters: &mut GpuCounters, words: &[u32], relocs: &[Relocation]) {
        let relocs: HashMap<u32, &Relocation> = relocs.iter().map(|r| (r.offset, r)).collect();
        let target = |packet: &CmdPacket<'_>, index: usize| {
            relocs
                .get(&((packet.at_word + 1 + index) as u32))
                .map(|r| (&r.target, r.delta))
        };

        for packet in CmdStream::new(words) {
            let packet = match packet {
                Ok(packet) => packet,
                Err(err) => {
                    warn!(%err, "software GPU stopped on a malformed batch");
                    return;
                }
            };
            counters.timestamp += 1;
            let payload = packet.payload;
            let opcode = packet.header.opcode;
            if payload.len() + 1 < min_len(opcode) as usize {
                warn!(opcode = opcode.name(), at = packet.at_word, "short packet ignored");
                continue;
            }

            match opcode {
                Opcode::PipeControl => {
                    let flags = PipeControlFlags::from_bits_truncate(payload[0]);
                    let value = if flags.contains(PipeControlFlags::WRITE_DEPTH_COUNT) {
                        counters.depth_count
                    } else if flags.contains(PipeControlFlags::WRITE_TIMESTAMP) {
                        counters.timestamp
                    } else if flags.contains(PipeControlFlags::WRITE_IMMEDIATE) {
                        u64::from(payload[2]) | (u64::from(payload[3]) << 32)
                    } else {
                        continue;
                    };
                    if let Some((bo, delta)) = target(&packet, 1) {
                        bo.write_u64(delta, value);
                    }
                }
                Opcode::StoreRegisterMem => {
                    let value = counters.registers.get(&payload[0]).copied().unwrap_or(0);
                    if let Some((bo, delta)) = target(&packet, 1) {
                        bo.write_u64(delta, value);
                    }
                }
                Opcode::StoreDataImm => {
                    let value = u64::from(payload[1]) | (u64::from(payload[2]) << 32);
                    if let Some((bo, delta)) = target(&packet, 0) {
                        bo.write_u64(delta, value);
                    }
                }
                Opcode::Primitive => {
                    let Some(topology) = Topology::from_word(payload[0]) else {
                        warn!(topology = payload[0], "unknown topology");
                        continue;
                    };
                    let instances = u64::from(payload[3]);
                    let vertices = u64::from(payload[1]) * instances;
                    let prims = u64::from(topology.primitive_count(payload[1])) * instances;
                    let samples = prims * self.samples_per_primitive;
                    for (reg, delta) in [
                        (IA_VERTICES, vertices),
                        (IA_PRIMITIVES, prims),
                        (VS_INVOCATIONS, vertices),
                        (CL_INVOCATIONS, prims),
                        (CL_PRIMITIVES, prims),
                        (PS_INVOCATIONS, samples),
                    ] {
                        *counters.registers.entry(reg).or_default() += delta;
                    }
                    counters.depth_count += samples;
                    counters.timestamp += prims;
                }
                Opcode::SrcCopyBlt => {
                    let size = payload[0] as usize;
                    if let (Some((dst, dst_delta)), Some((src, src_delta))) =
                        (target(&packet, 1), target(&packet, 2))
                    {
                        let mut bytes = vec![0u8; size];
                        src.read(src_delta, &mut bytes);
                        dst.write(dst_delta, &bytes);
                    }
                }
                Opcode::Noop
                | Opcode::BatchEnd
                | Opcode::StateBaseAddress
                | Opcode::VertexBuffers
                | Opcode::CcStatePointers
                | Opcode::ShaderPointers => {}
            }
        }
    }
}

impl Winsys for SoftwareWinsys {
    fn alloc_buffer(&self, name: &str, size: u64) -> Result<Arc<BufferObject>, WinsysError> {
        let mut state = self.state();
        if state.alloc_failures > 0 {
            state.alloc_failures -= 1;
            return Err(WinsysError::AllocationFailed {
                name: name.to_owned(),
                size,
            });
        }
        let id = BoId(state.next_id);
        state.next_id += 1;
        let gpu_addr = state.next_gpu_addr;
        state.next_gpu_addr += size.max(1).div_ceil(GPU_ADDR_ALIGN) * GPU_ADDR_ALIGN;
        Ok(Arc::new(BufferObject::new(id, name, size, gpu_addr)))
    }

    fn aperture_size(&self) -> u64 {
        self.aperture_size
    }

    fn create_context(&self) -> Option<ContextId> {
        Some(ContextId(1))
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), WinsysError> {
        let mut state = self.state();
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(WinsysError::Rejected("injected failure".to_owned()));
        }

        let words = submission
            .batch
            .read_dwords(0, submission.used_dwords as usize);
        let mut counters = std::mem::take(&mut state.counters);
        self.execute(&mut counters, &words, submission.relocations);
        state.counters = counters;

        if state.defer_completion {
            state.busy.insert(submission.batch.id());
            for reloc in submission.relocations {
                state.busy.insert(reloc.target.id());
            }
        }
        debug!(
            ring = ?submission.ring,
            dwords = submission.used_dwords,
            "software GPU executed batch"
        );
        state.submissions.push(SubmissionRecord {
            ring: submission.ring,
            batch: submission.batch.id(),
            used_dwords: submission.used_dwords,
            words,
            relocation_targets: submission.relocations.iter().map(|r| r.target.id()).collect(),
            context: submission.context,
            flags: submission.flags,
        });
        Ok(())
    }

    fn is_busy(&self, bo: &BufferObject) -> bool {
        self.state().busy.contains(&bo.id())
    }

    fn wait(&self, bo: &BufferObject) {
        self.state().busy.remove(&bo.id());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::packet::{header, BATCH_END};
    use crate::winsys::Domains;

    fn reloc(offset: u32, target: &Arc<BufferObject>, delta: u64) -> Relocation {
        Relocation {
            offset,
            target: Arc::clone(target),
            delta,
            read_domains: Domains::INSTRUCTION,
            write_domain: Domains::INSTRUCTION,
        }
    }

    fn submit(winsys: &SoftwareWinsys, words: &[u32], relocs: &[Relocation]) {
        let batch = winsys.alloc_buffer("batch", words.len() as u64 * 4).unwrap();
        batch.write_dwords(0, words);
        winsys
            .submit(&Submission {
                ring: Ring::Render,
                batch: &batch,
                used_dwords: words.len() as u32,
                relocations: relocs,
                context: None,
                flags: SubmitFlags::empty(),
            })
            .unwrap();
    }

    #[test]
    fn buffers_get_distinct_aligned_addresses() {
        let winsys = SoftwareWinsys::new(1 << 20);
        let a = winsys.alloc_buffer("a", 10).unwrap();
        let b = winsys.alloc_buffer("b", 0x1800).unwrap();
        let c = winsys.alloc_buffer("c", 4).unwrap();
        assert_eq!(a.gpu_addr(), GPU_ADDR_BASE);
        assert_eq!(b.gpu_addr(), GPU_ADDR_BASE + 0x1000);
        assert_eq!(c.gpu_addr(), GPU_ADDR_BASE + 0x3000);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn depth_count_brackets_draws() {
        let winsys = SoftwareWinsys::new(1 << 20).with_samples_per_primitive(10);
        let results = winsys.alloc_buffer("query", 16).unwrap();
        let capture = [
            header(Opcode::PipeControl, PIPE_CONTROL_LEN),
            PipeControlFlags::WRITE_DEPTH_COUNT.bits(),
            0,
            0,
            0,
        ];
        let mut words = capture.to_vec();
        words.extend([
            header(Opcode::Primitive, PRIMITIVE_LEN),
            Topology::TriangleList as u32,
            6,
            0,
            2,
        ]);
        words.extend(capture);
        words.push(BATCH_END);

        submit(
            &winsys,
            &words,
            &[reloc(2, &results, 0), reloc(12, &results, 8)],
        );

        // Two triangles, two instances, ten samples each.
        assert_eq!(results.read_u64(0), 0);
        assert_eq!(results.read_u64(8), 40);
        assert_eq!(winsys.register(IA_VERTICES), 12);
        assert_eq!(winsys.register(CL_PRIMITIVES), 4);
    }

    #[test]
    fn deferred_completion_keeps_buffers_busy_until_waited() {
        let winsys = SoftwareWinsys::new(1 << 20);
        winsys.set_deferred_completion(true);
        let target = winsys.alloc_buffer("target", 8).unwrap();
        submit(
            &winsys,
            &[
                header(Opcode::StoreDataImm, 4),
                0,
                5,
                0,
                BATCH_END,
            ],
            &[reloc(1, &target, 0)],
        );
        assert!(winsys.is_busy(&target));
        assert_eq!(target.read_u64(0), 5);
        winsys.wait(&target);
        assert!(!winsys.is_busy(&target));
    }

    #[test]
    fn rejected_submission_leaves_no_trace() {
        let winsys = SoftwareWinsys::new(1 << 20);
        winsys.fail_next_submits(1);
        let batch = winsys.alloc_buffer("batch", 8).unwrap();
        let err = winsys
            .submit(&Submission {
                ring: Ring::Blt,
                batch: &batch,
                used_dwords: 1,
                relocations: &[],
                context: None,
                flags: SubmitFlags::empty(),
            })
            .unwrap_err();
        assert!(matches!(err, WinsysError::Rejected(_)));
        assert!(winsys.submissions().is_empty());
    }
}
