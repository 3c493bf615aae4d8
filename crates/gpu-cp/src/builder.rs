use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::bo::{BoId, BufferObject};
use crate::error::{CpError, Result};
use crate::winsys::{Domains, Relocation, Winsys};

/// Round `value` down to a multiple of `alignment` (a power of two).
pub(crate) fn align_down(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Cursor position of a [`Builder`], cheap to capture and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderSnapshot {
    batch: Option<BoId>,
    used: u32,
    stolen: u32,
    reloc_count: usize,
}

/// A batch ready for submission.
#[derive(Debug)]
pub struct FinishedBatch {
    pub bo: Arc<BufferObject>,
    pub used_dwords: u32,
    pub relocations: Vec<Relocation>,
}

/// One batch buffer being filled.
///
/// Commands grow from the bottom (`used`), auxiliary state blocks are stolen
/// from the top (`stolen`). The dwords are kept on the CPU until [`Builder::end`]
/// copies both regions into the batch buffer object.
pub struct Builder {
    winsys: Arc<dyn Winsys>,
    capacity: u32,
    bo: Option<Arc<BufferObject>>,
    words: Vec<u32>,
    used: u32,
    stolen: u32,
    relocs: Vec<Relocation>,
}

impl Builder {
    pub fn new(winsys: Arc<dyn Winsys>, capacity: u32) -> Self {
        Self {
            winsys,
            capacity,
            bo: None,
            words: vec![0; capacity as usize],
            used: 0,
            stolen: 0,
            relocs: Vec::new(),
        }
    }

    /// Starts a new batch in a freshly allocated buffer object.
    pub fn begin(&mut self) -> Result<()> {
        let bo = self
            .winsys
            .alloc_buffer("batch buffer", u64::from(self.capacity) * 4)
            .map_err(CpError::OutOfMemory)?;
        self.bo = Some(bo);
        self.reset();
        Ok(())
    }

    /// Drops the current batch without submitting it.
    pub fn discard(&mut self) {
        self.bo = None;
        self.reset();
    }

    /// Forgets everything written to the current batch but keeps its buffer.
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.used = 0;
        self.stolen = 0;
        self.relocs.clear();
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn stolen(&self) -> u32 {
        self.stolen
    }

    /// Dwords left between the command region and the stolen region.
    pub fn remaining(&self) -> u32 {
        self.capacity - self.used - self.stolen
    }

    pub fn bo(&self) -> Option<&Arc<BufferObject>> {
        self.bo.as_ref()
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocs
    }

    /// Claims `len` dwords at the end of the command region and returns the
    /// index of the first one.
    pub fn claim(&mut self, len: u32) -> u32 {
        assert!(
            len <= self.remaining(),
            "claiming {len} dwords with only {} left",
            self.remaining()
        );
        let start = self.used;
        self.used += len;
        start
    }

    pub fn write(&mut self, pos: u32, dword: u32) {
        self.words[pos as usize] = dword;
    }

    pub fn write_multi(&mut self, pos: u32, dwords: &[u32]) {
        let start = pos as usize;
        self.words[start..start + dwords.len()].copy_from_slice(dwords);
    }

    /// Stores the presumed address of `target + delta` at `pos` and records a
    /// relocation for it.
    pub fn write_reloc(
        &mut self,
        pos: u32,
        target: &Arc<BufferObject>,
        delta: u64,
        read_domains: Domains,
        write_domain: Domains,
    ) {
        self.write(pos, target.gpu_addr().wrapping_add(delta) as u32);
        self.relocs.push(Relocation {
            offset: pos,
            target: Arc::clone(target),
            delta,
            read_domains,
            write_domain,
        });
    }

    /// Steals `size` dwords from the top of the batch, aligned to `align`
    /// dwords. Returns the byte offset of the region inside the batch buffer.
    pub fn steal(&mut self, size: u32, align: u32) -> Option<u32> {
        let align = align.max(1);
        let top = self.capacity - self.stolen;
        let start = align_down(top.checked_sub(size)?, align);
        if start < self.used {
            return None;
        }
        self.stolen = self.capacity - start;
        Some(start * 4)
    }

    /// Worst-case dwords [`Builder::steal`] consumes for a region.
    pub fn steal_cost(size: u32, align: u32) -> u32 {
        size + align.max(1) - 1
    }

    pub fn has_reloc(&self, bo: &BufferObject) -> bool {
        self.relocs.iter().any(|r| r.target.id() == bo.id())
    }

    /// Bytes of aperture the batch would occupy together with `extra`.
    pub fn working_set(&self, extra: &[&Arc<BufferObject>]) -> u64 {
        let mut seen = HashSet::new();
        let mut total = 0u64;
        let batch = self.bo.iter();
        let targets = self.relocs.iter().map(|r| &r.target);
        for bo in batch.chain(targets).chain(extra.iter().copied()) {
            if seen.insert(bo.id()) {
                total = total.saturating_add(bo.size());
            }
        }
        total
    }

    /// Predicts whether the batch, together with `extra`, fits the aperture.
    pub fn validate(&self, extra: &[&Arc<BufferObject>]) -> bool {
        self.working_set(extra) <= self.winsys.aperture_size()
    }

    pub fn snapshot(&self) -> BuilderSnapshot {
        BuilderSnapshot {
            batch: self.bo.as_ref().map(|bo| bo.id()),
            used: self.used,
            stolen: self.stolen,
            reloc_count: self.relocs.len(),
        }
    }

    /// Restores a snapshot of the current batch. Returns `false` and leaves the
    /// batch alone when the snapshot belongs to an earlier batch.
    pub fn rewind(&mut self, snapshot: &BuilderSnapshot) -> bool {
        if snapshot.batch != self.bo.as_ref().map(|bo| bo.id()) {
            return false;
        }
        self.used = snapshot.used;
        self.stolen = snapshot.stolen;
        self.relocs.truncate(snapshot.reloc_count);
        true
    }

    /// Finishes the batch, copying commands and stolen state into its buffer.
    pub fn end(&mut self) -> Option<FinishedBatch> {
        let bo = self.bo.take()?;
        let used = self.used as usize;
        bo.write_dwords(0, &self.words[..used]);
        if self.stolen > 0 {
            let top = (self.capacity - self.stolen) as usize;
            bo.write_dwords(top as u64 * 4, &self.words[top..]);
        }
        let batch = FinishedBatch {
            bo,
            used_dwords: self.used,
            relocations: std::mem::take(&mut self.relocs),
        };
        self.reset();
        Some(batch)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("capacity", &self.capacity)
            .field("bo", &self.bo)
            .field("used", &self.used)
            .field("stolen", &self.stolen)
            .field("relocs", &self.relocs.len())
            .finish()
    }
}
