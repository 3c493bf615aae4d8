use std::sync::Arc;

use tracing::debug;

use crate::bo::BufferObject;
use crate::error::{CpError, Result};
use crate::winsys::Winsys;

const KERNEL_ALIGN: u64 = 64;
const MIN_CACHE_BYTES: u64 = 4096;

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

#[derive(Debug)]
struct Kernel {
    code: Vec<u32>,
    offset: Option<u32>,
}

/// Compiled kernels and their placement in the instruction buffer.
///
/// Kernels are uploaded lazily before a draw. Once uploaded they are assumed
/// to stay valid, which only holds as long as the batches referencing them
/// execute; a failed submission calls [`ShaderCache::invalidate`].
#[derive(Debug, Default)]
pub struct ShaderCache {
    kernels: Vec<Kernel>,
    bo: Option<Arc<BufferObject>>,
    used: u64,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, code: Vec<u32>) -> KernelId {
        let id = KernelId(self.kernels.len() as u32);
        self.kernels.push(Kernel { code, offset: None });
        id
    }

    pub fn bo(&self) -> Option<&Arc<BufferObject>> {
        self.bo.as_ref()
    }

    /// Byte offset of an uploaded kernel inside [`ShaderCache::bo`].
    pub fn kernel_offset(&self, id: KernelId) -> Option<u32> {
        self.kernels.get(id.0 as usize)?.offset
    }

    fn kernel_size(kernel: &Kernel) -> u64 {
        align_up(kernel.code.len() as u64 * 4, KERNEL_ALIGN)
    }

    /// Uploads every kernel not uploaded yet. Returns `true` when the kernels
    /// moved to a new buffer, so anything pointing at the old one is stale.
    pub fn upload(&mut self, winsys: &dyn Winsys) -> Result<bool> {
        let pending: u64 = self
            .kernels
            .iter()
            .filter(|k| k.offset.is_none())
            .map(Self::kernel_size)
            .sum();
        if pending == 0 {
            return Ok(false);
        }

        let fits = self
            .bo
            .as_ref()
            .is_some_and(|bo| self.used + pending <= bo.size());
        let mut moved = false;
        if !fits {
            let total: u64 = self.kernels.iter().map(Self::kernel_size).sum();
            let size = (total * 2).max(MIN_CACHE_BYTES);
            let bo = winsys
                .alloc_buffer("shader cache", size)
                .map_err(CpError::OutOfMemory)?;
            debug!(size, kernels = self.kernels.len(), "reallocated shader cache");
            self.bo = Some(bo);
            self.used = 0;
            for kernel in &mut self.kernels {
                kernel.offset = None;
            }
            moved = true;
        }

        if let Some(bo) = &self.bo {
            for kernel in self.kernels.iter_mut().filter(|k| k.offset.is_none()) {
                bo.write_dwords(self.used, &kernel.code);
                kernel.offset = Some(self.used as u32);
                self.used += Self::kernel_size(kernel);
            }
        }
        Ok(moved)
    }

    /// Forgets every upload; the next [`ShaderCache::upload`] starts over in a
    /// fresh buffer.
    pub fn invalidate(&mut self) {
        self.bo = None;
        self.used = 0;
        for kernel in &mut self.kernels {
            kernel.offset = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftwareWinsys;

    #[test]
    fn uploads_are_incremental() {
        let winsys = SoftwareWinsys::new(1 << 20);
        let mut cache = ShaderCache::new();
        let vs = cache.add(vec![1, 2, 3]);
        assert!(cache.upload(&winsys).unwrap());
        assert_eq!(cache.kernel_offset(vs), Some(0));

        let fs = cache.add(vec![4; 20]);
        assert!(!cache.upload(&winsys).unwrap());
        assert_eq!(cache.kernel_offset(fs), Some(64));
        assert_eq!(cache.bo().unwrap().read_dwords(64, 2), vec![4, 4]);

        // Nothing pending.
        assert!(!cache.upload(&winsys).unwrap());
    }

    #[test]
    fn invalidate_forces_reupload_into_new_buffer() {
        let winsys = SoftwareWinsys::new(1 << 20);
        let mut cache = ShaderCache::new();
        let vs = cache.add(vec![7; 4]);
        cache.upload(&winsys).unwrap();
        let first = cache.bo().unwrap().id();

        cache.invalidate();
        assert_eq!(cache.kernel_offset(vs), None);
        assert!(cache.upload(&winsys).unwrap());
        assert_ne!(cache.bo().unwrap().id(), first);
        assert_eq!(cache.kernel_offset(vs), Some(0));
    }
}
