use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoId(pub u64);

/// A GPU buffer object as seen by the submission layer.
///
/// The GPU address is the one the kernel presumably placed the buffer at; it is
/// written into commands and patched through relocations when the buffer moves.
/// The CPU-visible contents live behind a mutex so the winsys can keep a buffer
/// alive and write to it while the batch referencing it is in flight.
pub struct BufferObject {
    id: BoId,
    name: String,
    size: u64,
    gpu_addr: u64,
    data: Mutex<Vec<u8>>,
}

impl BufferObject {
    pub fn new(id: BoId, name: impl Into<String>, size: u64, gpu_addr: u64) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            gpu_addr,
            data: Mutex::new(vec![0; size as usize]),
        }
    }

    pub fn id(&self) -> BoId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    fn storage(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies `out.len()` bytes starting at `offset`. Bytes past the end of the
    /// buffer read as zero.
    pub fn read(&self, offset: u64, out: &mut [u8]) {
        let data = self.storage();
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = offset
                .checked_add(i as u64)
                .and_then(|at| data.get(at as usize))
                .copied()
                .unwrap_or(0);
        }
    }

    /// Writes `bytes` at `offset`, dropping whatever falls past the end.
    pub fn write(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.storage();
        let Ok(start) = usize::try_from(offset) else {
            return;
        };
        if start >= data.len() {
            return;
        }
        let end = data.len().min(start.saturating_add(bytes.len()));
        data[start..end].copy_from_slice(&bytes[..end - start]);
    }

    pub fn read_u64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn write_u64(&self, offset: u64, value: u64) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn read_u64s(&self, offset: u64, out: &mut [u64]) {
        for (i, value) in out.iter_mut().enumerate() {
            *value = self.read_u64(offset + i as u64 * 8);
        }
    }

    pub fn read_dwords(&self, offset: u64, count: usize) -> Vec<u32> {
        let mut bytes = vec![0u8; count * 4];
        self.read(offset, &mut bytes);
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn write_dwords(&self, offset: u64, dwords: &[u32]) {
        let bytes: Vec<u8> = dwords.iter().flat_map(|dw| dw.to_le_bytes()).collect();
        self.write(offset, &bytes);
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("gpu_addr", &format_args!("{:#x}", self.gpu_addr))
            .finish()
    }
}
