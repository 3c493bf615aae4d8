//! Boundary between the submission layer and the kernel driver.
//!
//! The command parser only needs a handful of services from the window system:
//! buffer allocation, an aperture size to predict whether a working set can be
//! mapped, submission of a finished batch, and busy/wait queries on buffers it
//! is about to read back.

use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::bo::BufferObject;

/// GPU engine a batch executes on. A batch never spans two rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ring {
    Render,
    Blt,
}

bitflags! {
    /// Cache domains a relocation reads from or writes to.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Domains: u32 {
        const RENDER = 1 << 1;
        const SAMPLER = 1 << 2;
        const COMMAND = 1 << 3;
        const INSTRUCTION = 1 << 4;
        const VERTEX = 1 << 5;
    }
}

bitflags! {
    /// Flags that apply to a single submission and are then cleared.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct SubmitFlags: u32 {
        /// Reset stream-output write offsets before the batch runs.
        const SO_RESET = 1 << 0;
        /// Do not raise a completion interrupt for this batch.
        const NO_IRQ = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

/// A reference from a batch dword to another buffer's GPU address.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Dword index inside the batch holding the address.
    pub offset: u32,
    pub target: Arc<BufferObject>,
    pub delta: u64,
    pub read_domains: Domains,
    pub write_domain: Domains,
}

/// A finished batch handed to [`Winsys::submit`].
#[derive(Debug)]
pub struct Submission<'a> {
    pub ring: Ring,
    pub batch: &'a Arc<BufferObject>,
    /// Dwords of commands at the start of `batch`, end marker included.
    pub used_dwords: u32,
    pub relocations: &'a [Relocation],
    pub context: Option<ContextId>,
    pub flags: SubmitFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WinsysError {
    #[error("failed to allocate {size} bytes for {name}")]
    AllocationFailed { name: String, size: u64 },

    #[error("submission rejected: {0}")]
    Rejected(String),
}

pub trait Winsys {
    fn alloc_buffer(&self, name: &str, size: u64) -> Result<Arc<BufferObject>, WinsysError>;

    /// Bytes of GPU address space a single batch's working set may occupy.
    fn aperture_size(&self) -> u64;

    /// Hardware context for the render ring, if the kernel supports them.
    fn create_context(&self) -> Option<ContextId> {
        None
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), WinsysError>;

    /// Whether the GPU may still be writing `bo`.
    fn is_busy(&self, bo: &BufferObject) -> bool;

    /// Blocks until the GPU is done with `bo`.
    fn wait(&self, bo: &BufferObject);
}
