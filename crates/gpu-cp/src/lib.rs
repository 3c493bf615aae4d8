//! `gpu-cp` batches GPU commands into fixed-size buffers and submits them.
//!
//! This crate provides:
//! - The command parser ([`CommandParser`]): space accounting for one batch,
//!   owner reservations and hand-off, implicit and explicit flushes.
//! - A query coordinator that pauses hardware queries whenever the render ring
//!   is given up and resumes them when it comes back (see [`Context`]).
//! - A small reference packet encoding ([`packet`], [`ReferencePipeline`]) and
//!   a winsys that executes it on the CPU ([`SoftwareWinsys`]).
//!
//! Everything is single threaded; a [`Context`] is neither `Send` nor `Sync`.
#![forbid(unsafe_code)]

mod blit;
mod bo;
mod builder;
mod config;
mod context;
mod cp;
mod error;
mod owner;
mod render;
mod shader_cache;
mod stats;

pub mod packet;
pub mod pipeline;
pub mod query;
pub mod soft;
pub mod winsys;

pub use blit::BLIT_MAX_BYTES;
pub use bo::{BoId, BufferObject};
pub use builder::{Builder, BuilderSnapshot, FinishedBatch};
pub use config::{CpConfig, DebugFlags};
pub use context::Context;
pub use cp::{CommandParser, FlushOutcome, BATCH_END_DWORDS};
pub use error::{CpError, Result};
pub use owner::{OwnerId, OwnerRelease, ReleaseHook};
pub use pipeline::{DirtyFlags, DrawInfo, Pipeline, ReferencePipeline, Topology, VertexBuffer};
pub use query::{PipelineStatistics, QueryId, QueryResult, QueryType};
pub use render::{Render3d, RenderConditionMode};
pub use shader_cache::{KernelId, ShaderCache};
pub use soft::SoftwareWinsys;
pub use stats::{CpStats, CpStatsSnapshot};
pub use winsys::{Ring, SubmitFlags, Winsys};
