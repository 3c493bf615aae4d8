//! Buffer copies on the blit ring.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bo::BufferObject;
use crate::cp::CommandParser;
use crate::error::{CpError, Result};
use crate::owner::OwnerId;
use crate::packet::{header, Opcode, SRC_COPY_BLT_LEN};
use crate::winsys::{Domains, Ring};

/// Largest copy a single blit packet performs.
pub const BLIT_MAX_BYTES: u32 = 1 << 15;

/// Copies `size` bytes from `src` to `dst`.
///
/// Switching to the blit ring flushes pending render work, which pauses any
/// active query for the duration of the copy.
pub fn copy_buffer(
    cp: &mut CommandParser,
    dst: &Arc<BufferObject>,
    dst_offset: u64,
    src: &Arc<BufferObject>,
    src_offset: u64,
    size: u64,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    cp.set_ring(Ring::Blt)?;
    cp.set_owner(OwnerId::Blit, 0)?;

    if !cp.validate(&[dst, src]) {
        warn!(dst = dst.name(), src = src.name(), "blit exceeds aperture, flushing");
        cp.flush("blit aperture")?;
        if !cp.validate(&[dst, src]) {
            return Err(CpError::ApertureExceeded {
                required: cp.builder().working_set(&[dst, src]),
                aperture: cp.winsys().aperture_size(),
            });
        }
    }

    let mut done = 0u64;
    while done < size {
        let chunk = (size - done).min(u64::from(BLIT_MAX_BYTES));
        cp.begin_command(SRC_COPY_BLT_LEN)?;
        cp.write(header(Opcode::SrcCopyBlt, SRC_COPY_BLT_LEN));
        cp.write(chunk as u32);
        cp.write_bo(dst_offset + done, dst, Domains::RENDER, Domains::RENDER);
        cp.write_bo(src_offset + done, src, Domains::RENDER, Domains::empty());
        cp.end_command();
        done += chunk;
    }
    debug!(size, dst = dst.name(), src = src.name(), "queued buffer copy");
    Ok(())
}
