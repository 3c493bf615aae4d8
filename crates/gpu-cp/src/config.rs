use bitflags::bitflags;
use tracing::warn;

pub(crate) const DEBUG_ENV: &str = "GPU_CP_DEBUG";

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// Run all bookkeeping but never hand batches to the winsys.
        const NO_HW = 1 << 0;
        /// Flush GPU caches after every draw.
        const NO_CACHE = 1 << 1;
        /// Log every submitted batch, one packet per line.
        const DUMP_3D = 1 << 2;
    }
}

impl DebugFlags {
    const NAMES: &'static [(&'static str, DebugFlags)] = &[
        ("nohw", DebugFlags::NO_HW),
        ("nocache", DebugFlags::NO_CACHE),
        ("3d", DebugFlags::DUMP_3D),
    ];

    /// Parses a comma or whitespace separated option list such as
    /// `"nohw,3d"`. Unknown options are logged and ignored.
    pub fn parse(options: &str) -> Self {
        let mut flags = DebugFlags::empty();
        for option in options
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            match Self::NAMES
                .iter()
                .find(|(name, _)| option.eq_ignore_ascii_case(name))
            {
                Some((_, flag)) => flags |= *flag,
                None => warn!(option, "ignoring unknown debug option"),
            }
        }
        flags
    }

    pub fn from_env() -> Self {
        std::env::var(DEBUG_ENV)
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }
}

/// Construction-time settings for a [`crate::Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpConfig {
    /// Capacity of one batch in dwords, end-of-batch marker included.
    pub batch_dwords: u32,
    /// Size of the buffer backing each hardware query.
    pub query_buffer_bytes: u32,
    pub debug: DebugFlags,
}

impl CpConfig {
    pub const DEFAULT_BATCH_DWORDS: u32 = 8192;
    pub const DEFAULT_QUERY_BUFFER_BYTES: u32 = 4096;

    /// Default settings with debug options taken from `GPU_CP_DEBUG`.
    pub fn from_env() -> Self {
        Self {
            debug: DebugFlags::from_env(),
            ..Self::default()
        }
    }
}

impl Default for CpConfig {
    fn default() -> Self {
        Self {
            batch_dwords: Self::DEFAULT_BATCH_DWORDS,
            query_buffer_bytes: Self::DEFAULT_QUERY_BUFFER_BYTES,
            debug: DebugFlags::empty(),
        }
    }
}
