//! Command packet encoding used by the reference pipeline and decoded by the
//! software winsys and the batch dump.
//!
//! Every packet starts with one header dword: the opcode in the top 12 bits and
//! the payload length (in dwords, header excluded) in the low 20 bits. A zero
//! dword therefore decodes as `NOOP`.

use std::fmt;

use bitflags::bitflags;

pub type CmdWord = u32;

const OPCODE_SHIFT: u32 = 20;
const LENGTH_MASK: u32 = (1 << OPCODE_SHIFT) - 1;

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Noop = 0x000,
    BatchEnd = 0x00a,

    // Memory writes.
    StoreDataImm = 0x020,
    StoreRegisterMem = 0x024,

    // 3D state.
    StateBaseAddress = 0x610,
    VertexBuffers = 0x708,
    CcStatePointers = 0x70e,
    ShaderPointers = 0x710,
    PipeControl = 0x7a0,
    Primitive = 0x7b0,

    // Blitter.
    SrcCopyBlt = 0x543,
}

impl Opcode {
    pub fn from_word(word: CmdWord) -> Option<Self> {
        Some(match word {
            x if x == Self::Noop as CmdWord => Self::Noop,
            x if x == Self::BatchEnd as CmdWord => Self::BatchEnd,
            x if x == Self::StoreDataImm as CmdWord => Self::StoreDataImm,
            x if x == Self::StoreRegisterMem as CmdWord => Self::StoreRegisterMem,
            x if x == Self::StateBaseAddress as CmdWord => Self::StateBaseAddress,
            x if x == Self::VertexBuffers as CmdWord => Self::VertexBuffers,
            x if x == Self::CcStatePointers as CmdWord => Self::CcStatePointers,
            x if x == Self::ShaderPointers as CmdWord => Self::ShaderPointers,
            x if x == Self::PipeControl as CmdWord => Self::PipeControl,
            x if x == Self::Primitive as CmdWord => Self::Primitive,
            x if x == Self::SrcCopyBlt as CmdWord => Self::SrcCopyBlt,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Noop => "NOOP",
            Self::BatchEnd => "BATCH_END",
            Self::StoreDataImm => "STORE_DATA_IMM",
            Self::StoreRegisterMem => "STORE_REGISTER_MEM",
            Self::StateBaseAddress => "STATE_BASE_ADDRESS",
            Self::VertexBuffers => "VERTEX_BUFFERS",
            Self::CcStatePointers => "CC_STATE_POINTERS",
            Self::ShaderPointers => "SHADER_POINTERS",
            Self::PipeControl => "PIPE_CONTROL",
            Self::Primitive => "PRIMITIVE",
            Self::SrcCopyBlt => "SRC_COPY_BLT",
        }
    }
}

/// Builds the header dword of a packet `len` dwords long (header included).
pub const fn header(opcode: Opcode, len: u32) -> CmdWord {
    ((opcode as u32) << OPCODE_SHIFT) | (len - 1)
}

pub const NOOP: CmdWord = header(Opcode::Noop, 1);
pub const BATCH_END: CmdWord = header(Opcode::BatchEnd, 1);

// Packet lengths in dwords, header included.
pub const PIPE_CONTROL_LEN: u32 = 5;
pub const STORE_REGISTER_MEM_LEN: u32 = 3;
pub const STORE_DATA_IMM_LEN: u32 = 4;
pub const STATE_BASE_ADDRESS_LEN: u32 = 3;
pub const CC_STATE_POINTERS_LEN: u32 = 2;
pub const SHADER_POINTERS_LEN: u32 = 3;
pub const PRIMITIVE_LEN: u32 = 5;
pub const SRC_COPY_BLT_LEN: u32 = 4;
pub const VERTEX_BUFFER_STATE_LEN: u32 = 3;

pub const fn vertex_buffers_len(count: u32) -> u32 {
    1 + VERTEX_BUFFER_STATE_LEN * count
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PipeControlFlags: u32 {
        const CS_STALL = 1 << 0;
        const DEPTH_STALL = 1 << 1;
        const RENDER_CACHE_FLUSH = 1 << 2;
        const DEPTH_CACHE_FLUSH = 1 << 3;
        const TEXTURE_CACHE_INVALIDATE = 1 << 4;
        const WRITE_IMMEDIATE = 1 << 8;
        const WRITE_DEPTH_COUNT = 1 << 9;
        const WRITE_TIMESTAMP = 1 << 10;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CmdHeader {
    pub opcode: Opcode,
    /// Payload length in dwords, header excluded.
    pub payload_words: u32,
}

#[derive(Debug)]
pub struct CmdPacket<'a> {
    /// Dword index of the header inside the decoded stream.
    pub at_word: usize,
    pub header: CmdHeader,
    pub payload: &'a [CmdWord],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdParseError {
    UnknownOpcode {
        opcode: CmdWord,
        at_word: usize,
    },
    TruncatedPayload {
        opcode: Opcode,
        expected_words: usize,
        remaining_words: usize,
        at_word: usize,
    },
}

impl fmt::Display for CmdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdParseError::UnknownOpcode { opcode, at_word } => {
                write!(f, "unknown opcode {opcode:#x} at word {at_word}")
            }
            CmdParseError::TruncatedPayload {
                opcode,
                expected_words,
                remaining_words,
                at_word,
            } => write!(
                f,
                "truncated payload for {} at word {at_word}: expected {expected_words} words, only {remaining_words} remaining",
                opcode.name()
            ),
        }
    }
}

impl std::error::Error for CmdParseError {}

/// Iterates the packets of a batch. Stops after `BATCH_END` or on the first
/// malformed packet.
pub struct CmdStream<'a> {
    words: &'a [CmdWord],
    cursor: usize,
    done: bool,
}

impl<'a> CmdStream<'a> {
    pub fn new(words: &'a [CmdWord]) -> Self {
        Self {
            words,
            cursor: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for CmdStream<'a> {
    type Item = Result<CmdPacket<'a>, CmdParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.words.len() {
            return None;
        }

        let at_word = self.cursor;
        let word = self.words[at_word];
        let Some(opcode) = Opcode::from_word(word >> OPCODE_SHIFT) else {
            self.done = true;
            return Some(Err(CmdParseError::UnknownOpcode {
                opcode: word >> OPCODE_SHIFT,
                at_word,
            }));
        };
        let payload_words = (word & LENGTH_MASK) as usize;
        let payload_start = at_word + 1;
        let remaining_words = self.words.len() - payload_start;
        if payload_words > remaining_words {
            self.done = true;
            return Some(Err(CmdParseError::TruncatedPayload {
                opcode,
                expected_words: payload_words,
                remaining_words,
                at_word,
            }));
        }

        self.cursor = payload_start + payload_words;
        if opcode == Opcode::BatchEnd {
            self.done = true;
        }
        Some(Ok(CmdPacket {
            at_word,
            header: CmdHeader {
                opcode,
                payload_words: payload_words as u32,
            },
            payload: &self.words[payload_start..self.cursor],
        }))
    }
}

impl fmt::Display for CmdPacket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:5}: {}", self.at_word, self.header.opcode.name())?;
        if self.header.opcode == Opcode::PipeControl {
            if let Some(&flags) = self.payload.first() {
                write!(f, " {:?}", PipeControlFlags::from_bits_truncate(flags))?;
                for word in &self.payload[1..] {
                    write!(f, " {word:#010x}")?;
                }
                return Ok(());
            }
        }
        for word in self.payload {
            write!(f, " {word:#010x}")?;
        }
        Ok(())
    }
}

/// Renders a batch as one line per packet.
pub fn disassemble(words: &[CmdWord]) -> String {
    let mut out = String::new();
    for packet in CmdStream::new(words) {
        match packet {
            Ok(packet) => out.push_str(&packet.to_string()),
            Err(err) => out.push_str(&format!("error: {err}")),
        }
        out.push('\n');
    }
    out
}
