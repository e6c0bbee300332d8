//! Signature generation
//!
//! Decodes a short run of machine code and turns it into pattern text where every byte
//! that depends on where the code was loaded is replaced by `??`.

use std::slice;

use tracing::{debug, trace, warn};

use crate::asm::{Decoder, InstructionRecord, Operand};
use crate::scan::{Pattern, PatternError, Segment};

/// Maximum number of instructions a signature is built from
pub const MAX_INSTRUCTIONS: usize = 20;

/// `int3`, never part of real code paths
const BREAKPOINT: u32 = 0xCC;

/// An error for the [sig](crate::sig) module
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigError {
    /// An operand that has to be masked could not be found in its instruction's bytes.
    /// The decoder and the classifier disagree; emitting anything would be unsafe to reuse.
    #[error("operand {operand} of instruction at offset {offset:#x} not found in its encoding ({bytes:02X?})")]
    DecodeInconsistency {
        /// offset of the instruction from the start of the run
        offset: usize,
        /// operand index within the instruction
        operand: usize,
        /// the instruction's bytes
        bytes: Vec<u8>,
    },
    /// The generated text did not compile as a pattern
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// A byte range inside one instruction that must be wildcarded
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReplaceRange {
    /// first byte, relative to the start of the instruction
    pub offset: usize,
    /// number of bytes
    pub len: usize,
}

impl ReplaceRange {
    fn contains(&self, pos: usize) -> bool {
        (self.offset..self.offset + self.len).contains(&pos)
    }

    fn overlaps(&self, other: &ReplaceRange) -> bool {
        self.offset < other.offset + other.len && other.offset < self.offset + self.len
    }
}

/// Generates signatures from machine code
#[derive(Debug)]
pub struct SignatureGenerator<D> {
    decoder: D,
    max_instructions: usize,
}

impl<D: Decoder> SignatureGenerator<D> {
    /// Create a generator around `decoder`
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            max_instructions: MAX_INSTRUCTIONS,
        }
    }

    /// Cap the run at `max` instructions instead of [`MAX_INSTRUCTIONS`]
    pub fn with_max_instructions(mut self, max: usize) -> Self {
        self.max_instructions = max;
        self
    }

    /// The decoder in use
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Generate pattern text for the code at the start of `code`, which lives at `address`
    ///
    /// Decoding stops at the instruction cap, the end of `code`, an undecodable
    /// instruction, or a breakpoint. It also stops before an instruction that would
    /// take the text past [`Pattern::MAX_LEN`] tokens. An empty string means no usable signature.
    pub fn generate(&self, code: &[u8], address: u64) -> Result<String, SigError> {
        let mut text = String::new();
        let mut pos = 0;
        let mut count = 0;

        while count < self.max_instructions && pos < code.len() {
            let rest = &code[pos..];

            let Some(record) = self.decoder.decode_one(rest, address.wrapping_add(pos as u64))
            else {
                debug!(offset = pos, "undecodable instruction, stopping");
                break;
            };

            if record.len == 0 || record.len > rest.len() {
                debug!(offset = pos, len = record.len, "decoder reported a bad length, stopping");
                break;
            }

            if record.opcode == BREAKPOINT && record.len == 1 {
                debug!(offset = pos, "breakpoint, stopping");
                break;
            }

            // one token per byte
            if pos + record.len > Pattern::MAX_LEN {
                debug!(offset = pos, len = record.len, "pattern length limit reached, stopping");
                break;
            }

            let bytes = &rest[..record.len];
            let ranges = replace_ranges(&record, bytes).map_err(|operand| {
                warn!(offset = pos, operand, ?record, "operand not found in encoding");
                SigError::DecodeInconsistency {
                    offset: pos,
                    operand,
                    bytes: bytes.to_vec(),
                }
            })?;

            let segments = mask_instruction(bytes, &ranges);
            trace!(offset = pos, ?record, ?ranges, "classified instruction");

            for segment in segments {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&segment.to_string());
            }

            pos += record.len;
            count += 1;
        }

        debug!(instructions = count, bytes = pos, "generated signature");

        Ok(text)
    }

    /// Like [`generate`](Self::generate), but compiled. `None` when nothing was decoded
    pub fn generate_pattern(&self, code: &[u8], address: u64) -> Result<Option<Pattern>, SigError> {
        let text = self.generate(code, address)?;
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(Pattern::new(&text)?))
    }

    /// Generate a signature for live code in `start..end`
    ///
    /// # Safety
    ///
    /// * `start..end` - readable memory, `start <= end`
    pub unsafe fn generate_raw(&self, start: *const u8, end: *const u8) -> Result<String, SigError> {
        if start.is_null() || end <= start {
            return Ok(String::new());
        }

        let size = end as usize - start as usize;
        // SAFETY: the caller guarantees start..end is readable
        let code = unsafe { slice::from_raw_parts(start, size) };

        self.generate(code, start as u64)
    }
}

/// Byte ranges of `bytes` (one instruction) that depend on its load address
///
/// On failure returns the index of the operand that could not be located.
pub fn replace_ranges(record: &InstructionRecord, bytes: &[u8]) -> Result<Vec<ReplaceRange>, usize> {
    let len = record.len.min(bytes.len());
    let opcode_end = record.opcode_end().min(len);

    let has_target = record.operands.iter().any(|op| {
        matches!(
            op,
            Operand::ImmediateRelative(_) | Operand::ImmediateAbsolute(_)
        ) || op.is_fixed_address()
    });

    // the whole operand tail of a branch encodes its destination
    if record.is_branch && has_target {
        if opcode_end == len {
            return Ok(Vec::new());
        }

        return Ok(vec![ReplaceRange {
            offset: opcode_end,
            len: len - opcode_end,
        }]);
    }

    let mut immediates = Vec::new();
    let mut displacements = Vec::new();
    for (index, operand) in record.operands.iter().enumerate() {
        match *operand {
            Operand::ImmediateAbsolute(value) | Operand::ImmediateRelative(value) => {
                immediates.push((index, value));
            }
            Operand::Memory { displacement, .. } if operand.is_fixed_address() => {
                displacements.push((index, displacement));
            }
            _ => (),
        }
    }

    // x86 encodes immediates last, after any displacement. claim them first, from the
    // right, so every field is the rightmost match that no other field owns
    let mut ranges: Vec<ReplaceRange> = Vec::with_capacity(immediates.len() + displacements.len());
    for &(index, value) in immediates.iter().rev().chain(&displacements) {
        let range = locate(value, &bytes[..len], opcode_end, &ranges).ok_or(index)?;
        ranges.push(range);
    }

    ranges.sort_unstable_by_key(|range| range.offset);

    Ok(ranges)
}

/// Rightmost little-endian encoding of `value` in `bytes[from..]` that overlaps none of `claimed`
///
/// Fields that fit 32 bits are tried as 4, 2 then 1 bytes; wider values only as 8.
fn locate(value: i64, bytes: &[u8], from: usize, claimed: &[ReplaceRange]) -> Option<ReplaceRange> {
    let encoded = value.to_le_bytes();
    let window = bytes.get(from..)?;

    let widths: &[usize] = if holds(value, 4) { &[4, 2, 1] } else { &[8] };

    widths
        .iter()
        .filter(|&&width| width <= window.len() && holds(value, width))
        .find_map(|&width| {
            let needle = &encoded[..width];
            window
                .windows(width)
                .enumerate()
                .rev()
                .map(|(pos, candidate)| {
                    let range = ReplaceRange {
                        offset: from + pos,
                        len: width,
                    };
                    (range, candidate)
                })
                .find(|(range, candidate)| {
                    *candidate == needle && !claimed.iter().any(|c| c.overlaps(range))
                })
                .map(|(range, _)| range)
        })
}

/// Whether a `width` byte field can encode `value`, zero- or sign-extended.
/// Decoders may report a sign-extended field zero-extended to 16 or 32 bits.
fn holds(value: i64, width: usize) -> bool {
    let bits = width as u32 * 8;
    if bits >= 64 {
        return true;
    }

    let raw = value as u64;
    let low = raw & low_mask(bits);
    let extended = (((low << (64 - bits)) as i64) >> (64 - bits)) as u64;

    raw == low
        || [16, 32, 64]
            .into_iter()
            .filter(|&size| size > bits)
            .any(|size| raw == extended & low_mask(size))
}

fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}

fn mask_instruction(bytes: &[u8], ranges: &[ReplaceRange]) -> Vec<Segment> {
    bytes
        .iter()
        .enumerate()
        .map(|(pos, &byte)| {
            if ranges.iter().any(|range| range.contains(pos)) {
                Segment::Wildcard
            } else {
                Segment::Literal(byte)
            }
        })
        .collect()
}
