//! Binary signature engine
//!
//! Locate known byte sequences in live memory or in on-disk PE images, and
//! generate such sequences from machine code with the position-dependent
//! bytes wildcarded.
//!
//! # Note about raw memory
//! The raw pointer entry points ([`scan::sig_scan`], [`sig::SignatureGenerator::generate_raw`], ..)
//! perform no memory protection checks. The caller must prove the range is mapped and readable.
//! Everything past that boundary works on slices.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod asm;
pub mod pe;
pub mod scan;
pub mod sig;

pub use asm::{CapstoneDecoder, Decoder, InstructionRecord, Operand};
pub use pe::{ImageError, PeImage, Section};
pub use scan::{Pattern, PatternError, Scan, ScanContext, Segment};
pub use sig::{SigError, SignatureGenerator};

/// Machine mode used when decoding instructions
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
pub enum Bitness {
    /// x86 (32-bit)
    #[strum(serialize = "32")]
    X86,
    /// x86-64
    #[default]
    #[strum(serialize = "64")]
    X64,
}
