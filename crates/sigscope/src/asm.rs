//! Instruction decoding
//!
//! The signature generator only sees [`InstructionRecord`]s through the [`Decoder`]
//! trait. [`CapstoneDecoder`] is the real implementation; tests use synthetic ones.

use std::fmt::{self, Display};

use arrayvec::ArrayVec;
use capstone::arch::x86::{ArchMode, ArchSyntax, X86OpMem, X86OperandType, X86Reg};
use capstone::arch::{ArchDetail, BuildsCapstone, BuildsCapstoneSyntax, DetailsArchInsn};
use capstone::{Capstone, Insn, InsnGroupType};

use crate::Bitness;

/// An error for the [asm](crate::asm) module
#[derive(Debug, thiserror::Error)]
pub enum AsmError {
    /// nothing could be decoded
    #[error("failed to disassemble")]
    BadDis,
    /// error from capstone
    #[error(transparent)]
    Capstone(#[from] capstone::Error),
}

/// Maximum number of operands carried by an [`InstructionRecord`]
pub const MAX_OPERANDS: usize = 3;

/// One operand, as far as position dependence is concerned
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    /// a memory reference
    Memory {
        /// a base register takes part in the address
        base: bool,
        /// an index register takes part in the address
        index: bool,
        /// scale applied to the index, 0 when there is no index
        scale: i32,
        /// raw displacement
        displacement: i64,
        /// the address is relative to the instruction pointer (x86-64)
        rip_relative: bool,
    },
    /// a register
    Register,
    /// an immediate constant, encoded as-is
    ImmediateAbsolute(i64),
    /// an immediate resolved relative to the instruction pointer
    ImmediateRelative(i64),
}

impl Operand {
    /// A memory operand addressed only by a baked-in displacement
    pub fn is_fixed_address(&self) -> bool {
        match *self {
            Operand::Memory {
                base,
                index,
                scale,
                displacement,
                rip_relative,
            } => (rip_relative || (!base && !index && scale == 0)) && displacement != 0,
            _ => false,
        }
    }
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionRecord {
    /// opcode value, e.g. `0xE8` or `0x0F85`
    pub opcode: u32,
    /// number of opcode bytes
    pub opcode_len: u8,
    /// number of legacy and REX prefix bytes in front of the opcode
    pub prefix_len: u8,
    /// total encoded length in bytes
    pub len: usize,
    /// jump or call. returns are not, their operand is a stack adjustment
    pub is_branch: bool,
    /// up to [`MAX_OPERANDS`] operands, in decoder order
    pub operands: ArrayVec<Operand, MAX_OPERANDS>,
}

impl InstructionRecord {
    /// Offset of the first byte after the opcode
    pub fn opcode_end(&self) -> usize {
        (usize::from(self.prefix_len) + usize::from(self.opcode_len)).min(self.len)
    }
}

/// Decodes one instruction at a time
pub trait Decoder {
    /// Decode the instruction at the start of `code`, located at runtime address `address`
    ///
    /// `None` when the bytes do not form a valid instruction.
    fn decode_one(&self, code: &[u8], address: u64) -> Option<InstructionRecord>;
}

impl<D: Decoder + ?Sized> Decoder for &D {
    fn decode_one(&self, code: &[u8], address: u64) -> Option<InstructionRecord> {
        (**self).decode_one(code, address)
    }
}

/// x86 / x86-64 decoder backed by capstone
pub struct CapstoneDecoder {
    cs: Capstone,
    bitness: Bitness,
}

impl fmt::Debug for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapstoneDecoder")
            .field("bitness", &self.bitness)
            .finish()
    }
}

impl CapstoneDecoder {
    /// Create a decoder for the given machine mode
    pub fn new(bitness: Bitness) -> Result<Self, AsmError> {
        let cs = build_capstone(bitness, true)?;
        Ok(Self { cs, bitness })
    }

    /// The machine mode this decoder was built for
    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn record(&self, insn: &Insn) -> Option<InstructionRecord> {
        let detail = self.cs.insn_detail(insn).ok()?;

        let is_branch = detail.groups().into_iter().any(|group| {
            matches!(
                u32::from(group.0),
                InsnGroupType::CS_GRP_JUMP
                    | InsnGroupType::CS_GRP_CALL
                    | InsnGroupType::CS_GRP_BRANCH_RELATIVE
            )
        });
        let is_relative = detail
            .groups()
            .into_iter()
            .any(|group| u32::from(group.0) == InsnGroupType::CS_GRP_BRANCH_RELATIVE);

        let ArchDetail::X86Detail(x86) = detail.arch_detail() else {
            return None;
        };

        let mut operands = ArrayVec::new();
        for op in x86.operands() {
            let operand = match op.op_type {
                X86OperandType::Reg(_) => Operand::Register,
                X86OperandType::Imm(value) if is_relative => Operand::ImmediateRelative(value),
                X86OperandType::Imm(value) => Operand::ImmediateAbsolute(value),
                X86OperandType::Mem(mem) => memory_operand(&mem),
                X86OperandType::Invalid => continue,
            };

            // a record we cannot fully describe must not be classified at all
            operands.try_push(operand).ok()?;
        }

        let prefix_len = x86.prefix().iter().filter(|&&b| b != 0).count()
            + usize::from(x86.rex() != 0);

        let opcode = x86.opcode();
        let opcode_len = match opcode {
            [0x0F, 0x38 | 0x3A, ..] => 3,
            [0x0F, ..] => 2,
            _ => 1,
        };
        let opcode_value = opcode[..opcode_len]
            .iter()
            .fold(0u32, |acc, &b| acc << 8 | u32::from(b));

        Some(InstructionRecord {
            opcode: opcode_value,
            opcode_len: opcode_len as u8,
            prefix_len: prefix_len as u8,
            len: insn.len(),
            is_branch,
            operands,
        })
    }
}

fn memory_operand(mem: &X86OpMem) -> Operand {
    let rip_relative = u32::from(mem.base().0) == X86Reg::X86_REG_RIP;
    let base = mem.base().0 != 0 && !rip_relative;
    let index = mem.index().0 != 0;

    Operand::Memory {
        base,
        index,
        // capstone reports a scale of 1 even without an index register
        scale: if index { mem.scale() } else { 0 },
        displacement: mem.disp(),
        rip_relative,
    }
}

impl Decoder for CapstoneDecoder {
    fn decode_one(&self, code: &[u8], address: u64) -> Option<InstructionRecord> {
        let insns = self.cs.disasm_count(code, address, 1).ok()?;
        let insn = insns.as_ref().first()?;

        self.record(insn)
    }
}

fn build_capstone(bitness: Bitness, detail: bool) -> Result<Capstone, AsmError> {
    let mode = match bitness {
        Bitness::X86 => ArchMode::Mode32,
        Bitness::X64 => ArchMode::Mode64,
    };

    let cs = Capstone::new()
        .x86()
        .mode(mode)
        .syntax(ArchSyntax::Intel)
        .detail(detail)
        .build()?;

    Ok(cs)
}

/// A disassembled instruction, for listings
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    /// runtime address
    pub address: u64,
    /// encoded size
    pub size: usize,
    /// raw bytes
    pub bytes: Vec<u8>,
    /// mnemonic, e.g. `mov`
    pub mnemonic: Option<String>,
    /// operand text
    pub op_str: Option<String>,
}

impl<'a> From<&'a Insn<'a>> for Inst {
    fn from(value: &Insn) -> Self {
        Self {
            address: value.address(),
            size: value.len(),
            bytes: value.bytes().to_vec(),
            mnemonic: value.mnemonic().map(ToOwned::to_owned),
            op_str: value.op_str().map(ToOwned::to_owned),
        }
    }
}

impl Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mnemonic.as_deref(), self.op_str.as_deref()) {
            (Some(mnemonic), Some("") | None) => write!(f, "{:#x}: {mnemonic}", self.address),
            (Some(mnemonic), Some(op_str)) => {
                write!(f, "{:#x}: {mnemonic} {op_str}", self.address)
            }
            _ => write!(f, "{:#x}: ?? {:02x?}", self.address, self.bytes),
        }
    }
}

/// Disassemble up to `instruction_count` instructions from `code`, stopping at the first
/// undecodable byte sequence
pub fn disassemble_bytes(
    code: &[u8],
    runtime_addr: u64,
    instruction_count: usize,
    bitness: Bitness,
) -> Result<Vec<Inst>, AsmError> {
    let cs = build_capstone(bitness, false)?;

    let insts = cs.disasm_count(code, runtime_addr, instruction_count)?;

    let buffer = insts.as_ref().iter().map(Inst::from).collect::<Vec<_>>();

    if buffer.is_empty() && !code.is_empty() && instruction_count > 0 {
        return Err(AsmError::BadDis);
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bitness: Bitness, code: &[u8]) -> InstructionRecord {
        CapstoneDecoder::new(bitness)
            .unwrap()
            .decode_one(code, 0x1000)
            .unwrap()
    }

    #[test]
    fn test_decode_relative_call() {
        // call rel32
        let record = decode(Bitness::X86, &[0xE8, 0x10, 0x20, 0x30, 0x40]);
        assert_eq!(record.len, 5);
        assert_eq!(record.opcode, 0xE8);
        assert_eq!(record.opcode_end(), 1);
        assert!(record.is_branch);
        assert!(matches!(
            record.operands[0],
            Operand::ImmediateRelative(_)
        ));
    }

    #[test]
    fn test_decode_two_byte_conditional_jump() {
        // jne rel32
        let record = decode(Bitness::X86, &[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(record.len, 6);
        assert_eq!(record.opcode, 0x0F85);
        assert_eq!(record.opcode_end(), 2);
        assert!(record.is_branch);
    }

    #[test]
    fn test_decode_absolute_memory_operand() {
        // mov eax, dword ptr [0x00403000]
        let record = decode(Bitness::X86, &[0x8B, 0x05, 0x00, 0x30, 0x40, 0x00]);
        assert!(!record.is_branch);
        assert_eq!(record.operands.len(), 2);
        assert_eq!(record.operands[0], Operand::Register);
        assert_eq!(
            record.operands[1],
            Operand::Memory {
                base: false,
                index: false,
                scale: 0,
                displacement: 0x0040_3000,
                rip_relative: false,
            }
        );
        assert!(record.operands[1].is_fixed_address());
    }

    #[test]
    fn test_decode_based_memory_operand() {
        // mov ecx, dword ptr [ebp + 8]
        let record = decode(Bitness::X86, &[0x8B, 0x4D, 0x08]);
        let Operand::Memory { base, displacement, .. } = record.operands[1] else {
            panic!("expected memory operand");
        };
        assert!(base);
        assert_eq!(displacement, 8);
        assert!(!record.operands[1].is_fixed_address());
    }

    #[test]
    fn test_decode_rip_relative_with_rex() {
        // lea rcx, [rip + 0x1234]
        let record = decode(Bitness::X64, &[0x48, 0x8D, 0x0D, 0x34, 0x12, 0x00, 0x00]);
        assert_eq!(record.prefix_len, 1);
        assert_eq!(record.opcode_end(), 2);
        assert!(record.operands[1].is_fixed_address());
    }

    #[test]
    fn test_returns_are_not_branches() {
        // ret 0x10
        let record = decode(Bitness::X86, &[0xC2, 0x10, 0x00]);
        assert_eq!(record.len, 3);
        assert!(!record.is_branch);
        assert_eq!(record.operands[0], Operand::ImmediateAbsolute(0x10));

        assert!(!decode(Bitness::X64, &[0xC3]).is_branch);
    }

    #[test]
    fn test_decode_breakpoint_and_garbage() {
        let record = decode(Bitness::X64, &[0xCC]);
        assert_eq!(record.opcode, 0xCC);
        assert_eq!(record.len, 1);

        let decoder = CapstoneDecoder::new(Bitness::X64).unwrap();
        assert!(decoder.decode_one(&[], 0).is_none());
        // truncated two-byte opcode
        assert!(decoder.decode_one(&[0x0F], 0).is_none());
    }

    #[test]
    fn test_disassemble_listing() {
        // push ebp; mov ebp, esp; ret
        let code = [0x55, 0x8B, 0xEC, 0xC3];
        let insts = disassemble_bytes(&code, 0x401000, 10, Bitness::X86).unwrap();
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].mnemonic.as_deref(), Some("push"));
        assert_eq!(insts[1].address, 0x401001);
        assert_eq!(insts[2].to_string(), "0x401003: ret");

        let insts = disassemble_bytes(&code, 0, 2, Bitness::X86).unwrap();
        assert_eq!(insts.len(), 2);
    }
}
