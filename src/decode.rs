//! The decoder capability consumed by the disassembler.

use std::fmt::{self, Display, Formatter};

use crate::x86_64::Register;


/// Decodes single instructions from raw bytes.
///
/// A backend only has to find the instruction boundaries and report where
/// displacement and immediate fields live inside the encoding. All
/// classification and cross-referencing happens on top of this.
pub trait Decoder {
    /// The register used as base by instruction-pointer-relative memory
    /// operands.
    fn ip_register(&self) -> Register;

    /// Decode the instruction at the start of `bytes`, which is located at
    /// address `ip`.
    ///
    /// Returns `None` if no valid instruction can be decoded, e.g. because
    /// the bytes are not code or the instruction is truncated.
    fn decode(&mut self, bytes: &[u8], ip: u64) -> Option<DecodedInstruction>;
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn ip_register(&self) -> Register {
        (**self).ip_register()
    }

    fn decode(&mut self, bytes: &[u8], ip: u64) -> Option<DecodedInstruction> {
        (**self).decode(bytes, ip)
    }
}

impl<D: Decoder + ?Sized> Decoder for &mut D {
    fn ip_register(&self) -> Register {
        (**self).ip_register()
    }

    fn decode(&mut self, bytes: &[u8], ip: u64) -> Option<DecodedInstruction> {
        (**self).decode(bytes, ip)
    }
}

/// One instruction as reported by a decoder backend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DecodedInstruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operand_text: String,
    pub operands: Vec<Operand>,
    pub encoding: Encoding,
    pub groups: Vec<Group>,
}

impl DecodedInstruction {
    /// The byte length of the instruction.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the instruction belongs to the group.
    pub fn has_group(&self, group: Group) -> bool {
        self.groups.contains(&group)
    }

    /// Whether this is a jump or call of any kind.
    pub fn is_jump_or_call(&self) -> bool {
        self.has_group(Group::Jump) || self.has_group(Group::Call)
    }
}

/// An operand as far as relocation is concerned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Operand {
    /// A register operand.
    Register(Register),
    /// A memory reference, with its base register if there is one.
    Memory { base: Option<Register> },
    /// An immediate. For jumps and calls this is the resolved target address.
    Immediate(u64),
    /// Anything else.
    Other,
}

/// Location of the displacement and immediate fields inside the encoding.
///
/// A size of zero means the instruction has no such field.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Encoding {
    pub disp_offset: u8,
    pub disp_size: u8,
    pub imm_offset: u8,
    pub imm_size: u8,
}

/// Instruction groups the classifier cares about.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Group {
    Jump,
    Call,
    Ret,
    Int,
    BranchRelative,
}

/// Operating mode of the decoded code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Bitness {
    Bits16,
    Bits32,
    Bits64,
}

impl Bitness {
    /// The mode as a number of bits.
    pub fn bits(self) -> u32 {
        match self {
            Bitness::Bits16 => 16,
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        }
    }

    /// The instruction pointer register of this mode.
    pub fn ip_register(self) -> Register {
        match self {
            Bitness::Bits16 => Register::IP,
            Bitness::Bits32 => Register::EIP,
            Bitness::Bits64 => Register::RIP,
        }
    }
}

impl Display for Bitness {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}
