//! Disassembly of x86 machine code for relocation. 🪝
//!
//! Decodes a region of code into instructions, classifies the displacement of
//! every branch and instruction-pointer-relative memory access as relative or
//! absolute and records which instructions in the region branch to which.

use std::fmt::{self, Display, Formatter};

#[macro_use]
mod helper;

pub mod branch;
pub mod decode;
pub mod displacement;
#[cfg(feature = "iced")]
pub mod iced;
pub mod instruction;
pub mod reloc;
#[cfg(feature = "timings")]
pub mod timings;
pub mod x86_64;

pub use branch::{BranchMap, BranchMapper};
pub use decode::{Bitness, Decoder, DecodedInstruction};
pub use displacement::{DisplacementError, set_displacement_fields};
pub use instruction::{Displacement, Instruction, is_conditional_jump};
pub use reloc::{RelocError, write_encoding, write_encoding_into};
pub use x86_64::X64Decoder;
#[cfg(feature = "iced")]
pub use crate::iced::IcedDecoder;


/// The result of disassembling a region of code.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Disassembly {
    /// The instructions in ascending address order.
    pub instructions: Vec<Instruction>,
    /// Which instructions of the region branch to which.
    pub branches: BranchMap,
}

impl Disassembly {
    /// The instruction at `address`, if one starts there.
    pub fn instruction_at(&self, address: u64) -> Option<&Instruction> {
        self.instructions
            .binary_search_by_key(&address, |inst| inst.address)
            .ok()
            .map(|index| &self.instructions[index])
    }

    /// The address right after the last instruction.
    pub fn end(&self) -> Option<u64> {
        self.instructions.last().map(|inst| inst.address.wrapping_add(inst.len() as u64))
    }
}

impl Display for Disassembly {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Disassembly [")?;
        if !self.instructions.is_empty() {
            writeln!(f)?;
        }
        for inst in &self.instructions {
            writeln!(f, "    {}", inst)?;
        }
        write!(f, "]")
    }
}

/// Drives a decoder over a region of code.
#[derive(Debug, Clone)]
pub struct Disassembler<D> {
    decoder: D,
}

impl<D: Decoder> Disassembler<D> {
    /// Create a disassembler on top of a decoder backend.
    pub fn new(decoder: D) -> Disassembler<D> {
        Disassembler { decoder }
    }

    /// The underlying decoder.
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Disassemble `code` whose first byte lives at address `first_ip`.
    ///
    /// Decoding stops at the first position where the decoder fails and the
    /// instructions decoded until then are returned. An error is only
    /// returned if a decoded displacement contradicts the target reported by
    /// the decoder.
    pub fn disassemble(&mut self, first_ip: u64, code: &[u8]) -> DisasmResult<Disassembly> {
        let ip_register = self.decoder.ip_register();
        let mut instructions: Vec<Instruction> = Vec::new();
        let mut mapper = BranchMapper::new();
        let mut offset = 0;

        while offset < code.len() {
            let address = first_ip.wrapping_add(offset as u64);
            let decoder = &mut self.decoder;
            let decoded = match measure("decode", || decoder.decode(&code[offset ..], address)) {
                Some(decoded) if !decoded.bytes.is_empty() => decoded,
                _ => {
                    tracing::debug!("decoding stopped at {:#x} after {} instructions",
                        address, instructions.len());
                    break;
                }
            };

            let mut inst = Instruction::from(&decoded);
            measure("classify", || set_displacement_fields(&mut inst, &decoded, ip_register))
                .map_err(|err| {
                    tracing::warn!("{}", err);
                    err
                })?;

            offset += inst.len();
            instructions.push(inst);
            measure("map", || mapper.push(&instructions));
        }

        Ok(Disassembly {
            instructions,
            branches: mapper.finish(),
        })
    }

    /// Disassemble the memory in `[start, end)`, where the instruction at
    /// `start` has the logical address `first_ip`.
    ///
    /// # Safety
    /// The memory in the range must be readable and must not be written
    /// while this runs.
    pub unsafe fn disassemble_range(&mut self, first_ip: u64, start: u64, end: u64) -> DisasmResult<Disassembly> {
        let len = end.saturating_sub(start) as usize;
        if len == 0 {
            return Ok(Disassembly::default());
        }
        let code = std::slice::from_raw_parts(start as usize as *const u8, len);
        self.disassemble(first_ip, code)
    }
}

/// Run the closure as the named phase of disassembly.
#[cfg(feature = "timings")]
fn measure<F, T>(phase: &'static str, f: F) -> T where F: FnOnce() -> T {
    timings::with(phase, f)
}

#[cfg(not(feature = "timings"))]
#[inline]
fn measure<F, T>(_: &'static str, f: F) -> T where F: FnOnce() -> T {
    f()
}


/// Error type for disassembly and relocation.
#[derive(Clone, Eq, PartialEq)]
pub enum DisasmError {
    Displacement(DisplacementError),
    Reloc(RelocError),
}

/// Result type for disassembly and relocation.
pub type DisasmResult<T> = Result<T, DisasmError>;

impl std::error::Error for DisasmError {}
debug_display!(DisasmError);

impl Display for DisasmError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DisasmError::Displacement(err) => write!(f, "Displacement error: {}", err),
            DisasmError::Reloc(err) => write!(f, "Relocation error: {}", err),
        }
    }
}

impl From<DisplacementError> for DisasmError {
    fn from(err: DisplacementError) -> DisasmError { DisasmError::Displacement(err) }
}

impl From<RelocError> for DisasmError {
    fn from(err: RelocError) -> DisasmError { DisasmError::Reloc(err) }
}
