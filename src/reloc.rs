//! Moving instructions to new addresses and writing them to memory.
//!
//! Relocation is split into independent steps: decode, adjust the
//! displacement, write the encoding. Nothing is written before the caller
//! commits with one of the write functions, so a whole set of instructions
//! can be adjusted and checked before any byte changes.

use std::fmt::{self, Display, Formatter};
use std::ptr;

use crate::instruction::{Displacement, Instruction};


impl Instruction {
    /// Encode a new relative displacement into the field of the instruction.
    pub fn set_relative_displacement(&mut self, displacement: i64) -> RelocResult<()> {
        if !matches!(self.displacement, Displacement::Relative(_)) {
            return Err(RelocError::NoRelativeDisplacement { address: self.address });
        }

        let size = self.displacement_size;
        let start = self.displacement_offset as usize;
        let end = start + size as usize;
        if !(1 ..= 8).contains(&size) || end > self.bytes.len() {
            return Err(RelocError::NoRelativeDisplacement { address: self.address });
        }

        let bits = size as u32 * 8;
        let fits = bits == 64 || {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            min <= displacement && displacement <= max
        };
        if !fits {
            return Err(RelocError::OutOfRange { address: self.address, displacement, size });
        }

        let encoded = displacement.to_le_bytes();
        self.bytes[start .. end].copy_from_slice(&encoded[.. size as usize]);
        self.displacement = Displacement::Relative(displacement);
        Ok(())
    }

    /// Move the instruction to `address`, adjusting a relative displacement
    /// so that the destination stays the same.
    ///
    /// Nothing changes if the new displacement does not fit.
    pub fn relocate(&mut self, address: u64) -> RelocResult<()> {
        if let (Displacement::Relative(_), Some(destination)) = (self.displacement, self.destination()) {
            let next = address.wrapping_add(self.len() as u64);
            let displacement = destination.wrapping_sub(next) as i64;
            self.set_relative_displacement(displacement)?;
        }
        self.address = address;
        Ok(())
    }
}

/// Write the bytes of the instruction to the memory at its address.
///
/// If the address was changed since decoding, this copies the instruction to
/// its new location. Displacements are not adjusted here, that has to happen
/// before with [`Instruction::relocate`] or
/// [`Instruction::set_relative_displacement`].
///
/// # Safety
/// The memory at `instruction.address` must be valid for writes of
/// `instruction.len()` bytes and must not be read or written concurrently.
pub unsafe fn write_encoding(instruction: &Instruction) {
    ptr::copy_nonoverlapping(
        instruction.bytes.as_ptr(),
        instruction.address as usize as *mut u8,
        instruction.len(),
    );
}

/// Write the bytes of the instruction into `memory`, which holds the memory
/// starting at address `base`.
pub fn write_encoding_into(instruction: &Instruction, memory: &mut [u8], base: u64) -> RelocResult<()> {
    let out_of_bounds = RelocError::OutOfBounds { address: instruction.address, len: instruction.len() };

    let start = instruction.address.checked_sub(base).ok_or_else(|| out_of_bounds.clone())? as usize;
    let end = start.checked_add(instruction.len()).ok_or_else(|| out_of_bounds.clone())?;
    let target = memory.get_mut(start .. end).ok_or(out_of_bounds)?;

    target.copy_from_slice(&instruction.bytes);
    Ok(())
}


/// The error type for relocation.
#[derive(Clone, Eq, PartialEq)]
pub enum RelocError {
    /// The instruction has no relative displacement field to adjust.
    NoRelativeDisplacement { address: u64 },
    /// The displacement does not fit into the field of the instruction.
    OutOfRange { address: u64, displacement: i64, size: u8 },
    /// The instruction does not lie within the given memory.
    OutOfBounds { address: u64, len: usize },
}

pub type RelocResult<T> = Result<T, RelocError>;

impl Display for RelocError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            RelocError::NoRelativeDisplacement { address } => write!(f,
                "Instruction at {:x} has no relative displacement", address),
            RelocError::OutOfRange { address, displacement, size } => write!(f,
                "Displacement {} for instruction at {:x} does not fit into {} bytes",
                displacement, address, size),
            RelocError::OutOfBounds { address, len } => write!(f,
                "Instruction at {:x} with {} bytes lies outside of memory", address, len),
        }
    }
}

impl std::error::Error for RelocError {}
debug_display!(RelocError);
