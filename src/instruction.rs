//! Decoded instructions and their displacement classification.

use std::fmt::{self, Display, Formatter};

use crate::decode::DecodedInstruction;


/// A decoded machine code instruction.
///
/// The address and bytes are changed by relocation, everything else stays as
/// it was decoded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Instruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub displacement: Displacement,
    /// Index of the displacement or immediate field within `bytes`.
    pub displacement_offset: u8,
    /// Byte width of that field.
    pub displacement_size: u8,
}

/// How the target of an instruction is encoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Displacement {
    /// The instruction has no target.
    None,
    /// Offset from the address of the next instruction.
    Relative(i64),
    /// The target address itself.
    Absolute(u64),
}

impl Default for Displacement {
    fn default() -> Displacement {
        Displacement::None
    }
}

impl Instruction {
    /// Create an instruction without displacement.
    pub fn new<M, O>(address: u64, bytes: Vec<u8>, mnemonic: M, operands: O) -> Instruction
    where M: Into<String>, O: Into<String> {
        Instruction {
            address,
            bytes,
            mnemonic: mnemonic.into(),
            operands: operands.into(),
            displacement: Displacement::None,
            displacement_offset: 0,
            displacement_size: 0,
        }
    }

    /// The byte length of the instruction.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the instruction has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the instruction encodes a relative or absolute target.
    pub fn has_displacement(&self) -> bool {
        self.displacement != Displacement::None
    }

    /// The address the displacement resolves to.
    pub fn destination(&self) -> Option<u64> {
        match self.displacement {
            Displacement::None => None,
            Displacement::Relative(offset) => Some(
                self.address
                    .wrapping_add(self.len() as u64)
                    .wrapping_add(offset as u64)
            ),
            Displacement::Absolute(target) => Some(target),
        }
    }

    /// Whether this is a conditional jump.
    pub fn is_conditional_jump(&self) -> bool {
        is_conditional_jump(&self.bytes)
    }
}

impl From<&DecodedInstruction> for Instruction {
    fn from(decoded: &DecodedInstruction) -> Instruction {
        Instruction::new(
            decoded.address,
            decoded.bytes.clone(),
            decoded.mnemonic.as_str(),
            decoded.operand_text.as_str(),
        )
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:x}: {}", self.address, self.mnemonic)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands)?;
        }
        if let Some(destination) = self.destination() {
            write!(f, " -> {:x}", destination)?;
        }
        Ok(())
    }
}

/// Whether the bytes encode a conditional jump (`jcc rel8`, `jcc rel32` or
/// `jecxz`/`jrcxz`).
pub fn is_conditional_jump(bytes: &[u8]) -> bool {
    match bytes {
        [0x0f, second, ..] if (0x80 ..= 0x8f).contains(second) => true,
        [first, ..] => (0x70 ..= 0x7f).contains(first) || *first == 0xe3,
        [] => false,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_jumps() {
        assert!(is_conditional_jump(&[0x74, 0x05]));
        assert!(is_conditional_jump(&[0x7f, 0x09]));
        assert!(is_conditional_jump(&[0x70]));
        assert!(is_conditional_jump(&[0x0f, 0x84, 0x10, 0x00, 0x00, 0x00]));
        assert!(is_conditional_jump(&[0x0f, 0x8f, 0x00, 0x00, 0x00, 0x00]));
        assert!(is_conditional_jump(&[0xe3, 0x02]));

        assert!(!is_conditional_jump(&[]));
        assert!(!is_conditional_jump(&[0xe9, 0x00, 0x00, 0x00, 0x00]));
        assert!(!is_conditional_jump(&[0xeb, 0xfe]));
        assert!(!is_conditional_jump(&[0x0f]));
        assert!(!is_conditional_jump(&[0x0f, 0x05]));
        assert!(!is_conditional_jump(&[0x0f, 0x90, 0xc0]));
        assert!(!is_conditional_jump(&[0x80, 0x7d, 0xff, 0x60]));
    }

    #[test]
    fn destination() {
        let mut inst = Instruction::new(0x1000, vec![0x74, 0x05], "je", "0x1007");
        assert!(!inst.has_displacement());
        assert_eq!(inst.destination(), None);

        inst.displacement = Displacement::Relative(5);
        assert_eq!(inst.destination(), Some(0x1007));

        inst.displacement = Displacement::Relative(-2);
        assert_eq!(inst.destination(), Some(0x1000));

        inst.displacement = Displacement::Absolute(0xdead_beef);
        assert_eq!(inst.destination(), Some(0xdead_beef));
    }

    #[test]
    fn destination_wraps() {
        let mut inst = Instruction::new(u64::MAX - 1, vec![0xeb, 0x01], "jmp", "");
        inst.displacement = Displacement::Relative(1);
        assert_eq!(inst.destination(), Some(1));
    }

    #[test]
    fn display() {
        let mut inst = Instruction::new(0x1000, vec![0x74, 0x05], "je", "0x1007");
        inst.displacement = Displacement::Relative(5);
        assert_eq!(inst.to_string(), "1000: je 0x1007 -> 1007");
        assert_eq!(Instruction::new(0x20, vec![0xc3], "ret", "").to_string(), "20: ret");
    }
}
