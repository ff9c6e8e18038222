//! Classification of displacements into relative and absolute ones.
//!
//! A displacement is found either in an instruction-pointer-relative memory
//! operand, which is always relative, or in the immediate of a jump or call,
//! which is compared against the target the decoder resolved for it.

use std::fmt::{self, Display, Formatter};
use byteorder::{ByteOrder, LittleEndian};

use crate::decode::{DecodedInstruction, Operand};
use crate::instruction::{Displacement, Instruction};
use crate::x86_64::Register;


/// Sets the displacement fields of `inst` from the operands of the decoded
/// instruction. Instructions without a qualifying operand are left untouched.
pub fn set_displacement_fields(
    inst: &mut Instruction,
    decoded: &DecodedInstruction,
    ip_register: Register,
) -> DisplacementResult<()> {
    let encoding = decoded.encoding;

    for operand in &decoded.operands {
        match *operand {
            // Memory like `jmp [rip+0x4]` where the location is dereferenced.
            Operand::Memory { base: Some(base) } if base == ip_register => {
                copy_displacement(inst, encoding.disp_offset, encoding.disp_size, Target::Relative)?;
            }

            // Immediates like `call 0xdeadbeef` which jump straight to a location.
            Operand::Immediate(target) if decoded.is_jump_or_call() => {
                copy_displacement(inst, encoding.imm_offset, encoding.imm_size, Target::Known(target))?;
            }

            _ => {}
        }
    }

    Ok(())
}

/// What the field read by [`copy_displacement`] is compared against.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Target {
    /// The field is relative to the instruction pointer by construction.
    Relative,
    /// The decoder resolved the operand to this address.
    Known(u64),
}

/// Reads the `size` byte field at `offset`, sign extends it and stores it as
/// the displacement of the instruction.
///
/// With a known target, a value less than the target means the instruction's
/// own address takes part in computing it, which makes the field relative.
/// Otherwise it is the absolute target address. Either way the field has to
/// reproduce the target, anything else means the decoder and the encoding
/// disagree.
///
/// The comparison is signed, so targets at or above `2^63` (high-half
/// kernel code) always take the absolute path. A relative branch to such a
/// target is reported as [`DisplacementError::Inconsistent`].
pub fn copy_displacement(
    inst: &mut Instruction,
    offset: u8,
    size: u8,
    target: Target,
) -> DisplacementResult<()> {
    let start = offset as usize;
    let end = start + size as usize;
    let field = match inst.bytes.get(start .. end) {
        Some(field) if (1 ..= 8).contains(&size) => field,
        _ => return Err(DisplacementError::Malformed { address: inst.address, offset, size }),
    };

    let value = sign_extend(field);
    let displacement = match target {
        Target::Relative => Displacement::Relative(value),
        Target::Known(target) => {
            if value < target as i64 {
                let resolved = inst.address
                    .wrapping_add(inst.len() as u64)
                    .wrapping_add(value as u64);
                if resolved != target {
                    return Err(DisplacementError::Inconsistent { address: inst.address, value, target });
                }
                Displacement::Relative(value)
            } else {
                if value as u64 != target {
                    return Err(DisplacementError::Inconsistent { address: inst.address, value, target });
                }
                Displacement::Absolute(value as u64)
            }
        }
    };

    inst.displacement = displacement;
    inst.displacement_offset = offset;
    inst.displacement_size = size;
    Ok(())
}

/// Reads a little-endian field of 1 to 8 bytes as a two's complement number.
pub fn sign_extend(field: &[u8]) -> i64 {
    let size = field.len();
    debug_assert!((1 ..= 8).contains(&size), "sign_extend: invalid field size {}", size);

    let raw = LittleEndian::read_uint(field, size);
    let mask = 1u64 << (size * 8 - 1);
    if raw & mask != 0 {
        // Clearing the sign bit and subtracting it again moves the sign into
        // the top bit of the 64-bit value.
        ((raw ^ mask) as i64).wrapping_sub(mask as i64)
    } else {
        raw as i64
    }
}


/// The error type for displacement classification.
#[derive(Clone, Eq, PartialEq)]
pub enum DisplacementError {
    /// The field does not lie within the instruction or has a width outside
    /// of 1 to 8 bytes.
    Malformed { address: u64, offset: u8, size: u8 },
    /// The field does not reproduce the target resolved by the decoder.
    Inconsistent { address: u64, value: i64, target: u64 },
}

pub type DisplacementResult<T> = Result<T, DisplacementError>;

impl Display for DisplacementError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DisplacementError::Malformed { address, offset, size } => write!(f,
                "Malformed displacement field at {:x}: {} bytes at offset {}", address, size, offset),
            DisplacementError::Inconsistent { address, value, target } => write!(f,
                "Displacement {:#x} at {:x} does not resolve to {:x}", value, address, target),
        }
    }
}

impl std::error::Error for DisplacementError {}
debug_display!(DisplacementError);


#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use super::*;
    use crate::decode::{Encoding, Group};

    fn decoded(address: u64, bytes: &[u8], operands: Vec<Operand>,
               encoding: Encoding, groups: Vec<Group>) -> DecodedInstruction {
        DecodedInstruction {
            address,
            bytes: bytes.to_vec(),
            mnemonic: String::new(),
            operand_text: String::new(),
            operands,
            encoding,
            groups,
        }
    }

    fn classify(decoded: &DecodedInstruction) -> DisplacementResult<Instruction> {
        let mut inst = Instruction::from(decoded);
        set_displacement_fields(&mut inst, decoded, Register::RIP)?;
        Ok(inst)
    }

    fn imm(offset: u8, size: u8) -> Encoding {
        Encoding { imm_offset: offset, imm_size: size, ..Encoding::default() }
    }

    fn disp(offset: u8, size: u8) -> Encoding {
        Encoding { disp_offset: offset, disp_size: size, ..Encoding::default() }
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(&[0x05]), 5);
        assert_eq!(sign_extend(&[0xfe]), -2);
        assert_eq!(sign_extend(&[0x80]), -128);
        assert_eq!(sign_extend(&[0x7f]), 127);
        assert_eq!(sign_extend(&[0x00, 0x80]), -32768);
        assert_eq!(sign_extend(&[0xcb, 0xff, 0xff, 0xff]), -0x35);
        assert_eq!(sign_extend(&[0xff, 0xff, 0xff, 0x7f]), i32::MAX as i64);
        assert_eq!(sign_extend(&[0xff; 8]), -1);
        assert_eq!(sign_extend(&[0, 0, 0, 0, 0, 0, 0, 0x80]), i64::MIN);
        assert_eq!(sign_extend(&[0xff, 0xff, 0xff]), -1);
    }

    #[test]
    fn relative_jump() {
        let je = decoded(0x1000, &[0x74, 0x05], vec![Operand::Immediate(0x1007)],
                         imm(1, 1), vec![Group::Jump, Group::BranchRelative]);
        let inst = classify(&je).unwrap();
        assert_eq!(inst.displacement, Displacement::Relative(5));
        assert_eq!(inst.displacement_offset, 1);
        assert_eq!(inst.displacement_size, 1);
        assert_eq!(inst.destination(), Some(0x1007));
    }

    #[test]
    fn backward_call() {
        let call = decoded(0x400000, &[0xe8, 0x8a, 0xff, 0xff, 0xff],
                           vec![Operand::Immediate(0x400000 + 5 - 0x76)],
                           imm(1, 4), vec![Group::Call, Group::BranchRelative]);
        let inst = classify(&call).unwrap();
        assert_eq!(inst.displacement, Displacement::Relative(-0x76));
        assert_eq!(inst.destination(), Some(0x3fff8f));
    }

    #[test]
    fn rip_relative_memory() {
        // mov rax, [rip-0x35]
        let mov = decoded(0x1000, &[0x48, 0x8b, 0x05, 0xcb, 0xff, 0xff, 0xff],
                          vec![Operand::Register(Register::RAX), Operand::Memory { base: Some(Register::RIP) }],
                          disp(3, 4), vec![]);
        let inst = classify(&mov).unwrap();
        assert_eq!(inst.displacement, Displacement::Relative(-0x35));
        assert_eq!(inst.displacement_offset, 3);
        assert_eq!(inst.destination(), Some(0x1007 - 0x35));
    }

    #[test]
    fn rip_relative_only_for_ip_register() {
        // The same memory operand with a base that is not the decoder's ip register.
        let mov = decoded(0x1000, &[0x8b, 0x45, 0xfc], vec![Operand::Memory { base: Some(Register::RBP) }],
                          disp(2, 1), vec![]);
        assert_eq!(classify(&mov).unwrap().displacement, Displacement::None);

        let mut inst = Instruction::from(&mov);
        let eip = decoded(0x1000, &[0x8b, 0x05, 0x00, 0x00, 0x00, 0x00],
                          vec![Operand::Memory { base: Some(Register::EIP) }], disp(2, 4), vec![]);
        set_displacement_fields(&mut inst, &eip, Register::RIP).unwrap();
        assert_eq!(inst.displacement, Displacement::None);
    }

    #[test]
    fn absolute_far_jump() {
        // jmp 0x0008:0x12345678 in 32-bit code.
        let jmp = decoded(0x1000, &[0xea, 0x78, 0x56, 0x34, 0x12, 0x08, 0x00],
                          vec![Operand::Immediate(0x12345678)], imm(1, 4), vec![Group::Jump]);
        let inst = classify(&jmp).unwrap();
        assert_eq!(inst.displacement, Displacement::Absolute(0x12345678));
        assert_eq!(inst.destination(), Some(0x12345678));
    }

    #[test]
    fn immediates_outside_jumps_are_ignored() {
        // mov eax, 0x2a
        let mov = decoded(0x1000, &[0xb8, 0x2a, 0x00, 0x00, 0x00], vec![Operand::Immediate(0x2a)],
                          imm(1, 4), vec![]);
        let inst = classify(&mov).unwrap();
        assert_eq!(inst.displacement, Displacement::None);
        assert_eq!(inst.displacement_offset, 0);

        let ret = decoded(0x1000, &[0xc2, 0x08, 0x00], vec![Operand::Immediate(8)],
                          imm(1, 2), vec![Group::Ret]);
        assert!(!classify(&ret).unwrap().has_displacement());
    }

    #[test]
    fn inconsistent_target() {
        let je = decoded(0x1000, &[0x74, 0x05], vec![Operand::Immediate(0x1008)],
                         imm(1, 1), vec![Group::Jump]);
        assert_eq!(classify(&je).unwrap_err(), DisplacementError::Inconsistent {
            address: 0x1000,
            value: 5,
            target: 0x1008,
        });

        let far = decoded(0x1000, &[0xea, 0x78, 0x56, 0x34, 0x12, 0x08, 0x00],
                          vec![Operand::Immediate(0x1234)], imm(1, 4), vec![Group::Jump]);
        assert!(matches!(classify(&far), Err(DisplacementError::Inconsistent { .. })));
    }

    #[test]
    fn high_half_targets_are_unsupported() {
        let address = 0xffff_8000_0000_1000;
        let jmp = decoded(address, &[0xeb, 0x00], vec![Operand::Immediate(address + 2)],
                          imm(1, 1), vec![Group::Jump, Group::BranchRelative]);
        assert_eq!(classify(&jmp).unwrap_err(), DisplacementError::Inconsistent {
            address,
            value: 0,
            target: address + 2,
        });
    }

    #[test]
    fn malformed_field() {
        let short = decoded(0x1000, &[0xe9, 0x00], vec![Operand::Immediate(0x1002)],
                            imm(1, 4), vec![Group::Jump]);
        assert_eq!(classify(&short).unwrap_err(), DisplacementError::Malformed {
            address: 0x1000,
            offset: 1,
            size: 4,
        });

        let empty = decoded(0x1000, &[0x74, 0x00], vec![Operand::Immediate(0x1002)],
                            imm(1, 0), vec![Group::Jump]);
        assert!(matches!(classify(&empty), Err(DisplacementError::Malformed { .. })));
    }

    #[test]
    fn error_display() {
        let err = DisplacementError::Inconsistent { address: 0x1000, value: 5, target: 0x1008 };
        assert_eq!(err.to_string(), "Displacement 0x5 at 1000 does not resolve to 1008");
        assert_eq!(format!("{:?}", err), err.to_string());
    }

    fn width_and_value() -> impl Strategy<Value = (usize, u64)> {
        prop_oneof![Just(1usize), Just(2usize), Just(4usize), Just(8usize)]
            .prop_flat_map(|width| (Just(width), any::<u64>()))
    }

    proptest! {
        #[test]
        fn sign_extend_matches_twos_complement((width, raw) in width_and_value()) {
            let bytes = raw.to_le_bytes();
            let field = &bytes[.. width];
            let expected = match width {
                1 => field[0] as i8 as i64,
                2 => i16::from_le_bytes([field[0], field[1]]) as i64,
                4 => i32::from_le_bytes([field[0], field[1], field[2], field[3]]) as i64,
                _ => i64::from_le_bytes(bytes),
            };
            prop_assert_eq!(sign_extend(field), expected);
        }

        #[test]
        fn relative_identity(address in 0x1000u64 .. 0x7fff_0000_0000, rel in any::<i32>()) {
            let target = address.wrapping_add(5).wrapping_add(rel as i64 as u64);
            prop_assume!(target < i64::MAX as u64);

            let mut bytes = vec![0xe9];
            bytes.extend_from_slice(&rel.to_le_bytes());
            let jmp = decoded(address, &bytes, vec![Operand::Immediate(target)],
                              imm(1, 4), vec![Group::Jump, Group::BranchRelative]);

            let inst = classify(&jmp).unwrap();
            prop_assert_eq!(inst.displacement, Displacement::Relative(rel as i64));
            prop_assert_eq!(inst.destination(), Some(target));
        }
    }
}
