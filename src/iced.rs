//! Decoder backend on top of `iced-x86`.
//!
//! Supports 16, 32 and 64-bit code and formats instructions in Intel syntax.

use iced_x86::{
    ConstantOffsets, DecoderOptions, FlowControl, Formatter, IntelFormatter,
    Instruction as IcedInstruction, OpKind, Register as IcedRegister,
};

use crate::decode::{Bitness, Decoder, DecodedInstruction, Encoding, Group, Operand};
use crate::x86_64::Register;


/// Decodes instructions with `iced-x86`.
pub struct IcedDecoder {
    bitness: Bitness,
    formatter: IntelFormatter,
}

impl IcedDecoder {
    /// Create a decoder for code of the given bitness.
    pub fn new(bitness: Bitness) -> IcedDecoder {
        IcedDecoder {
            bitness,
            formatter: IntelFormatter::new(),
        }
    }
}

impl Default for IcedDecoder {
    fn default() -> IcedDecoder {
        IcedDecoder::new(Bitness::Bits64)
    }
}

impl std::fmt::Debug for IcedDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("IcedDecoder").field("bitness", &self.bitness).finish()
    }
}

impl Decoder for IcedDecoder {
    fn ip_register(&self) -> Register {
        self.bitness.ip_register()
    }

    fn decode(&mut self, bytes: &[u8], ip: u64) -> Option<DecodedInstruction> {
        if bytes.is_empty() {
            return None;
        }

        let mut decoder = iced_x86::Decoder::with_ip(self.bitness.bits(), bytes, ip, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return None;
        }

        let offsets = decoder.get_constant_offsets(&instruction);
        let operands: Vec<Operand> = (0 .. instruction.op_count())
            .map(|i| operand(&instruction, i))
            .collect();

        let mut mnemonic = String::new();
        self.formatter.format_mnemonic(&instruction, &mut mnemonic);
        let mut operand_text = String::new();
        self.formatter.format_all_operands(&instruction, &mut operand_text);

        Some(DecodedInstruction {
            address: ip,
            bytes: bytes[.. instruction.len()].to_vec(),
            mnemonic,
            operand_text,
            operands,
            encoding: encoding(&instruction, &offsets),
            groups: groups(&instruction),
        })
    }
}

/// Whether the operand is a branch target.
fn is_branch(kind: OpKind) -> bool {
    matches!(kind,
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 |
        OpKind::FarBranch16 | OpKind::FarBranch32)
}

/// Converts one operand.
fn operand(instruction: &IcedInstruction, index: u32) -> Operand {
    match instruction.op_kind(index) {
        OpKind::Register => match register(instruction.op_register(index)) {
            Some(reg) => Operand::Register(reg),
            None => Operand::Other,
        },
        OpKind::Memory => Operand::Memory { base: register(instruction.memory_base()) },
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Operand::Immediate(instruction.near_branch_target())
        }
        OpKind::FarBranch16 => Operand::Immediate(instruction.far_branch16() as u64),
        OpKind::FarBranch32 => Operand::Immediate(instruction.far_branch32() as u64),
        OpKind::Immediate8 | OpKind::Immediate16 | OpKind::Immediate32 | OpKind::Immediate64 |
        OpKind::Immediate8to16 | OpKind::Immediate8to32 | OpKind::Immediate8to64 |
        OpKind::Immediate32to64 => Operand::Immediate(instruction.immediate(index)),
        _ => Operand::Other,
    }
}

/// Locates the displacement and immediate fields.
///
/// Branch offsets are reported as the immediate field; older `iced-x86`
/// versions list them as displacement instead.
fn encoding(instruction: &IcedInstruction, offsets: &ConstantOffsets) -> Encoding {
    let mut encoding = Encoding::default();

    if offsets.has_displacement() {
        encoding.disp_offset = offsets.displacement_offset() as u8;
        encoding.disp_size = offsets.displacement_size() as u8;
    }

    if offsets.has_immediate() {
        encoding.imm_offset = offsets.immediate_offset() as u8;
        encoding.imm_size = offsets.immediate_size() as u8;
    } else if offsets.has_displacement() && is_branch(instruction.op0_kind()) {
        encoding.imm_offset = encoding.disp_offset;
        encoding.imm_size = encoding.disp_size;
    }

    encoding
}

/// The groups the instruction belongs to.
fn groups(instruction: &IcedInstruction) -> Vec<Group> {
    let mut groups = Vec::new();
    match instruction.flow_control() {
        FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch |
        FlowControl::IndirectBranch => groups.push(Group::Jump),
        FlowControl::Call | FlowControl::IndirectCall => groups.push(Group::Call),
        FlowControl::Return => groups.push(Group::Ret),
        FlowControl::Interrupt => groups.push(Group::Int),
        _ => {}
    }

    if matches!(instruction.op0_kind(), OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64) {
        groups.push(Group::BranchRelative);
    }

    groups
}

/// Maps the registers this crate knows about.
fn register(reg: IcedRegister) -> Option<Register> {
    use IcedRegister as I;
    use Register::*;

    Some(match reg {
        I::RAX => RAX, I::RCX => RCX, I::RDX => RDX, I::RBX => RBX,
        I::RSP => RSP, I::RBP => RBP, I::RSI => RSI, I::RDI => RDI,
        I::EAX => EAX, I::ECX => ECX, I::EDX => EDX, I::EBX => EBX,
        I::ESP => ESP, I::EBP => EBP, I::ESI => ESI, I::EDI => EDI,
        I::AX => AX, I::CX => CX, I::DX => DX, I::BX => BX,
        I::SP => SP, I::BP => BP, I::SI => SI, I::DI => DI,
        I::AL => AL, I::CL => CL, I::DL => DL, I::BL => BL,
        I::AH => AH, I::CH => CH, I::DH => DH, I::BH => BH,
        I::R8 => R8, I::R9 => R9, I::R10 => R10, I::R11 => R11,
        I::R12 => R12, I::R13 => R13, I::R14 => R14, I::R15 => R15,
        I::EIP => EIP, I::RIP => RIP,
        _ => return None,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::Disassembler;
    use crate::instruction::Displacement;

    fn decode(bitness: Bitness, binary: &[u8], ip: u64) -> DecodedInstruction {
        IcedDecoder::new(bitness).decode(binary, ip).unwrap()
    }

    #[test]
    fn short_conditional_jump() {
        let je = decode(Bitness::Bits64, &[0x74, 0x05], 0x1000);
        assert_eq!(je.mnemonic, "je");
        assert_eq!(je.len(), 2);
        assert_eq!(je.operands, vec![Operand::Immediate(0x1007)]);
        assert_eq!(je.encoding.imm_offset, 1);
        assert_eq!(je.encoding.imm_size, 1);
        assert!(je.has_group(Group::Jump));
        assert!(je.has_group(Group::BranchRelative));
    }

    #[test]
    fn rip_relative_memory() {
        let mov = decode(Bitness::Bits64, &[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(mov.mnemonic, "mov");
        assert_eq!(mov.operands, vec![
            Operand::Register(Register::RAX),
            Operand::Memory { base: Some(Register::RIP) },
        ]);
        assert_eq!(mov.encoding.disp_offset, 3);
        assert_eq!(mov.encoding.disp_size, 4);
        assert!(mov.groups.is_empty());
    }

    #[test]
    fn calls() {
        let call = decode(Bitness::Bits64, &[0xe8, 0xfb, 0xff, 0xff, 0xff], 0x2000);
        assert_eq!(call.operands, vec![Operand::Immediate(0x2000)]);
        assert!(call.has_group(Group::Call));

        let indirect = decode(Bitness::Bits64, &[0xff, 0xd2], 0x2000);
        assert_eq!(indirect.operands, vec![Operand::Register(Register::RDX)]);
        assert!(indirect.has_group(Group::Call));
        assert!(!indirect.has_group(Group::BranchRelative));
    }

    #[test]
    fn returns_and_interrupts() {
        assert_eq!(decode(Bitness::Bits64, &[0xc3], 0x1000).groups, vec![Group::Ret]);
        assert_eq!(decode(Bitness::Bits64, &[0xcc], 0x1000).groups, vec![Group::Int]);
        assert_eq!(decode(Bitness::Bits32, &[0xcd, 0x80], 0x1000).groups, vec![Group::Int]);
    }

    #[test]
    fn invalid_and_truncated() {
        let mut decoder = IcedDecoder::default();
        assert!(decoder.decode(&[], 0x1000).is_none());
        assert!(decoder.decode(&[0xe8, 0x00, 0x00], 0x1000).is_none());
        assert!(decoder.decode(&[0x06], 0x1000).is_none());
    }

    #[test]
    fn ip_register_follows_bitness() {
        assert_eq!(IcedDecoder::new(Bitness::Bits64).ip_register(), Register::RIP);
        assert_eq!(IcedDecoder::new(Bitness::Bits32).ip_register(), Register::EIP);
        assert_eq!(IcedDecoder::new(Bitness::Bits16).ip_register(), Register::IP);
    }

    #[test]
    fn agrees_with_builtin_decoder() {
        let code = [
            0x55,                                       // push rbp
            0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00,   // mov rax, [rip+0x10]
            0x74, 0x02,                                 // je +0x2
            0xeb, 0xf2,                                 // jmp -0xe
            0xe8, 0xef, 0xff, 0xff, 0xff,               // call -0x11
            0xc3,                                       // ret
        ];

        let iced = Disassembler::new(IcedDecoder::default()).disassemble(0x1000, &code).unwrap();
        let builtin = Disassembler::new(crate::X64Decoder).disassemble(0x1000, &code).unwrap();

        assert_eq!(iced.instructions.len(), 6);
        for (a, b) in iced.instructions.iter().zip(&builtin.instructions) {
            assert_eq!(a.address, b.address);
            assert_eq!(a.bytes, b.bytes);
            assert_eq!(a.displacement, b.displacement);
            assert_eq!(a.displacement_offset, b.displacement_offset);
            assert_eq!(a.displacement_size, b.displacement_size);
        }
        assert_eq!(iced.branches, builtin.branches);
        assert_eq!(iced.instructions[2].displacement, Displacement::Relative(2));
    }
}
