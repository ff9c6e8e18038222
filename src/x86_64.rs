//! Decoding of `x86_64` instructions.

use std::fmt::{self, Display, Formatter};
use byteorder::{ByteOrder, LittleEndian};

use crate::decode::{Decoder, DecodedInstruction, Encoding, Group, Operand};
use crate::helper::SignedHex;
use DataWidth::*;


/// The built-in decoder for 64-bit code.
///
/// Instruction lengths come from the `lde` length disassembler. The prefixes,
/// opcode and ModR/M bytes are then decoded just far enough to locate branch
/// offsets, memory displacements and immediates. Mnemonics are only known for
/// a small set of common instructions, everything else is listed as `db`.
#[derive(Debug, Default, Copy, Clone)]
pub struct X64Decoder;

impl X64Decoder {
    /// Create a new decoder.
    pub fn new() -> X64Decoder {
        X64Decoder
    }

    /// The byte length of the first instruction in the given slice if it is
    /// valid and completely contained in the slice.
    pub fn length(bytes: &[u8]) -> Option<usize> {
        // Pad with zeros so that the length decoder never looks past the slice.
        let mut window = [0u8; 16];
        let available = bytes.len().min(window.len());
        window[.. available].copy_from_slice(&bytes[.. available]);

        let len = lde::X64.ld(&window[..]) as usize;
        if len == 0 || len > available {
            None
        } else {
            Some(len)
        }
    }
}

impl Decoder for X64Decoder {
    fn ip_register(&self) -> Register {
        Register::RIP
    }

    fn decode(&mut self, bytes: &[u8], ip: u64) -> Option<DecodedInstruction> {
        let len = X64Decoder::length(bytes)?;
        Scanner::new(&bytes[.. len], ip).scan()
    }
}

/// Walks over the bytes of a single instruction of known length.
#[derive(Debug, Clone)]
struct Scanner<'a> {
    bytes: &'a [u8],
    ip: u64,
    index: usize,
}

impl<'a> Scanner<'a> {
    /// Create a new scanner.
    fn new(bytes: &'a [u8], ip: u64) -> Scanner<'a> {
        Scanner { bytes, ip, index: 0 }
    }

    /// Decodes the bytes into an instruction.
    fn scan(mut self) -> Option<DecodedInstruction> {
        self.skip_legacy_prefixes();
        let rex = self.decode_rex();
        let opcode = self.decode_opcode()?;

        // The instruction extension (0 - 7) lives in the reg field of ModR/M.
        let ext = if opcode.has_modrm() {
            self.bytes.get(self.index).map(|byte| (byte & 0b00111000) >> 3)
        } else {
            None
        };

        let len = self.bytes.len();
        let mnemonic = Mnemonic::from_opcode(opcode, ext, rex);
        let mut encoding = Encoding::default();
        let mut operands = Vec::new();
        let mut texts = Vec::new();

        if opcode.relative_branch().is_some() {
            // The offset always spans the rest of the instruction.
            let offset = self.index;
            let size = len - offset;
            if size == 0 || size > 4 {
                return None;
            }

            let rel = LittleEndian::read_int(&self.bytes[offset ..], size);
            let target = self.ip.wrapping_add(len as u64).wrapping_add(rel as u64);
            encoding.imm_offset = offset as u8;
            encoding.imm_size = size as u8;
            operands.push(Operand::Immediate(target));
            texts.push(format!("{:#x}", target));

        } else if opcode.has_modrm() {
            let width = if let Some(width) = opcode.source_width() {
                width
            } else if opcode.byte_operands() {
                N8
            } else if rex.w || opcode.defaults_to_64(ext) {
                N64
            } else {
                N32
            };
            let rm = self.decode_modrm_operand(rex, width, &mut encoding)?;

            // Intel order: destination first.
            let reg_width = if opcode.byte_operands() { N8 } else if rex.w { N64 } else { N32 };
            let reg = ext.map(|bits| Register::from_bits(rex.r, bits, reg_width));
            let (first, second) = match (opcode.reg_is_destination(), reg) {
                (Some(true), Some(reg)) => ((Operand::Register(reg), reg.to_string()), Some(rm)),
                (Some(false), Some(reg)) => (rm, Some((Operand::Register(reg), reg.to_string()))),
                _ => (rm, None),
            };
            for (operand, text) in std::iter::once(first).chain(second) {
                operands.push(operand);
                texts.push(text);
            }

            // 3DNow! places an opcode byte where the immediate would be.
            if self.index < len && opcode.map != OpcodeMap::Amd3DNow {
                let size = len - self.index;
                encoding.imm_offset = self.index as u8;
                encoding.imm_size = size as u8;
                let value = self.decode_unsigned_value(size)?;
                operands.push(Operand::Immediate(value));
                texts.push(format!("{:#x}", value));
            }

        } else {
            if let Some(reg) = opcode.plus_register(rex) {
                operands.push(Operand::Register(reg));
                texts.push(reg.to_string());
            }

            if self.index < len {
                let size = len - self.index;
                encoding.imm_offset = self.index as u8;
                encoding.imm_size = size as u8;
                let value = self.decode_unsigned_value(size)?;
                operands.push(Operand::Immediate(value));
                texts.push(format!("{:#x}", value));
            }
        }

        let operand_text = if mnemonic == Mnemonic::Unknown {
            self.bytes.iter()
                .map(|byte| format!("{:#04x}", byte))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            texts.join(", ")
        };

        Some(DecodedInstruction {
            address: self.ip,
            bytes: self.bytes.to_vec(),
            mnemonic: mnemonic.to_string(),
            operand_text,
            operands,
            encoding,
            groups: opcode.groups(ext),
        })
    }

    /// Returns the byte at the current position and advances.
    fn next(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.index)?;
        self.index += 1;
        Some(byte)
    }

    /// Skips over operand-size, address-size, segment, lock and rep prefixes.
    fn skip_legacy_prefixes(&mut self) {
        while let Some(&byte) = self.bytes.get(self.index) {
            match byte {
                0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 |
                0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3 => self.index += 1,
                _ => break,
            }
        }
    }

    /// Decodes the REX prefix.
    fn decode_rex(&mut self) -> RexPrefix {
        let byte = match self.bytes.get(self.index) {
            Some(&byte) => byte,
            None => return RexPrefix::default(),
        };

        let rex = (byte ^ 0b01000000) < 16;
        if rex {
            self.index += 1;
        }

        RexPrefix {
            w: rex && (byte & 0b00001000 > 0),
            r: rex && (byte & 0b00000100 > 0),
            x: rex && (byte & 0b00000010 > 0),
            b: rex && (byte & 0b00000001 > 0),
        }
    }

    /// Decodes the opcode, including escape bytes and VEX/EVEX payloads.
    fn decode_opcode(&mut self) -> Option<Opcode> {
        use OpcodeMap::*;

        let opcode = match self.next()? {
            0x0f => match self.next()? {
                0x38 => Opcode { map: Escape38, byte: self.next()? },
                0x3a => Opcode { map: Escape3A, byte: self.next()? },
                // The real 3DNow! opcode trails the operands.
                0x0f => Opcode { map: Amd3DNow, byte: 0x0f },
                byte => Opcode { map: Secondary, byte },
            },
            0xc5 => {
                self.next()?;
                Opcode { map: Vex(1), byte: self.next()? }
            }
            0xc4 => {
                let payload = self.next()?;
                self.next()?;
                Opcode { map: Vex(payload & 0b00011111), byte: self.next()? }
            }
            0x62 => {
                let payload = self.next()?;
                self.next()?;
                self.next()?;
                Opcode { map: Vex(payload & 0b00000011), byte: self.next()? }
            }
            byte => Opcode { map: Primary, byte },
        };

        Some(opcode)
    }

    /// Decodes the ModR/M byte with SIB and displacement into the r/m
    /// operand and records the displacement field in the encoding.
    fn decode_modrm_operand(&mut self, rex: RexPrefix, width: DataWidth, encoding: &mut Encoding)
    -> Option<(Operand, String)> {
        let (modus, _, rm) = self.decode_modrm()?;

        if modus == 0b11 {
            let reg = Register::from_bits(rex.b, rm, width);
            return Some((Operand::Register(reg), reg.to_string()));
        }

        let mut disp_size = match modus {
            0b01 => 1,
            0b10 => 4,
            _ => 0,
        };

        // Check if we use SIB, RIP-relative or plain R/M.
        let mut scaled_offset = None;
        let base = if rm == 0b100 {
            let (scale, index, base) = self.decode_sib()?;
            if index != 0b100 || rex.x {
                scaled_offset = Some((Register::from_bits(rex.x, index, N64), scale));
            }
            if modus == 0b00 && base == 0b101 {
                disp_size = 4;
                None
            } else {
                Some(Register::from_bits(rex.b, base, N64))
            }
        } else if modus == 0b00 && rm == 0b101 {
            disp_size = 4;
            Some(Register::RIP)
        } else {
            Some(Register::from_bits(rex.b, rm, N64))
        };

        let mut text = String::from("[");
        if let Some(base) = base {
            text.push_str(&base.to_string());
        }
        if let Some((index, scale)) = scaled_offset {
            if base.is_some() {
                text.push('+');
            }
            text.push_str(&format!("{}*{}", index, scale));
        }

        if disp_size > 0 {
            encoding.disp_offset = self.index as u8;
            encoding.disp_size = disp_size as u8;
            let disp = self.decode_signed_value(disp_size)?;
            if base.is_some() || scaled_offset.is_some() {
                text.push_str(&SignedHex(disp).to_string());
            } else {
                text.push_str(&format!("{:#x}", disp as u32));
            }
        }
        text.push(']');

        Some((Operand::Memory { base }, text))
    }

    /// Decodes the ModR/M byte and returns a (modus, reg, rm) triple.
    fn decode_modrm(&mut self) -> Option<(u8, u8, u8)> {
        let byte = self.next()?;
        let modus = byte >> 6;
        let reg = (byte & 0b00111000) >> 3;
        let rm = byte & 0b00000111;
        Some((modus, reg, rm))
    }

    /// Decodes the SIB byte and returns a (scale, index, base) triple with
    /// the raw index and base bits.
    fn decode_sib(&mut self) -> Option<(u8, u8, u8)> {
        let byte = self.next()?;
        let scale = 2u8.pow((byte >> 6) as u32);
        let index = (byte & 0b00111000) >> 3;
        let base = byte & 0b00000111;
        Some((scale, index, base))
    }

    /// Decode a variable width unsigned value.
    fn decode_unsigned_value(&mut self, size: usize) -> Option<u64> {
        let bytes = self.bytes.get(self.index .. self.index + size)?;
        if size == 0 || size > 8 {
            return None;
        }
        self.index += size;
        Some(LittleEndian::read_uint(bytes, size))
    }

    /// Decode a variable width signed value.
    fn decode_signed_value(&mut self, size: usize) -> Option<i64> {
        let bytes = self.bytes.get(self.index .. self.index + size)?;
        if size == 0 || size > 8 {
            return None;
        }
        self.index += size;
        Some(LittleEndian::read_int(bytes, size))
    }
}

/// A REX prefix.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
struct RexPrefix {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

/// Which opcode table an opcode byte belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum OpcodeMap {
    Primary,
    Secondary,
    Escape38,
    Escape3A,
    Amd3DNow,
    /// VEX or EVEX encoded with the given map select.
    Vex(u8),
}

/// An opcode byte within its table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Opcode {
    map: OpcodeMap,
    byte: u8,
}

impl Opcode {
    /// Whether a ModR/M byte follows the opcode.
    fn has_modrm(self) -> bool {
        use OpcodeMap::*;
        match self.map {
            Primary => matches!(self.byte,
                0x00 ..= 0x03 | 0x08 ..= 0x0b | 0x10 ..= 0x13 | 0x18 ..= 0x1b |
                0x20 ..= 0x23 | 0x28 ..= 0x2b | 0x30 ..= 0x33 | 0x38 ..= 0x3b |
                0x63 | 0x69 | 0x6b | 0x80 ..= 0x8f | 0xc0 | 0xc1 | 0xc6 | 0xc7 |
                0xd0 ..= 0xd3 | 0xd8 ..= 0xdf | 0xf6 | 0xf7 | 0xfe | 0xff),
            Secondary => matches!(self.byte,
                0x00 ..= 0x03 | 0x0d | 0x10 ..= 0x23 | 0x28 ..= 0x2f |
                0x40 ..= 0x76 | 0x78 ..= 0x7f | 0x90 ..= 0x9f | 0xa3 ..= 0xa5 |
                0xab ..= 0xc7 | 0xd0 ..= 0xff),
            Escape38 | Escape3A | Amd3DNow => true,
            // Only vzeroupper/vzeroall go without one.
            Vex(map) => !(map == 1 && self.byte == 0x77),
        }
    }

    /// The group of the instruction if it is a jump or call with an offset
    /// relative to the next instruction.
    fn relative_branch(self) -> Option<Group> {
        use OpcodeMap::*;
        match (self.map, self.byte) {
            (Primary, 0x70 ..= 0x7f) | (Primary, 0xe0 ..= 0xe3) |
            (Primary, 0xe9) | (Primary, 0xeb) | (Secondary, 0x80 ..= 0x8f) => Some(Group::Jump),
            (Primary, 0xe8) => Some(Group::Call),
            _ => None,
        }
    }

    /// Whether the ModR/M reg field names a register operand and if so,
    /// whether that register is the destination.
    fn reg_is_destination(self) -> Option<bool> {
        use OpcodeMap::*;
        match (self.map, self.byte) {
            // The direction bit selects the destination.
            (Primary, 0x00 ..= 0x3f) if self.byte & 0b111 < 4 => Some(self.byte & 0b10 != 0),
            (Primary, 0x88 ..= 0x8b) => Some(self.byte & 0b10 != 0),
            (Primary, 0x84) | (Primary, 0x85) | (Primary, 0x86) | (Primary, 0x87) => Some(false),
            (Primary, 0x63) | (Primary, 0x69) | (Primary, 0x6b) | (Primary, 0x8d) => Some(true),
            (Secondary, 0xaf) | (Secondary, 0xb6) | (Secondary, 0xb7) |
            (Secondary, 0xbe) | (Secondary, 0xbf) => Some(true),
            _ => None,
        }
    }

    /// The fixed width of the r/m source of sign and zero extending moves.
    fn source_width(self) -> Option<DataWidth> {
        match (self.map, self.byte) {
            (OpcodeMap::Secondary, 0xb6) | (OpcodeMap::Secondary, 0xbe) => Some(N8),
            (OpcodeMap::Secondary, 0xb7) | (OpcodeMap::Secondary, 0xbf) => Some(N16),
            (OpcodeMap::Primary, 0x63) => Some(N32),
            _ => None,
        }
    }

    /// Whether the operands are a single byte wide.
    fn byte_operands(self) -> bool {
        match (self.map, self.byte) {
            (OpcodeMap::Primary, 0x00 ..= 0x3f) => self.byte & 0b111 < 4 && self.byte & 1 == 0,
            (OpcodeMap::Primary, byte) => matches!(byte,
                0x80 | 0x82 | 0x84 | 0x86 | 0x88 | 0x8a | 0xc0 | 0xc6 | 0xd0 | 0xd2 | 0xf6 | 0xfe),
            _ => false,
        }
    }

    /// Whether the operand size is 64 bits even without `REX.W`.
    fn defaults_to_64(self, ext: Option<u8>) -> bool {
        match (self.map, self.byte, ext) {
            (OpcodeMap::Primary, 0xff, Some(2)) | (OpcodeMap::Primary, 0xff, Some(4)) |
            (OpcodeMap::Primary, 0xff, Some(6)) | (OpcodeMap::Primary, 0x8f, Some(0)) => true,
            _ => false,
        }
    }

    /// The register encoded in the low bits of push/pop/mov-immediate opcodes.
    fn plus_register(self, rex: RexPrefix) -> Option<Register> {
        if self.map != OpcodeMap::Primary {
            return None;
        }
        match self.byte {
            0x50 ..= 0x5f => Some(Register::from_bits(rex.b, self.byte & 0b111, N64)),
            0xb8 ..= 0xbf => {
                let width = if rex.w { N64 } else { N32 };
                Some(Register::from_bits(rex.b, self.byte & 0b111, width))
            }
            _ => None,
        }
    }

    /// The groups this instruction belongs to.
    fn groups(self, ext: Option<u8>) -> Vec<Group> {
        use OpcodeMap::*;

        let mut groups = Vec::new();
        if let Some(group) = self.relative_branch() {
            groups.push(group);
            groups.push(Group::BranchRelative);
        }

        match (self.map, self.byte, ext) {
            (Primary, 0xff, Some(2)) | (Primary, 0xff, Some(3)) => groups.push(Group::Call),
            (Primary, 0xff, Some(4)) | (Primary, 0xff, Some(5)) => groups.push(Group::Jump),
            (Primary, 0xc2, _) | (Primary, 0xc3, _) |
            (Primary, 0xca, _) | (Primary, 0xcb, _) => groups.push(Group::Ret),
            (Primary, 0xcc, _) | (Primary, 0xcd, _) | (Primary, 0xf1, _) => groups.push(Group::Int),
            _ => {}
        }

        groups
    }
}

/// Identifies an instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Mnemonic {
    Add, Sub, Imul,
    Mov, Movzx, Movsx, Movsxd, Lea,
    Push, Pop,
    Jo, Jno, Jb, Jae, Je, Jne, Jbe, Ja, Js, Jns, Jp, Jnp, Jl, Jge, Jle, Jg,
    Jmp, Jrcxz, Loop, Loope, Loopne,
    Call, Leave, Ret,
    Cmp, Test,
    Int3, Syscall,
    Nop,
    /// Not known to this decoder.
    Unknown,
}

/// Conditional jumps in the order of their condition codes.
const CONDITIONAL: [Mnemonic; 16] = {
    use Mnemonic::*;
    [Jo, Jno, Jb, Jae, Je, Jne, Jbe, Ja, Js, Jns, Jp, Jnp, Jl, Jge, Jle, Jg]
};

impl Mnemonic {
    /// Finds the mnemonic of an opcode.
    fn from_opcode(opcode: Opcode, ext: Option<u8>, rex: RexPrefix) -> Mnemonic {
        use Mnemonic::*;
        use OpcodeMap::*;

        match (opcode.map, opcode.byte, ext) {
            (Primary, 0x00 ..= 0x05, _) => Add,
            (Primary, 0x28 ..= 0x2d, _) => Sub,
            (Primary, 0x38 ..= 0x3d, _) => Cmp,
            (Primary, 0x80 ..= 0x83, Some(0)) => Add,
            (Primary, 0x80 ..= 0x83, Some(5)) => Sub,
            (Primary, 0x80 ..= 0x83, Some(7)) => Cmp,
            (Primary, 0x84, _) | (Primary, 0x85, _) |
            (Primary, 0xa8, _) | (Primary, 0xa9, _) => Test,
            (Primary, 0x88 ..= 0x8b, _) | (Primary, 0xb0 ..= 0xbf, _) |
            (Primary, 0xc6, Some(0)) | (Primary, 0xc7, Some(0)) => Mov,
            (Primary, 0x63, _) => Movsxd,
            (Primary, 0x8d, _) => Lea,

            (Primary, 0x50 ..= 0x57, _) | (Primary, 0xff, Some(6)) => Push,
            (Primary, 0x58 ..= 0x5f, _) => Pop,

            (Primary, 0x70 ..= 0x7f, _) => CONDITIONAL[(opcode.byte - 0x70) as usize],
            (Secondary, 0x80 ..= 0x8f, _) => CONDITIONAL[(opcode.byte - 0x80) as usize],
            (Primary, 0xe0, _) => Loopne,
            (Primary, 0xe1, _) => Loope,
            (Primary, 0xe2, _) => Loop,
            (Primary, 0xe3, _) => Jrcxz,
            (Primary, 0xe9, _) | (Primary, 0xeb, _) | (Primary, 0xff, Some(4)) => Jmp,
            (Primary, 0xe8, _) | (Primary, 0xff, Some(2)) => Call,
            (Primary, 0xc2, _) | (Primary, 0xc3, _) => Ret,
            (Primary, 0xc9, _) => Leave,

            (Primary, 0x90, _) if !rex.b => Nop,
            (Secondary, 0x1f, Some(0)) => Nop,
            (Primary, 0xcc, _) => Int3,
            (Secondary, 0x05, _) => Syscall,
            (Secondary, 0xaf, _) => Imul,
            (Secondary, 0xb6, _) | (Secondary, 0xb7, _) => Movzx,
            (Secondary, 0xbe, _) | (Secondary, 0xbf, _) => Movsx,

            _ => Unknown,
        }
    }
}

impl Display for Mnemonic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Mnemonic::Unknown => write!(f, "db"),
            _ => write!(f, "{}", format!("{:?}", self).to_lowercase()),
        }
    }
}

/// Identifies a register.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Register {
    RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI,
    EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI,
    AX, CX, DX, BX, SP, BP, SI, DI,
    AL, CL, DL, BL, AH, CH, DH, BH,
    R8, R9, R10, R11, R12, R13, R14, R15,
    IP, EIP, RIP,
}

impl Display for Register {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

impl Register {
    /// Decodes the register from the bit pattern in the instruction.
    fn from_bits(alt: bool, reg: u8, width: DataWidth) -> Register {
        use Register::*;
        match (alt, reg & 0b111) {
            (false, 0b000) => [AL, AX, EAX, RAX][width as usize],
            (false, 0b001) => [CL, CX, ECX, RCX][width as usize],
            (false, 0b010) => [DL, DX, EDX, RDX][width as usize],
            (false, 0b011) => [BL, BX, EBX, RBX][width as usize],
            (false, 0b100) => [AH, SP, ESP, RSP][width as usize],
            (false, 0b101) => [CH, BP, EBP, RBP][width as usize],
            (false, 0b110) => [DH, SI, ESI, RSI][width as usize],
            (false, _)     => [BH, DI, EDI, RDI][width as usize],
            (true, 0b000)  => R8,
            (true, 0b001)  => R9,
            (true, 0b010)  => R10,
            (true, 0b011)  => R11,
            (true, 0b100)  => R12,
            (true, 0b101)  => R13,
            (true, 0b110)  => R14,
            (true, _)      => R15,
        }
    }
}

/// Width of data in bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataWidth {
    N8 = 0,
    N16 = 1,
    N32 = 2,
    N64 = 3,
}
