//! Decoded CIL instructions and the opcode table.
//!
//! [`OPCODES`] is the single source of truth for every opcode this crate understands: its
//! mnemonic, encoding, operand layout and control-flow behavior. The decoder, the encoder
//! and the execution host all look instructions up here.

use std::fmt;

use crate::{assembly::opcodes::*, metadata::token::Token};

/// Layout of the operand that follows an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer (short argument/local index)
    UInt8,
    /// Unsigned 16-bit integer (long argument/local index)
    UInt16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 64-bit floating point
    Float64,
    /// Metadata token reference
    Token,
    /// Signed 8-bit branch displacement
    ShortTarget,
    /// Signed 32-bit branch displacement
    Target,
}

impl OperandType {
    /// Returns the size in bytes of this operand type.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            OperandType::None => 0,
            OperandType::Int8 | OperandType::UInt8 | OperandType::ShortTarget => 1,
            OperandType::UInt16 => 2,
            OperandType::Int32 | OperandType::Token | OperandType::Target => 4,
            OperandType::Int64 | OperandType::Float64 => 8,
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Exception throwing
    Throw,
}

/// Static description of one opcode.
#[derive(Debug, PartialEq)]
pub struct OpCodeInfo {
    /// Mnemonic as written in IL assembly
    pub mnemonic: &'static str,
    /// `0xFE` for two-byte opcodes, `0` otherwise
    pub prefix: u8,
    /// The (second) opcode byte
    pub code: u8,
    /// Operand layout
    pub operand: OperandType,
    /// Control-flow behavior
    pub flow: FlowType,
}

impl OpCodeInfo {
    /// Encoded size of the opcode itself.
    #[must_use]
    pub fn opcode_size(&self) -> u32 {
        if self.prefix == 0 {
            1
        } else {
            2
        }
    }

    /// Whether this opcode branches.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.operand,
            OperandType::ShortTarget | OperandType::Target
        )
    }

    /// The long-form equivalent of a short branch, or `self` for everything else.
    #[must_use]
    pub fn long_form(&'static self) -> &'static OpCodeInfo {
        if self.operand != OperandType::ShortTarget {
            return self;
        }

        let long = match self.code {
            BR_S => BR,
            BRFALSE_S => BRFALSE,
            BRTRUE_S => BRTRUE,
            BEQ_S => BEQ,
            BGE_S => BGE,
            BGT_S => BGT,
            BLE_S => BLE,
            BLT_S => BLT,
            BNE_UN_S => BNE_UN,
            _ => return self,
        };

        lookup_opcode(0, long).unwrap_or(self)
    }
}

macro_rules! op {
    ($mnemonic:expr, FE $code:expr, $operand:ident, $flow:ident) => {
        OpCodeInfo {
            mnemonic: $mnemonic,
            prefix: FE_PREFIX,
            code: $code,
            operand: OperandType::$operand,
            flow: FlowType::$flow,
        }
    };
    ($mnemonic:expr, $code:expr, $operand:ident, $flow:ident) => {
        OpCodeInfo {
            mnemonic: $mnemonic,
            prefix: 0,
            code: $code,
            operand: OperandType::$operand,
            flow: FlowType::$flow,
        }
    };
}

/// Every opcode understood by this crate.
pub static OPCODES: &[OpCodeInfo] = &[
    op!("nop", NOP, None, Sequential),
    op!("ldarg.0", LDARG_0, None, Sequential),
    op!("ldarg.1", LDARG_1, None, Sequential),
    op!("ldarg.2", LDARG_2, None, Sequential),
    op!("ldarg.3", LDARG_3, None, Sequential),
    op!("ldloc.0", LDLOC_0, None, Sequential),
    op!("ldloc.1", LDLOC_1, None, Sequential),
    op!("ldloc.2", LDLOC_2, None, Sequential),
    op!("ldloc.3", LDLOC_3, None, Sequential),
    op!("stloc.0", STLOC_0, None, Sequential),
    op!("stloc.1", STLOC_1, None, Sequential),
    op!("stloc.2", STLOC_2, None, Sequential),
    op!("stloc.3", STLOC_3, None, Sequential),
    op!("ldarg.s", LDARG_S, UInt8, Sequential),
    op!("starg.s", STARG_S, UInt8, Sequential),
    op!("ldloc.s", LDLOC_S, UInt8, Sequential),
    op!("stloc.s", STLOC_S, UInt8, Sequential),
    op!("ldnull", LDNULL, None, Sequential),
    op!("ldc.i4.m1", LDC_I4_M1, None, Sequential),
    op!("ldc.i4.0", LDC_I4_0, None, Sequential),
    op!("ldc.i4.1", LDC_I4_1, None, Sequential),
    op!("ldc.i4.2", LDC_I4_2, None, Sequential),
    op!("ldc.i4.3", LDC_I4_3, None, Sequential),
    op!("ldc.i4.4", LDC_I4_4, None, Sequential),
    op!("ldc.i4.5", LDC_I4_5, None, Sequential),
    op!("ldc.i4.6", LDC_I4_6, None, Sequential),
    op!("ldc.i4.7", LDC_I4_7, None, Sequential),
    op!("ldc.i4.8", LDC_I4_8, None, Sequential),
    op!("ldc.i4.s", LDC_I4_S, Int8, Sequential),
    op!("ldc.i4", LDC_I4, Int32, Sequential),
    op!("ldc.i8", LDC_I8, Int64, Sequential),
    op!("ldc.r8", LDC_R8, Float64, Sequential),
    op!("dup", DUP, None, Sequential),
    op!("pop", POP, None, Sequential),
    op!("call", CALL, Token, Call),
    op!("ret", RET, None, Return),
    op!("br.s", BR_S, ShortTarget, UnconditionalBranch),
    op!("brfalse.s", BRFALSE_S, ShortTarget, ConditionalBranch),
    op!("brtrue.s", BRTRUE_S, ShortTarget, ConditionalBranch),
    op!("beq.s", BEQ_S, ShortTarget, ConditionalBranch),
    op!("bge.s", BGE_S, ShortTarget, ConditionalBranch),
    op!("bgt.s", BGT_S, ShortTarget, ConditionalBranch),
    op!("ble.s", BLE_S, ShortTarget, ConditionalBranch),
    op!("blt.s", BLT_S, ShortTarget, ConditionalBranch),
    op!("bne.un.s", BNE_UN_S, ShortTarget, ConditionalBranch),
    op!("br", BR, Target, UnconditionalBranch),
    op!("brfalse", BRFALSE, Target, ConditionalBranch),
    op!("brtrue", BRTRUE, Target, ConditionalBranch),
    op!("beq", BEQ, Target, ConditionalBranch),
    op!("bge", BGE, Target, ConditionalBranch),
    op!("bgt", BGT, Target, ConditionalBranch),
    op!("ble", BLE, Target, ConditionalBranch),
    op!("blt", BLT, Target, ConditionalBranch),
    op!("bne.un", BNE_UN, Target, ConditionalBranch),
    op!("add", ADD, None, Sequential),
    op!("sub", SUB, None, Sequential),
    op!("mul", MUL, None, Sequential),
    op!("div", DIV, None, Sequential),
    op!("rem", REM, None, Sequential),
    op!("and", AND, None, Sequential),
    op!("or", OR, None, Sequential),
    op!("xor", XOR, None, Sequential),
    op!("neg", NEG, None, Sequential),
    op!("not", NOT, None, Sequential),
    op!("conv.i4", CONV_I4, None, Sequential),
    op!("conv.i8", CONV_I8, None, Sequential),
    op!("conv.r8", CONV_R8, None, Sequential),
    op!("callvirt", CALLVIRT, Token, Call),
    op!("ldstr", LDSTR, Token, Sequential),
    op!("newobj", NEWOBJ, Token, Call),
    op!("castclass", CASTCLASS, Token, Sequential),
    op!("isinst", ISINST, Token, Sequential),
    op!("throw", THROW, None, Throw),
    op!("ldfld", LDFLD, Token, Sequential),
    op!("stfld", STFLD, Token, Sequential),
    op!("ldsfld", LDSFLD, Token, Sequential),
    op!("stsfld", STSFLD, Token, Sequential),
    op!("box", BOX, Token, Sequential),
    op!("newarr", NEWARR, Token, Sequential),
    op!("ldlen", LDLEN, None, Sequential),
    op!("ldelem.ref", LDELEM_REF, None, Sequential),
    op!("stelem.ref", STELEM_REF, None, Sequential),
    op!("unbox.any", UNBOX_ANY, Token, Sequential),
    op!("ldtoken", LDTOKEN, Token, Sequential),
    op!("ceq", FE FE_CEQ, None, Sequential),
    op!("cgt", FE FE_CGT, None, Sequential),
    op!("clt", FE FE_CLT, None, Sequential),
    op!("ldarg", FE FE_LDARG, UInt16, Sequential),
    op!("starg", FE FE_STARG, UInt16, Sequential),
    op!("ldloc", FE FE_LDLOC, UInt16, Sequential),
    op!("stloc", FE FE_STLOC, UInt16, Sequential),
];

/// Find an opcode by its encoding.
#[must_use]
pub fn lookup_opcode(prefix: u8, code: u8) -> Option<&'static OpCodeInfo> {
    OPCODES
        .iter()
        .find(|info| info.prefix == prefix && info.code == code)
}

/// Find an opcode by its mnemonic.
#[must_use]
pub fn lookup_mnemonic(mnemonic: &str) -> Option<&'static OpCodeInfo> {
    OPCODES.iter().find(|info| info.mnemonic == mnemonic)
}

/// Immediate value embedded in an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit integer
    Int8(i8),
    /// Signed 32-bit integer
    Int32(i32),
    /// Signed 64-bit integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
}

/// Decoded operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Absolute branch target offset within the method body
    Target(u32),
    /// Metadata token reference
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Method argument index
    Argument(u16),
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the first opcode byte within the method body
    pub offset: u32,
    /// Encoded size in bytes, operand included
    pub size: u32,
    /// The opcode
    pub info: &'static OpCodeInfo,
    /// The decoded operand
    pub operand: Operand,
}

impl Instruction {
    /// The mnemonic, e.g. `call`.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.info.mnemonic
    }

    /// Control-flow behavior.
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        self.info.flow
    }

    /// Offset of the instruction that follows this one.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size
    }

    /// Whether this is a (short or long) branch.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.info.is_branch()
    }

    /// Absolute branch target, if this is a branch.
    #[must_use]
    pub fn branch_target(&self) -> Option<u32> {
        match self.operand {
            Operand::Target(target) => Some(target),
            _ => None,
        }
    }

    /// Token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Whether this is `call` or `callvirt`.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.info.prefix == 0 && matches!(self.info.code, CALL | CALLVIRT)
    }

    /// Whether this is `newobj`.
    #[must_use]
    pub fn is_newobj(&self) -> bool {
        self.info.prefix == 0 && self.info.code == NEWOBJ
    }

    /// Argument index for `ldarg*`/`starg*`.
    #[must_use]
    pub fn argument_index(&self) -> Option<u16> {
        if self.info.prefix == 0 {
            match self.info.code {
                LDARG_0 => return Some(0),
                LDARG_1 => return Some(1),
                LDARG_2 => return Some(2),
                LDARG_3 => return Some(3),
                _ => {}
            }
        }
        match self.operand {
            Operand::Argument(index) => Some(index),
            _ => None,
        }
    }

    /// Local index for `ldloc*`/`stloc*`.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        if self.info.prefix == 0 {
            match self.info.code {
                LDLOC_0 | STLOC_0 => return Some(0),
                LDLOC_1 | STLOC_1 => return Some(1),
                LDLOC_2 | STLOC_2 => return Some(2),
                LDLOC_3 | STLOC_3 => return Some(3),
                _ => {}
            }
        }
        match self.operand {
            Operand::Local(index) => Some(index),
            _ => None,
        }
    }

    /// The constant pushed by an `ldc.i4*` instruction.
    #[must_use]
    pub fn constant_i4(&self) -> Option<i32> {
        if self.info.prefix != 0 {
            return None;
        }
        match self.info.code {
            LDC_I4_M1 => Some(-1),
            code @ LDC_I4_0..=LDC_I4_8 => Some(i32::from(code - LDC_I4_0)),
            LDC_I4_S | LDC_I4 => match self.operand {
                Operand::Immediate(Immediate::Int8(value)) => Some(i32::from(value)),
                Operand::Immediate(Immediate::Int32(value)) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.info.mnemonic)?;
        match self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(Immediate::Int8(value)) => write!(f, " {value}"),
            Operand::Immediate(Immediate::Int32(value)) => write!(f, " {value}"),
            Operand::Immediate(Immediate::Int64(value)) => write!(f, " {value}"),
            Operand::Immediate(Immediate::Float64(value)) => write!(f, " {value}"),
            Operand::Target(target) => write!(f, " IL_{target:04x}"),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Local(index) => write!(f, " V_{index}"),
            Operand::Argument(index) => write!(f, " A_{index}"),
        }
    }
}
