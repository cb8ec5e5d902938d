//! CIL instruction decoding.
//!
//! [`decode_instruction`] turns the bytes at the parser's position into one [`Instruction`];
//! [`decode_stream`] decodes a complete method body and checks that every branch lands on an
//! instruction boundary, which the rewriter relies on when it re-labels the body.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotshim::{Parser, assembly::{decode_instruction, decode_stream}};
//!
//! let code = [0x2A]; // ret
//! let mut parser = Parser::new(&code);
//! let instr = decode_instruction(&mut parser)?;
//! assert_eq!(instr.mnemonic(), "ret");
//!
//! let code = [0x00, 0x2A]; // nop, ret
//! let instrs = decode_stream(&code)?;
//! assert_eq!(instrs.len(), 2);
//! # Ok::<(), dotshim::Error>(())
//! ```

use rustc_hash::FxHashSet;

use crate::{
    assembly::{
        instruction::{lookup_opcode, Immediate, Instruction, Operand, OperandType},
        opcodes::{FE_LDARG, FE_LDLOC, FE_PREFIX, FE_STARG, FE_STLOC, LDARG_S, STARG_S},
    },
    file::parser::Parser,
    metadata::token::Token,
    Result,
};

/// Decodes a complete method body.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if:
/// - The bytecode contains an opcode outside the supported set
/// - An operand is truncated
/// - A branch target does not fall on the start of a decoded instruction
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();

    while parser.has_more_data() {
        instructions.push(decode_instruction(&mut parser)?);
    }

    let boundaries: FxHashSet<u32> = instructions.iter().map(|instr| instr.offset).collect();
    for instruction in &instructions {
        if let Some(target) = instruction.branch_target() {
            if !boundaries.contains(&target) {
                return Err(malformed_error!(
                    "Branch at IL_{:04x} targets IL_{:04x}, which is not an instruction boundary",
                    instruction.offset,
                    target
                ));
            }
        }
    }

    Ok(instructions)
}

/// Decodes a single CIL instruction from the current parser position.
///
/// Branch displacements are converted into absolute offsets, and argument/local indices
/// are reported through [`Operand::Argument`] / [`Operand::Local`] regardless of the
/// short or long encoding.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for an unknown opcode, [`crate::Error::OutOfBounds`]
/// when the operand is truncated.
pub fn decode_instruction(parser: &mut Parser) -> Result<Instruction> {
    let offset = u32::try_from(parser.pos())
        .map_err(|_| malformed_error!("Method body exceeds u32 range"))?;
    let first_byte = parser.read_le::<u8>()?;

    let info = if first_byte == FE_PREFIX {
        let second_byte = parser.read_le::<u8>()?;
        lookup_opcode(FE_PREFIX, second_byte)
            .ok_or_else(|| malformed_error!("Invalid opcode: FE {:02X}", second_byte))?
    } else {
        lookup_opcode(0, first_byte)
            .ok_or_else(|| malformed_error!("Invalid opcode: {:02X}", first_byte))?
    };

    let operand_start = offset + info.opcode_size();
    let next = operand_start + info.operand.size();

    let is_argument = match info.prefix {
        0 => matches!(info.code, LDARG_S | STARG_S),
        _ => matches!(info.code, FE_LDARG | FE_STARG),
    };
    let is_local = info.prefix == FE_PREFIX && matches!(info.code, FE_LDLOC | FE_STLOC);

    let operand = match info.operand {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::UInt8 => {
            let index = u16::from(parser.read_le::<u8>()?);
            if is_argument {
                Operand::Argument(index)
            } else {
                Operand::Local(index)
            }
        }
        OperandType::UInt16 => {
            let index = parser.read_le::<u16>()?;
            if is_local {
                Operand::Local(index)
            } else {
                Operand::Argument(index)
            }
        }
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::ShortTarget => {
            let displacement = i64::from(parser.read_le::<i8>()?);
            Operand::Target(branch_destination(offset, next, displacement)?)
        }
        OperandType::Target => {
            let displacement = i64::from(parser.read_le::<i32>()?);
            Operand::Target(branch_destination(offset, next, displacement)?)
        }
    };

    Ok(Instruction {
        offset,
        size: next - offset,
        info,
        operand,
    })
}

fn branch_destination(offset: u32, next: u32, displacement: i64) -> Result<u32> {
    u32::try_from(i64::from(next) + displacement).map_err(|_| {
        malformed_error!(
            "Branch at IL_{:04x} jumps before the start of the method body",
            offset
        )
    })
}
