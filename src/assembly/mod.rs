//! CIL instruction layer.
//!
//! Opcodes, decoding of method bodies into [`Instruction`]s, encoding with label fix-ups,
//! and a fluent [`InstructionAssembler`] for writing bodies by hand.
//!
//! # Key Components
//!
//! - [`opcodes`] - ECMA-335 opcode byte values
//! - [`decode_stream`] / [`decode_instruction`] - bytes to instructions
//! - [`InstructionEncoder`] - instructions to bytes, with string labels
//! - [`InstructionAssembler`] - chainable builder on top of the encoder

mod assembler;
mod decoder;
mod encoder;
mod instruction;
pub mod opcodes;

pub use assembler::InstructionAssembler;
pub use decoder::{decode_instruction, decode_stream};
pub use encoder::{InstructionEncoder, LabelFixup};
pub use instruction::{
    lookup_mnemonic, lookup_opcode, FlowType, Immediate, Instruction, OpCodeInfo, Operand,
    OperandType, OPCODES,
};
