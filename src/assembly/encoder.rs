//! CIL instruction encoding.
//!
//! The reverse of [`crate::assembly::decoder`]: instructions are emitted by mnemonic into a
//! byte buffer, branches refer to named labels, and [`InstructionEncoder::finalize`] patches
//! every branch displacement once all labels are known.
//!
//! # Label Resolution
//!
//! ```rust
//! use dotshim::assembly::InstructionEncoder;
//!
//! let mut encoder = InstructionEncoder::new();
//!
//! encoder.emit_instruction("ldarg.0", None)?;
//! encoder.emit_branch("brfalse", "end_label")?;
//! encoder.emit_instruction("ldarg.1", None)?;
//! encoder.emit_instruction("pop", None)?;
//! encoder.define_label("end_label")?;
//! encoder.emit_instruction("ret", None)?;
//!
//! let (bytecode, labels) = encoder.finalize()?;
//! assert_eq!(labels["end_label"], 8);
//! assert_eq!(bytecode.len(), 9);
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::instruction::{
        lookup_mnemonic, FlowType, Immediate, Instruction, OpCodeInfo, Operand, OperandType,
    },
    metadata::token::Token,
    Error, Result,
};

/// A branch whose displacement is written during [`InstructionEncoder::finalize`].
#[derive(Debug, Clone)]
pub struct LabelFixup {
    /// The target label name to resolve
    pub label: String,
    /// Position in bytecode where the branch offset should be written
    pub fixup_position: usize,
    /// Size of the branch offset field (1 or 4 bytes)
    pub offset_size: u8,
}

/// Encodes CIL instructions into a method body.
#[derive(Debug, Default)]
pub struct InstructionEncoder {
    /// Generated bytecode buffer
    bytecode: Vec<u8>,
    /// Defined label positions (label_name -> byte_position)
    labels: HashMap<String, u32>,
    /// Pending branch fixups awaiting label resolution
    fixups: Vec<LabelFixup>,
}

impl InstructionEncoder {
    /// Create a new, empty encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a non-branch instruction with an optional operand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMnemonic`] for unknown mnemonics, [`Error::InvalidBranch`] for
    /// branch mnemonics (use [`InstructionEncoder::emit_branch`]) and
    /// [`crate::Error::Malformed`] when the operand does not fit the opcode.
    pub fn emit_instruction(&mut self, mnemonic: &str, operand: Option<Operand>) -> Result<()> {
        let info = lookup_mnemonic(mnemonic)
            .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;

        if info.is_branch() {
            return Err(Error::InvalidBranch(format!(
                "instruction '{mnemonic}' needs a label target"
            )));
        }

        self.emit_opcode(info);
        self.emit_operand(operand, info)
    }

    /// Re-emit a decoded non-branch instruction unchanged.
    ///
    /// # Errors
    ///
    /// Same as [`InstructionEncoder::emit_instruction`].
    pub fn emit_instruction_decoded(&mut self, instruction: &Instruction) -> Result<()> {
        let operand = match instruction.operand {
            Operand::None => None,
            other => Some(other),
        };
        self.emit_instruction(instruction.mnemonic(), operand)
    }

    /// Emit a branch to `label`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMnemonic`] if the mnemonic is not recognized and
    /// [`Error::InvalidBranch`] if it is not a branch instruction.
    pub fn emit_branch(&mut self, mnemonic: &str, label: &str) -> Result<()> {
        let info = lookup_mnemonic(mnemonic)
            .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;

        if !matches!(
            info.flow,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch
        ) {
            return Err(Error::InvalidBranch(format!(
                "instruction '{mnemonic}' is not a branch instruction"
            )));
        }

        self.emit_opcode(info);

        let offset_size = match info.operand {
            OperandType::ShortTarget => 1,
            _ => 4,
        };
        self.fixups.push(LabelFixup {
            label: label.to_string(),
            fixup_position: self.bytecode.len(),
            offset_size,
        });
        self.bytecode
            .extend(std::iter::repeat(0).take(usize::from(offset_size)));

        Ok(())
    }

    /// Emit `call`, `callvirt` or `newobj` with a method token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMnemonic`] if the mnemonic is unknown.
    pub fn emit_call(&mut self, mnemonic: &str, method: Token) -> Result<()> {
        self.emit_instruction(mnemonic, Some(Operand::Token(method)))
    }

    /// Emit the shortest `ldarg` form for `index`.
    ///
    /// # Errors
    ///
    /// Propagates encoding errors.
    pub fn emit_ldarg(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("ldarg.0", None),
            1 => self.emit_instruction("ldarg.1", None),
            2 => self.emit_instruction("ldarg.2", None),
            3 => self.emit_instruction("ldarg.3", None),
            4..=255 => self.emit_instruction("ldarg.s", Some(Operand::Argument(index))),
            _ => self.emit_instruction("ldarg", Some(Operand::Argument(index))),
        }
    }

    /// Emit the shortest `ldloc` form for `index`.
    ///
    /// # Errors
    ///
    /// Propagates encoding errors.
    pub fn emit_ldloc(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("ldloc.0", None),
            1 => self.emit_instruction("ldloc.1", None),
            2 => self.emit_instruction("ldloc.2", None),
            3 => self.emit_instruction("ldloc.3", None),
            4..=255 => self.emit_instruction("ldloc.s", Some(Operand::Local(index))),
            _ => self.emit_instruction("ldloc", Some(Operand::Local(index))),
        }
    }

    /// Emit the shortest `stloc` form for `index`.
    ///
    /// # Errors
    ///
    /// Propagates encoding errors.
    pub fn emit_stloc(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("stloc.0", None),
            1 => self.emit_instruction("stloc.1", None),
            2 => self.emit_instruction("stloc.2", None),
            3 => self.emit_instruction("stloc.3", None),
            4..=255 => self.emit_instruction("stloc.s", Some(Operand::Local(index))),
            _ => self.emit_instruction("stloc", Some(Operand::Local(index))),
        }
    }

    /// Emit the shortest `ldc.i4` form for `value`.
    ///
    /// # Errors
    ///
    /// Propagates encoding errors.
    pub fn emit_ldc_i4(&mut self, value: i32) -> Result<()> {
        match value {
            -1 => self.emit_instruction("ldc.i4.m1", None),
            0 => self.emit_instruction("ldc.i4.0", None),
            1 => self.emit_instruction("ldc.i4.1", None),
            2 => self.emit_instruction("ldc.i4.2", None),
            3 => self.emit_instruction("ldc.i4.3", None),
            4 => self.emit_instruction("ldc.i4.4", None),
            5 => self.emit_instruction("ldc.i4.5", None),
            6 => self.emit_instruction("ldc.i4.6", None),
            7 => self.emit_instruction("ldc.i4.7", None),
            8 => self.emit_instruction("ldc.i4.8", None),
            _ => match i8::try_from(value) {
                Ok(small) => {
                    self.emit_instruction("ldc.i4.s", Some(Operand::Immediate(Immediate::Int8(small))))
                }
                Err(_) => {
                    self.emit_instruction("ldc.i4", Some(Operand::Immediate(Immediate::Int32(value))))
                }
            },
        }
    }

    /// Define `name` at the current position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateLabel`] if the label already exists.
    pub fn define_label(&mut self, name: &str) -> Result<()> {
        if self.labels.contains_key(name) {
            return Err(Error::DuplicateLabel(name.to_string()));
        }

        let position = self.current_position()?;
        self.labels.insert(name.to_string(), position);
        Ok(())
    }

    /// Current length of the emitted bytecode.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] once the body grows past `u32`.
    pub fn current_position(&self) -> Result<u32> {
        u32::try_from(self.bytecode.len())
            .map_err(|_| malformed_error!("Bytecode length exceeds u32 range"))
    }

    /// Position of a defined label.
    #[must_use]
    pub fn label_offset(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    /// Resolve every branch and return the bytecode with the final label positions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UndefinedLabel`] for branches to unknown labels and
    /// [`Error::InvalidBranch`] for short branches whose displacement does not fit in a byte.
    pub fn finalize(mut self) -> Result<(Vec<u8>, HashMap<String, u32>)> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let label_position = self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| Error::UndefinedLabel(fixup.label.clone()))?;

            let next_instruction_pos = fixup.fixup_position + usize::from(fixup.offset_size);
            let offset = i64::from(*label_position) - next_instruction_pos as i64;

            self.write_branch_offset(offset, fixup)?;
        }

        Ok((self.bytecode, self.labels))
    }

    fn emit_opcode(&mut self, info: &OpCodeInfo) {
        if info.prefix != 0 {
            self.bytecode.push(info.prefix);
        }
        self.bytecode.push(info.code);
    }

    fn emit_operand(&mut self, operand: Option<Operand>, info: &OpCodeInfo) -> Result<()> {
        match (info.operand, operand) {
            (OperandType::None, None) => {}
            (OperandType::Int8, Some(Operand::Immediate(Immediate::Int8(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::UInt8, Some(Operand::Argument(index) | Operand::Local(index))) => {
                let index = u8::try_from(index).map_err(|_| {
                    malformed_error!("Index {} does not fit '{}'", index, info.mnemonic)
                })?;
                self.bytecode.push(index);
            }
            (OperandType::UInt16, Some(Operand::Argument(index) | Operand::Local(index))) => {
                self.bytecode.extend_from_slice(&index.to_le_bytes());
            }
            (OperandType::Int32, Some(Operand::Immediate(Immediate::Int32(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Int64, Some(Operand::Immediate(Immediate::Int64(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Float64, Some(Operand::Immediate(Immediate::Float64(value)))) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandType::Token, Some(Operand::Token(token))) => {
                self.bytecode.extend_from_slice(&token.value().to_le_bytes());
            }
            (expected, operand) => {
                return Err(malformed_error!(
                    "Operand {:?} does not match '{}' (expects {:?})",
                    operand,
                    info.mnemonic,
                    expected
                ))
            }
        }
        Ok(())
    }

    fn write_branch_offset(&mut self, offset: i64, fixup: &LabelFixup) -> Result<()> {
        let position = fixup.fixup_position;
        match fixup.offset_size {
            1 => {
                let offset = i8::try_from(offset).map_err(|_| {
                    Error::InvalidBranch(format!(
                        "offset {offset} to '{}' out of range for 1-byte instruction",
                        fixup.label
                    ))
                })?;
                self.bytecode[position] = offset.to_le_bytes()[0];
            }
            _ => {
                let offset = i32::try_from(offset).map_err(|_| {
                    Error::InvalidBranch(format!("offset {offset} exceeds i32 range"))
                })?;
                self.bytecode[position..position + 4].copy_from_slice(&offset.to_le_bytes());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::decode_stream;

    #[test]
    fn test_simple_instruction_encoding() -> Result<()> {
        let mut encoder = InstructionEncoder::new();

        encoder.emit_instruction("nop", None)?;
        encoder.emit_instruction("ret", None)?;

        let (bytecode, _) = encoder.finalize()?;
        assert_eq!(bytecode, vec![0x00, 0x2A]);

        Ok(())
    }

    #[test]
    fn test_instruction_with_operands() -> Result<()> {
        let mut encoder = InstructionEncoder::new();

        encoder.emit_instruction("ldarg.s", Some(Operand::Argument(1)))?;
        encoder.emit_instruction("ldc.i4.s", Some(Operand::Immediate(Immediate::Int8(42))))?;
        encoder.emit_instruction("ldloc", Some(Operand::Local(0x0102)))?;

        let (bytecode, _) = encoder.finalize()?;
        assert_eq!(bytecode, vec![0x0E, 0x01, 0x1F, 42, 0xFE, 0x0C, 0x02, 0x01]);

        Ok(())
    }

    #[test]
    fn test_label_resolution() -> Result<()> {
        let mut encoder = InstructionEncoder::new();

        encoder.emit_instruction("nop", None)?;
        encoder.emit_branch("br.s", "target")?;
        encoder.emit_instruction("nop", None)?;
        encoder.define_label("target")?;
        encoder.emit_instruction("ret", None)?;

        let (bytecode, labels) = encoder.finalize()?;
        assert_eq!(bytecode, vec![0x00, 0x2B, 0x01, 0x00, 0x2A]);
        assert_eq!(labels["target"], 4);

        Ok(())
    }

    #[test]
    fn test_backward_long_branch() -> Result<()> {
        let mut encoder = InstructionEncoder::new();

        encoder.define_label("top")?;
        encoder.emit_instruction("nop", None)?;
        encoder.emit_branch("br", "top")?;

        let (bytecode, _) = encoder.finalize()?;
        assert_eq!(bytecode, vec![0x00, 0x38, 0xFA, 0xFF, 0xFF, 0xFF]);

        let decoded = decode_stream(&bytecode)?;
        assert_eq!(decoded[1].branch_target(), Some(0));

        Ok(())
    }

    #[test]
    fn test_short_branch_out_of_range() -> Result<()> {
        let mut encoder = InstructionEncoder::new();

        encoder.emit_branch("br.s", "far")?;
        for _ in 0..200 {
            encoder.emit_instruction("nop", None)?;
        }
        encoder.define_label("far")?;

        assert!(matches!(encoder.finalize(), Err(Error::InvalidBranch(_))));
        Ok(())
    }

    #[test]
    fn test_invalid_mnemonic() {
        let mut encoder = InstructionEncoder::new();
        let result = encoder.emit_instruction("invalid_instruction", None);
        assert!(matches!(result, Err(Error::InvalidMnemonic(_))));
    }

    #[test]
    fn test_wrong_operand_type() {
        let mut encoder = InstructionEncoder::new();
        let result =
            encoder.emit_instruction("ldarg.s", Some(Operand::Immediate(Immediate::Int32(1))));
        assert!(result.is_err());

        let result = encoder.emit_instruction("call", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_undefined_label() {
        let mut encoder = InstructionEncoder::new();
        encoder.emit_branch("br.s", "undefined_label").unwrap();
        assert!(matches!(encoder.finalize(), Err(Error::UndefinedLabel(_))));
    }

    #[test]
    fn test_duplicate_label() -> Result<()> {
        let mut encoder = InstructionEncoder::new();
        encoder.define_label("test_label")?;
        let result = encoder.define_label("test_label");
        assert!(matches!(result, Err(Error::DuplicateLabel(_))));
        Ok(())
    }

    #[test]
    fn test_shortest_forms() -> Result<()> {
        let mut encoder = InstructionEncoder::new();
        encoder.emit_ldc_i4(3)?;
        encoder.emit_ldc_i4(-100)?;
        encoder.emit_ldc_i4(1000)?;
        encoder.emit_stloc(5)?;
        encoder.emit_ldloc(2)?;
        encoder.emit_ldarg(7)?;

        let (bytecode, _) = encoder.finalize()?;
        assert_eq!(
            bytecode,
            vec![
                0x19, 0x1F, 0x9C, 0x20, 0xE8, 0x03, 0x00, 0x00, 0x13, 0x05, 0x08, 0x0E, 0x07
            ]
        );
        Ok(())
    }
}
