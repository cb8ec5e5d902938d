//! Fluent builder for CIL method bodies.
//!
//! [`InstructionAssembler`] wraps [`InstructionEncoder`] with one chainable method per
//! instruction. Module builders and tests use it to write method bodies by hand:
//!
//! ```rust
//! use dotshim::assembly::InstructionAssembler;
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?
//!     .brtrue("positive")?
//!     .ldc_i4(-1)?
//!     .ret()?
//!     .label("positive")?
//!     .ldc_i4(1)?
//!     .ret()?;
//!
//! let (bytecode, labels) = asm.finish()?;
//! assert_eq!(labels["positive"], 8);
//! assert_eq!(bytecode.len(), 10);
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{
        encoder::InstructionEncoder,
        instruction::{Immediate, Operand},
    },
    metadata::token::Token,
    Result,
};

macro_rules! simple {
    ($($(#[$meta:meta])* $name:ident => $mnemonic:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            ///
            /// # Errors
            /// Propagates encoding errors.
            pub fn $name(&mut self) -> Result<&mut Self> {
                self.encoder.emit_instruction($mnemonic, None)?;
                Ok(self)
            }
        )*
    };
}

macro_rules! with_token {
    ($($(#[$meta:meta])* $name:ident => $mnemonic:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            ///
            /// # Errors
            /// Propagates encoding errors.
            pub fn $name(&mut self, token: Token) -> Result<&mut Self> {
                self.encoder.emit_instruction($mnemonic, Some(Operand::Token(token)))?;
                Ok(self)
            }
        )*
    };
}

macro_rules! branch {
    ($($(#[$meta:meta])* $name:ident => $mnemonic:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            ///
            /// # Errors
            /// Propagates encoding errors.
            pub fn $name(&mut self, label: &str) -> Result<&mut Self> {
                self.encoder.emit_branch($mnemonic, label)?;
                Ok(self)
            }
        )*
    };
}

/// Chainable method-body builder.
#[derive(Debug, Default)]
pub struct InstructionAssembler {
    encoder: InstructionEncoder,
}

impl InstructionAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a label at the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::DuplicateLabel`] if the label already exists.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        self.encoder.define_label(name)?;
        Ok(self)
    }

    /// Load argument `index`.
    ///
    /// # Errors
    /// Propagates encoding errors.
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.encoder.emit_ldarg(index)?;
        Ok(self)
    }

    /// Store into argument `index`.
    ///
    /// # Errors
    /// Propagates encoding errors.
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        if index <= 255 {
            self.encoder
                .emit_instruction("starg.s", Some(Operand::Argument(index)))?;
        } else {
            self.encoder
                .emit_instruction("starg", Some(Operand::Argument(index)))?;
        }
        Ok(self)
    }

    /// Load local `index`.
    ///
    /// # Errors
    /// Propagates encoding errors.
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.encoder.emit_ldloc(index)?;
        Ok(self)
    }

    /// Store into local `index`.
    ///
    /// # Errors
    /// Propagates encoding errors.
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.encoder.emit_stloc(index)?;
        Ok(self)
    }

    /// Push a 32-bit constant.
    ///
    /// # Errors
    /// Propagates encoding errors.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.encoder.emit_ldc_i4(value)?;
        Ok(self)
    }

    /// Push a 64-bit constant.
    ///
    /// # Errors
    /// Propagates encoding errors.
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.encoder
            .emit_instruction("ldc.i8", Some(Operand::Immediate(Immediate::Int64(value))))?;
        Ok(self)
    }

    /// Push a double constant.
    ///
    /// # Errors
    /// Propagates encoding errors.
    pub fn ldc_r8(&mut self, value: f64) -> Result<&mut Self> {
        self.encoder
            .emit_instruction("ldc.r8", Some(Operand::Immediate(Immediate::Float64(value))))?;
        Ok(self)
    }

    simple! {
        /// `nop`
        nop => "nop",
        /// `ldnull`
        ldnull => "ldnull",
        /// `dup`
        dup => "dup",
        /// `pop`
        pop => "pop",
        /// `ret`
        ret => "ret",
        /// `add`
        add => "add",
        /// `sub`
        sub => "sub",
        /// `mul`
        mul => "mul",
        /// `div`
        div => "div",
        /// `rem`
        rem => "rem",
        /// `and`
        and => "and",
        /// `or`
        or => "or",
        /// `xor`
        xor => "xor",
        /// `neg`
        neg => "neg",
        /// `not`
        not => "not",
        /// `conv.i4`
        conv_i4 => "conv.i4",
        /// `conv.i8`
        conv_i8 => "conv.i8",
        /// `conv.r8`
        conv_r8 => "conv.r8",
        /// `ceq`
        ceq => "ceq",
        /// `cgt`
        cgt => "cgt",
        /// `clt`
        clt => "clt",
        /// `throw`
        throw => "throw",
        /// `ldlen`
        ldlen => "ldlen",
        /// `ldelem.ref`
        ldelem_ref => "ldelem.ref",
        /// `stelem.ref`
        stelem_ref => "stelem.ref",
    }

    with_token! {
        /// `call` a method
        call => "call",
        /// `callvirt` a method
        callvirt => "callvirt",
        /// `newobj` through a constructor
        newobj => "newobj",
        /// `ldstr` a user string
        ldstr => "ldstr",
        /// `ldfld`
        ldfld => "ldfld",
        /// `stfld`
        stfld => "stfld",
        /// `ldsfld`
        ldsfld => "ldsfld",
        /// `stsfld`
        stsfld => "stsfld",
        /// `box` a value of the given type
        box_value => "box",
        /// `unbox.any` to the given type
        unbox_any => "unbox.any",
        /// `castclass`
        castclass => "castclass",
        /// `isinst`
        isinst => "isinst",
        /// `newarr` of the given element type
        newarr => "newarr",
        /// `ldtoken`
        ldtoken => "ldtoken",
    }

    branch! {
        /// `br`
        br => "br",
        /// `br.s`
        br_s => "br.s",
        /// `brfalse`
        brfalse => "brfalse",
        /// `brtrue`
        brtrue => "brtrue",
        /// `beq`
        beq => "beq",
        /// `bge`
        bge => "bge",
        /// `bgt`
        bgt => "bgt",
        /// `ble`
        ble => "ble",
        /// `blt`
        blt => "blt",
        /// `bne.un`
        bne_un => "bne.un",
    }

    /// Resolve labels and return the bytecode.
    ///
    /// # Errors
    /// See [`InstructionEncoder::finalize`].
    pub fn finish(self) -> Result<(Vec<u8>, HashMap<String, u32>)> {
        self.encoder.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::decode_stream;

    #[test]
    fn test_chained_body_decodes() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .ldc_i4(2)?
            .mul()?
            .stloc(0)?
            .ldloc(0)?
            .ldc_i4(10)?
            .bgt("big")?
            .ldloc(0)?
            .ret()?
            .label("big")?
            .ldc_i4(10)?
            .ret()?;

        let (bytecode, labels) = asm.finish()?;
        let decoded = decode_stream(&bytecode)?;

        let branch = decoded.iter().find(|instr| instr.is_branch()).unwrap();
        assert_eq!(branch.mnemonic(), "bgt");
        assert_eq!(branch.branch_target(), Some(labels["big"]));
        assert_eq!(decoded.last().unwrap().mnemonic(), "ret");
        Ok(())
    }

    #[test]
    fn test_token_operands() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldstr(Token::new(0x7000_0001))?
            .call(Token::new(0x0A00_0002))?
            .ret()?;

        let (bytecode, _) = asm.finish()?;
        assert_eq!(
            bytecode,
            vec![0x72, 0x01, 0x00, 0x00, 0x70, 0x28, 0x02, 0x00, 0x00, 0x0A, 0x2A]
        );
        Ok(())
    }
}
