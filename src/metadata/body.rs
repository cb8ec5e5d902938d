//! CIL method bodies and their tiny/fat headers.
//!
//! A body is stored as an ECMA-335 method header followed by the instruction stream. Small
//! bodies (no locals, at most 63 bytes of code, stack depth up to 8) use the one-byte tiny
//! header; everything else uses the twelve-byte fat header. Exception handling sections are
//! not part of the supported subset and are rejected.
//!
//! Local variable types are kept on the body itself instead of behind a standalone
//! signature token, and the debug sequence points that belong to the body travel with it.
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use bitflags::bitflags;

use crate::{
    file::io::{read_le, read_le_at},
    metadata::{sequencepoints::SequencePoints, typesig::TypeSig},
    Error::OutOfBounds,
    Result,
};

bitflags! {
    /// Flags of the method header's first bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodBodyFlags: u16 {
        /// Tiny header: code size in the upper six bits
        const TINY_FORMAT = 0x2;
        /// Fat header
        const FAT_FORMAT = 0x3;
        /// Exception sections follow the code
        const MORE_SECTS = 0x8;
        /// Zero-initialize locals
        const INIT_LOCALS = 0x10;
    }
}

/// Largest code size a tiny header can describe.
const TINY_MAX_CODE: usize = 63;

/// Largest stack depth a tiny header implies.
const TINY_MAX_STACK: u16 = 8;

/// The executable part of a method.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    /// Maximum number of items on the operand stack
    pub max_stack: u16,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// Local variable types, indexed by `ldloc`/`stloc`
    pub locals: Vec<TypeSig>,
    /// The instruction stream
    pub code: Vec<u8>,
    /// Debug mapping from IL offsets to source lines
    pub sequence_points: SequencePoints,
}

impl MethodBody {
    /// A body over `code` with a stack depth of 8 and no locals.
    #[must_use]
    pub fn new(code: Vec<u8>) -> Self {
        MethodBody {
            max_stack: TINY_MAX_STACK,
            init_locals: true,
            locals: Vec::new(),
            code,
            sequence_points: SequencePoints::default(),
        }
    }

    /// Declare the local variables.
    #[must_use]
    pub fn with_locals(mut self, locals: Vec<TypeSig>) -> Self {
        self.locals = locals;
        self
    }

    /// Set the operand stack limit.
    #[must_use]
    pub fn with_max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Attach debug sequence points.
    #[must_use]
    pub fn with_sequence_points(mut self, points: SequencePoints) -> Self {
        self.sequence_points = points;
        self
    }

    /// Whether the tiny header format can describe this body.
    #[must_use]
    pub fn fits_tiny_header(&self) -> bool {
        self.code.len() <= TINY_MAX_CODE
            && self.max_stack <= TINY_MAX_STACK
            && self.locals.is_empty()
    }

    /// Parse a header plus code. Local variable types are not part of the header and are
    /// left empty for the caller to fill in.
    ///
    /// Returns the body and the number of bytes consumed.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated data and
    /// [`crate::Error::Malformed`] for unknown header kinds or exception sections.
    pub fn from(data: &[u8]) -> Result<(MethodBody, usize)> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(OutOfBounds);
                }

                let mut body = MethodBody::new(data[1..=size_code].to_vec());
                body.init_locals = false;
                Ok((body, size_code + 1))
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < 12 {
                    return Err(OutOfBounds);
                }

                let mut cursor = 0;
                let first_duo = read_le_at::<u16>(data, &mut cursor)?;
                let max_stack = read_le_at::<u16>(data, &mut cursor)?;
                let size_code = read_le_at::<u32>(data, &mut cursor)? as usize;
                let _local_var_sig_token = read_le_at::<u32>(data, &mut cursor)?;

                let size_header = usize::from(first_duo >> 12) * 4;
                if size_header != 12 {
                    return Err(malformed_error!(
                        "Fat method header has unexpected size {}",
                        size_header
                    ));
                }
                let Some(end) = size_header.checked_add(size_code) else {
                    return Err(OutOfBounds);
                };
                if data.len() < end {
                    return Err(OutOfBounds);
                }

                let flags = MethodBodyFlags::from_bits_truncate(first_duo & 0x0FFF);
                if flags.contains(MethodBodyFlags::MORE_SECTS) {
                    return Err(malformed_error!(
                        "Method bodies with exception sections are not supported"
                    ));
                }

                let body = MethodBody {
                    max_stack,
                    init_locals: flags.contains(MethodBodyFlags::INIT_LOCALS),
                    locals: Vec::new(),
                    code: data[size_header..end].to_vec(),
                    sequence_points: SequencePoints::default(),
                };
                Ok((body, end))
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    /// Serialize header plus code, choosing the tiny header whenever possible.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the code does not fit a 32-bit size.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.fits_tiny_header() && !self.init_locals {
            let mut data = Vec::with_capacity(self.code.len() + 1);
            #[allow(clippy::cast_possible_truncation)]
            data.push(((self.code.len() as u8) << 2) | 0x2);
            data.extend_from_slice(&self.code);
            return Ok(data);
        }

        let size_code = u32::try_from(self.code.len())
            .map_err(|_| malformed_error!("Method body exceeds u32 range"))?;

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        let first_duo = (3u16 << 12) | flags.bits();

        let mut data = Vec::with_capacity(self.code.len() + 12);
        data.extend_from_slice(&first_duo.to_le_bytes());
        data.extend_from_slice(&self.max_stack.to_le_bytes());
        data.extend_from_slice(&size_code.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&self.code);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny() {
        // ldc.i4.1; ret
        let data = [0x0A, 0x17, 0x2A];
        let (body, consumed) = MethodBody::from(&data).unwrap();

        assert_eq!(consumed, 3);
        assert_eq!(body.code, vec![0x17, 0x2A]);
        assert_eq!(body.max_stack, 8);
        assert!(!body.init_locals);
        assert_eq!(body.to_bytes().unwrap(), data);
    }

    #[test]
    fn fat() {
        let mut body = MethodBody::new(vec![0x00; 70]).with_max_stack(16);
        body.locals = vec![TypeSig::I4];

        let data = body.to_bytes().unwrap();
        assert_eq!(data.len(), 82);
        assert_eq!(data[0] & 0x3, 0x3);

        let (parsed, consumed) = MethodBody::from(&data).unwrap();
        assert_eq!(consumed, 82);
        assert_eq!(parsed.max_stack, 16);
        assert!(parsed.init_locals);
        assert_eq!(parsed.code.len(), 70);
        assert!(parsed.locals.is_empty());
    }

    #[test]
    fn truncated() {
        assert!(matches!(MethodBody::from(&[0x0E, 0x00]), Err(OutOfBounds)));
        assert!(matches!(MethodBody::from(&[0x13, 0x30]), Err(OutOfBounds)));
    }

    #[test]
    fn exception_sections_rejected() {
        let mut data = vec![0x1B, 0x30, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00];
        data.extend_from_slice(&[0x00; 4]);
        data.push(0x2A);
        assert!(MethodBody::from(&data).is_err());
    }

    #[test]
    fn invalid_header_kind() {
        assert!(MethodBody::from(&[0x00, 0x2A]).is_err());
    }
}
