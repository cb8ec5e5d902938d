//! Growable little-endian output buffer, the write-side counterpart of
//! [`crate::file::parser::Parser`].

use crate::{file::io::CilIO, metadata::token::Token, Result};

/// Append-only byte buffer used when serializing containers and method bodies.
#[derive(Debug, Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Writer { data: Vec::new() }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a little-endian primitive.
    pub fn write_le<T: CilIO>(&mut self, value: T) {
        self.data.extend_from_slice(value.to_le_bytes().as_ref());
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append a raw 32-bit token.
    pub fn write_token(&mut self, token: Token) {
        self.write_le::<u32>(token.value());
    }

    /// Append a compressed unsigned integer (ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for values above `0x1FFF_FFFF`, which have no
    /// compressed representation.
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        match value {
            0..=0x7F => self.data.push(value as u8),
            0x80..=0x3FFF => {
                self.data.push(((value >> 8) as u8) | 0x80);
                self.data.push(value as u8);
            }
            0x4000..=0x1FFF_FFFF => {
                self.data.push(((value >> 24) as u8) | 0xC0);
                self.data.push((value >> 16) as u8);
                self.data.push((value >> 8) as u8);
                self.data.push(value as u8);
            }
            _ => {
                return Err(malformed_error!(
                    "Value {} is too large for a compressed integer",
                    value
                ))
            }
        }
        Ok(())
    }

    /// Append a compressed signed integer, the inverse of
    /// [`crate::Parser::read_compressed_int`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when the value is out of range.
    pub fn write_compressed_int(&mut self, value: i32) -> Result<()> {
        #[allow(clippy::cast_sign_loss)]
        let encoded = if value >= 0 {
            (value as u32) << 1
        } else {
            (((-(i64::from(value)) - 1) as u32) << 1) | 1
        };
        self.write_compressed_uint(encoded)
    }

    /// Append a collection length as a compressed integer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when the length cannot be compressed.
    pub fn write_length(&mut self, length: usize) -> Result<()> {
        let Ok(length) = u32::try_from(length) else {
            return Err(malformed_error!("Length {} exceeds u32", length));
        };
        self.write_compressed_uint(length)
    }

    /// Append a length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when the string is too long to prefix.
    pub fn write_prefixed_string_utf8(&mut self, value: &str) -> Result<()> {
        self.write_length(value.len())?;
        self.write_bytes(value.as_bytes());
        Ok(())
    }

    /// Append a length-prefixed UTF-16 string; the prefix counts code units.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when the string is too long to prefix.
    pub fn write_prefixed_string_utf16(&mut self, value: &str) -> Result<()> {
        let wide = widestring::U16String::from_str(value);
        self.write_length(wide.len())?;
        for unit in wide.as_slice() {
            self.write_le::<u16>(*unit);
        }
        Ok(())
    }

    /// Consume the writer and return the buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Parser;

    #[test]
    fn compressed_uint_encodings() {
        let cases: [(u32, &[u8]); 4] = [
            (0x03, &[0x03]),
            (0x80, &[0x80, 0x80]),
            (0x2E57, &[0xAE, 0x57]),
            (0x4000, &[0xC0, 0x00, 0x40, 0x00]),
        ];

        for (value, expected) in cases {
            let mut writer = Writer::new();
            writer.write_compressed_uint(value).unwrap();
            assert_eq!(writer.into_inner(), expected);
        }
    }

    #[test]
    fn compressed_int_signs() {
        let mut writer = Writer::new();
        for value in [0, 1, -1, 63, -64, 1000, -1000] {
            writer.write_compressed_int(value).unwrap();
        }
        let data = writer.into_inner();

        let mut parser = Parser::new(&data);
        for value in [0, 1, -1, 63, -64, 1000, -1000] {
            assert_eq!(parser.read_compressed_int().unwrap(), value);
        }
    }

    #[test]
    fn compressed_uint_too_large() {
        let mut writer = Writer::new();
        assert!(writer.write_compressed_uint(0x2000_0000).is_err());
    }

    #[test]
    fn utf16_strings_read_back() {
        let mut writer = Writer::new();
        writer.write_prefixed_string_utf16("Grüße").unwrap();
        let data = writer.into_inner();

        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_prefixed_string_utf16().unwrap(), "Grüße");
    }
}
