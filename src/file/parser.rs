//! Cursor-based binary parser for the module container and method bodies.
//!
//! [`Parser`] wraps a byte slice and a position and hands out bounds-checked reads of the
//! primitive values, compressed integers, tokens and length-prefixed strings the container
//! format is made of. Every read either succeeds and advances the cursor, or fails with
//! [`crate::Error::OutOfBounds`] / [`crate::Error::Malformed`] and leaves the input alone.

use crate::{
    file::io::{read_le_at, CilIO},
    metadata::token::Token,
    Result,
};

/// A generic binary data parser for reading container structures and CIL bytecode.
///
/// The parser maintains an internal position cursor and provides bounds checking
/// to prevent buffer overruns when reading malformed or truncated data.
///
/// # Examples
///
/// ```rust
/// use dotshim::Parser;
///
/// let data = [0x01, 0x00, 0x00, 0x00, 0x42, 0x43];
/// let mut parser = Parser::new(&data);
///
/// let value: u32 = parser.read_le()?;
/// assert_eq!(value, 1);
///
/// let byte: u8 = parser.read_le()?;
/// assert_eq!(byte, 0x42);
/// assert_eq!(parser.pos(), 5);
/// # Ok::<(), dotshim::Error>(())
/// ```
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new parser over `data`, positioned at its start.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Total length of the underlying buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the underlying buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether there is unread data left.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Number of bytes not read yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the cursor to `pos`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` lies past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Skip `step` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if that would move past the end of the data.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        if self.position + step > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position += step;
        Ok(())
    }

    /// Current cursor position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Read a little-endian primitive and advance.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not enough bytes remain.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Borrow the next `len` bytes and advance past them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not enough bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let Some(end) = self.position.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };
        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Read a compressed unsigned integer as defined in ECMA-335 II.23.2.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
    /// [`crate::Error::Malformed`] for invalid encoding.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotshim::Parser;
    ///
    /// let data = [0x80, 0x80];
    /// let mut parser = Parser::new(&data);
    /// assert_eq!(parser.read_compressed_uint()?, 0x80);
    /// # Ok::<(), dotshim::Error>(())
    /// ```
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            let value = ((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte);
            return Ok(value);
        }

        // 4-byte encoding: 11xxxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            let value = ((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3;
            return Ok(value);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Read a compressed signed integer: the low bit of the unsigned encoding carries the
    /// sign, so deltas of either direction stay short.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] or [`crate::Error::Malformed`] as
    /// [`Parser::read_compressed_uint`] does.
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let unsigned = self.read_compressed_uint()?;

        #[allow(clippy::cast_possible_wrap)]
        let magnitude = (unsigned >> 1) as i32;
        if unsigned & 1 == 0 {
            Ok(magnitude)
        } else {
            Ok(-magnitude - 1)
        }
    }

    /// Read a compressed length and convert it to a `usize`, rejecting lengths that exceed
    /// the remaining input.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] when the declared length cannot fit.
    pub fn read_length(&mut self) -> Result<usize> {
        let length = self.read_compressed_uint()? as usize;
        if length > self.remaining() {
            return Err(out_of_bounds_error!());
        }
        Ok(length)
    }

    /// Read a raw 32-bit metadata token.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not enough bytes remain.
    pub fn read_token(&mut self) -> Result<Token> {
        Ok(Token::new(self.read_le::<u32>()?))
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated data and
    /// [`crate::Error::Malformed`] when the bytes are not valid UTF-8.
    pub fn read_prefixed_string_utf8(&mut self) -> Result<String> {
        let length = self.read_length()?;
        let bytes = self.read_bytes(length)?;

        match std::str::from_utf8(bytes) {
            Ok(value) => Ok(value.to_string()),
            Err(_) => Err(malformed_error!(
                "Invalid UTF-8 string at offset {}",
                self.position - length
            )),
        }
    }

    /// Read a length-prefixed UTF-16 string; the prefix counts code units.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated data and
    /// [`crate::Error::Malformed`] when the data is not valid UTF-16.
    pub fn read_prefixed_string_utf16(&mut self) -> Result<String> {
        let units = self.read_compressed_uint()? as usize;
        if units.saturating_mul(2) > self.remaining() {
            return Err(out_of_bounds_error!());
        }

        let mut buffer = Vec::with_capacity(units);
        for _ in 0..units {
            buffer.push(self.read_le::<u16>()?);
        }

        widestring::U16Str::from_slice(&buffer)
            .to_string()
            .map_err(|_| malformed_error!("Invalid UTF-16 string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_compressed_uint() {
        let test_cases = vec![
            (vec![0x03], 3),
            (vec![0x7F], 0x7F),
            (vec![0x80, 0x80], 0x80),
            (vec![0xAE, 0x57], 0x2E57),
            (vec![0xBF, 0xFF], 0x3FFF),
            (vec![0xC0, 0x00, 0x40, 0x00], 0x4000),
            (vec![0xDF, 0xFF, 0xFF, 0xFF], 0x1FFF_FFFF),
        ];

        for (input, expect) in test_cases {
            let mut parser = Parser::new(&input);
            let result = parser.read_compressed_uint().unwrap();

            assert_eq!(result, expect);
        }
    }

    #[test]
    fn read_compressed_uint_invalid() {
        let mut parser = Parser::new(&[0xFF, 0x00, 0x00, 0x00]);
        assert!(matches!(
            parser.read_compressed_uint(),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn read_prefixed_strings() {
        let mut data = vec![0x05];
        data.extend_from_slice(b"Hello");
        data.push(0x02);
        data.extend_from_slice(&[0x48, 0x00, 0x69, 0x00]);

        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_prefixed_string_utf8().unwrap(), "Hello");
        assert_eq!(parser.read_prefixed_string_utf16().unwrap(), "Hi");
        assert!(!parser.has_more_data());
    }

    #[test]
    fn read_length_rejects_overlong() {
        let mut parser = Parser::new(&[0x10, 0x00]);
        assert!(matches!(
            parser.read_length(),
            Err(crate::Error::OutOfBounds)
        ));
    }

    #[test]
    fn seek_and_bytes() {
        let data = [1, 2, 3, 4];
        let mut parser = Parser::new(&data);
        parser.seek(2).unwrap();
        assert_eq!(parser.read_bytes(2).unwrap(), &[3, 4]);
        assert!(parser.read_bytes(1).is_err());
        assert!(parser.seek(5).is_err());
    }
}
