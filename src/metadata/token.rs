//! Metadata tokens.
//!
//! A token is a 32-bit handle whose high byte selects a table and whose low 24 bits select a
//! 1-based row. Instruction operands (`call`, `newobj`, `ldstr`, `ldtoken`, ...) carry
//! tokens, and every cross-reference inside a [`crate::Module`] is expressed through them.
//!
//! | Table | Id | Referenced entity |
//! |-------|----|-------------------|
//! | TypeDef | `0x02` | Types defined by the module |
//! | Field | `0x04` | Fields defined by the module |
//! | MethodDef | `0x06` | Methods defined by the module |
//! | MemberRef | `0x0A` | Methods of types outside the module |
//! | TypeSpec | `0x1B` | Arbitrary type signatures |
//! | MethodSpec | `0x2B` | Generic method instantiations |
//! | UserString | `0x70` | `ldstr` literals |

use std::fmt;

use strum::{Display, FromRepr};

/// Tables a [`Token`] can point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum TableId {
    /// Type definitions
    TypeDef = 0x02,
    /// Field definitions
    Field = 0x04,
    /// Method definitions
    MethodDef = 0x06,
    /// Member references
    MemberRef = 0x0A,
    /// Type specifications
    TypeSpec = 0x1B,
    /// Generic method instantiations
    MethodSpec = 0x2B,
    /// User string heap
    UserString = 0x70,
}

/// A metadata token.
///
/// # Examples
///
/// ```rust
/// use dotshim::metadata::token::{TableId, Token};
///
/// let token = Token::from_parts(TableId::MethodDef, 3);
/// assert_eq!(token.value(), 0x0600_0003);
/// assert_eq!(token.table_id(), Some(TableId::MethodDef));
/// assert_eq!(token.index(), Some(2));
/// assert_eq!(token.to_string(), "0x06000003");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Create a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Create a token from a table and a 1-based row.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token((u32::from(table as u8) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The table byte as a known [`TableId`].
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_repr(self.table())
    }

    /// The 1-based row.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// The 0-based index of the row, `None` for row 0.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.row().checked_sub(1).map(|index| index as usize)
    }

    /// Whether this is the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Whether the token points into `table`.
    #[must_use]
    pub fn is_table(&self, table: TableId) -> bool {
        self.table() == table as u8
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_token_parts() {
        let token = Token::from_parts(TableId::MemberRef, 0x12);
        assert_eq!(token.value(), 0x0A00_0012);
        assert_eq!(token.table(), 0x0A);
        assert_eq!(token.row(), 0x12);
        assert!(token.is_table(TableId::MemberRef));
        assert!(!token.is_table(TableId::MethodDef));
    }

    #[test]
    fn test_token_index() {
        assert_eq!(Token(0x0600_0001).index(), Some(0));
        assert_eq!(Token(0x0600_0000).index(), None);
    }

    #[test]
    fn test_token_unknown_table() {
        assert_eq!(Token(0x0100_0001).table_id(), None);
        assert_eq!(Token(0x7000_0001).table_id(), Some(TableId::UserString));
    }

    #[test]
    fn test_token_is_null() {
        assert!(Token(0).is_null());
        assert!(!Token(0x0600_0001).is_null());
    }

    #[test]
    fn test_token_formatting() {
        let token = Token(0x0200_0005);
        assert_eq!(format!("{token}"), "0x02000005");
        assert_eq!(
            format!("{token:?}"),
            "Token(0x02000005, table: 0x02, row: 5)"
        );
    }

    #[test]
    fn test_token_hash_map_key() {
        let mut map = HashMap::new();
        map.insert(Token(0x0600_0001), "first");
        map.insert(Token(0x0600_0002), "second");

        assert_eq!(map.get(&Token(0x0600_0001)), Some(&"first"));
        assert_eq!(map.len(), 2);
    }
}
