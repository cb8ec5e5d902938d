//! Debug sequence points: IL offset to source location mappings.
//!
//! Sequence points live in the module's symbols section, one blob per method, in the
//! delta-compressed layout used by portable PDBs:
//!
//! - **IL Offset**: compressed unsigned int (delta from the previous point after the first)
//! - **Start Line**: compressed unsigned int for the first entry, signed delta afterwards
//! - **Start Column**: compressed unsigned int for the first entry, signed delta afterwards
//! - **End Line Delta**: compressed unsigned int, added to the start line
//! - **End Column Delta**: compressed unsigned int, added to the start column
//!
//! A point whose start line is `0xFEEFEE` is hidden.
//!
//! ```rust
//! use dotshim::metadata::sequencepoints::{parse_sequence_points, SequencePoints};
//!
//! let blob: &[u8] = &[1, 10, 2, 0, 5];
//! let points = parse_sequence_points(blob)?;
//! assert_eq!(points.0.len(), 1);
//! assert_eq!(points.to_bytes()?, blob);
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::collections::HashMap;

use crate::{file::parser::Parser, file::writer::Writer, Result};

/// Start line value that marks a hidden sequence point.
pub const HIDDEN_LINE: u32 = 0x00FE_EFEE;

/// A single mapping from an IL offset to a source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    /// Offset in the method's IL stream.
    pub il_offset: u32,
    /// Starting line in the source file.
    pub start_line: u32,
    /// Starting column in the source file.
    pub start_col: u16,
    /// Ending line in the source file.
    pub end_line: u32,
    /// Ending column in the source file.
    pub end_col: u16,
    /// True if this is a hidden sequence point.
    pub is_hidden: bool,
}

/// The sequence points of one method, ordered by IL offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequencePoints(pub Vec<SequencePoint>);

impl SequencePoints {
    /// Whether the method has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The point recorded at exactly `il_offset`.
    #[must_use]
    pub fn find_by_il_offset(&self, il_offset: u32) -> Option<&SequencePoint> {
        self.0.iter().find(|sp| sp.il_offset == il_offset)
    }

    /// The point covering `il_offset`: the last one starting at or before it.
    #[must_use]
    pub fn covering(&self, il_offset: u32) -> Option<&SequencePoint> {
        self.0
            .iter()
            .take_while(|sp| sp.il_offset <= il_offset)
            .last()
    }

    /// Move every point to its new offset after a body was rewritten.
    ///
    /// `offsets` maps each original instruction offset to where that instruction starts
    /// now. Points at offsets missing from the map keep their position.
    #[must_use]
    pub fn remap(&self, offsets: &HashMap<u32, u32>) -> SequencePoints {
        SequencePoints(
            self.0
                .iter()
                .map(|sp| SequencePoint {
                    il_offset: offsets.get(&sp.il_offset).copied().unwrap_or(sp.il_offset),
                    ..sp.clone()
                })
                .collect(),
        )
    }

    /// Encode into the delta-compressed blob layout.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the points are not sorted by offset or a
    /// value does not fit the compressed encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new();
        let mut previous: Option<&SequencePoint> = None;

        for point in &self.0 {
            match previous {
                None => {
                    writer.write_compressed_uint(point.il_offset)?;
                    writer.write_compressed_uint(point.start_line)?;
                    writer.write_compressed_uint(u32::from(point.start_col))?;
                }
                Some(last) => {
                    let Some(delta) = point.il_offset.checked_sub(last.il_offset) else {
                        return Err(malformed_error!(
                            "Sequence points out of order at IL_{:04x}",
                            point.il_offset
                        ));
                    };
                    writer.write_compressed_uint(delta)?;

                    let line_delta = i64::from(point.start_line) - i64::from(last.start_line);
                    let line_delta = i32::try_from(line_delta)
                        .map_err(|_| malformed_error!("Line delta {} too large", line_delta))?;
                    writer.write_compressed_int(line_delta)?;
                    writer.write_compressed_int(
                        i32::from(point.start_col) - i32::from(last.start_col),
                    )?;
                }
            }

            let Some(end_line_delta) = point.end_line.checked_sub(point.start_line) else {
                return Err(malformed_error!("Sequence point ends before it starts"));
            };
            let Some(end_col_delta) = point.end_col.checked_sub(point.start_col) else {
                return Err(malformed_error!("Sequence point ends before it starts"));
            };
            writer.write_compressed_uint(end_line_delta)?;
            writer.write_compressed_uint(u32::from(end_col_delta))?;

            previous = Some(point);
        }

        Ok(writer.into_inner())
    }
}

/// Parse a sequence points blob.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] or [`crate::Error::Malformed`] for damaged blobs.
pub fn parse_sequence_points(blob: &[u8]) -> Result<SequencePoints> {
    let mut parser = Parser::new(blob);
    let mut points: Vec<SequencePoint> = Vec::new();

    while parser.has_more_data() {
        let (il_offset, start_line, start_col) = match points.last() {
            None => (
                parser.read_compressed_uint()?,
                parser.read_compressed_uint()?,
                narrow_column(i64::from(parser.read_compressed_uint()?))?,
            ),
            Some(last) => {
                let il_offset = last
                    .il_offset
                    .checked_add(parser.read_compressed_uint()?)
                    .ok_or_else(|| malformed_error!("Sequence point offset overflow"))?;
                let line = i64::from(last.start_line) + i64::from(parser.read_compressed_int()?);
                let start_line = u32::try_from(line)
                    .map_err(|_| malformed_error!("Sequence point line {} out of range", line))?;
                let start_col = narrow_column(
                    i64::from(last.start_col) + i64::from(parser.read_compressed_int()?),
                )?;
                (il_offset, start_line, start_col)
            }
        };

        let end_line = start_line
            .checked_add(parser.read_compressed_uint()?)
            .ok_or_else(|| malformed_error!("Sequence point end line overflow"))?;
        let end_col = narrow_column(
            i64::from(start_col) + i64::from(parser.read_compressed_uint()?),
        )?;

        points.push(SequencePoint {
            il_offset,
            start_line,
            start_col,
            end_line,
            end_col,
            is_hidden: start_line == HIDDEN_LINE,
        });
    }

    Ok(SequencePoints(points))
}

fn narrow_column(value: i64) -> Result<u16> {
    u16::try_from(value).map_err(|_| malformed_error!("Sequence point column {} out of range", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_blob() {
        let result = parse_sequence_points(&[]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn parse_single_sequence_point() {
        let result = parse_sequence_points(&[1, 10, 2, 0, 5]).unwrap();
        assert_eq!(result.0.len(), 1);
        let sp = &result.0[0];
        assert_eq!(sp.il_offset, 1);
        assert_eq!(sp.start_line, 10);
        assert_eq!(sp.start_col, 2);
        assert_eq!(sp.end_line, 10);
        assert_eq!(sp.end_col, 7);
        assert!(!sp.is_hidden);
    }

    #[test]
    fn parse_multiple_sequence_points() {
        // second point: offset +2, line +1, column +1
        let blob: &[u8] = &[1, 10, 2, 0, 5, 2, 2, 2, 0, 2];
        let result = parse_sequence_points(blob).unwrap();
        assert_eq!(result.0.len(), 2);
        assert_eq!(result.0[1].il_offset, 3);
        assert_eq!(result.0[1].start_line, 11);
        assert_eq!(result.0[1].start_col, 3);
        assert_eq!(result.to_bytes().unwrap(), blob);
    }

    #[test]
    fn hidden_point() {
        let blob: &[u8] = &[0, 0xC0, 0xFE, 0xEF, 0xEE, 0, 0, 0];
        let result = parse_sequence_points(blob).unwrap();
        assert!(result.0[0].is_hidden);
    }

    #[test]
    fn remap_and_covering() {
        let points = parse_sequence_points(&[0, 10, 1, 0, 5, 4, 2, 0, 0, 5]).unwrap();
        let offsets = HashMap::from([(0, 0), (4, 30)]);
        let moved = points.remap(&offsets);

        assert_eq!(moved.0[1].il_offset, 30);
        assert_eq!(moved.0[1].start_line, 11);
        assert_eq!(moved.covering(29).map(|sp| sp.start_line), Some(10));
        assert_eq!(moved.covering(31).map(|sp| sp.start_line), Some(11));
    }

    #[test]
    fn truncated_blob() {
        assert!(parse_sequence_points(&[1, 10]).is_err());
    }
}
