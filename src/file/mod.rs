//! Raw input handling for module containers.
//!
//! A [`File`] owns the bytes of a container, either memory-mapped from disk through
//! [`memmap2`] or held in an owned buffer. Parsing happens on top of [`File::data`] with the
//! [`parser::Parser`] cursor; serialization goes through [`writer::Writer`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotshim::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("Demo.dshm"))?;
//! println!("{} bytes", file.len());
//! # Ok::<(), dotshim::Error>(())
//! ```

pub mod io;
pub mod parser;
pub mod writer;

use std::{fs, path::Path};

use memmap2::Mmap;

use crate::{Error, Result};

/// Storage behind a [`File`]. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

fn checked_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let Some(offset_end) = offset.checked_add(len) else {
        return Err(out_of_bounds_error!());
    };

    if offset_end > data.len() {
        return Err(out_of_bounds_error!());
    }

    Ok(&data[offset..offset_end])
}

/// Input backed by an owned buffer.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Create a new memory backend that takes ownership of `data`.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        checked_slice(&self.data, offset, len)
    }

    fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Input backed by a read-only memory mapping of a file on disk.
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Memory-map the file at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path)?;

        // The mapping is only ever read, and the container is copied into an owned model
        // before the file can be rewritten.
        let data = unsafe { Mmap::map(&file) }?;

        Ok(Physical { data })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        checked_slice(&self.data, offset, len)
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// The raw bytes of a loaded container.
pub struct File {
    data: Box<dyn Backend>,
}

impl File {
    /// Load a container from disk through a memory mapping.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] for I/O failures and [`crate::Error::Empty`] for
    /// zero-length files.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;
        if input.len() == 0 {
            return Err(Error::Empty);
        }

        Ok(File {
            data: Box::new(input),
        })
    }

    /// Wrap an owned buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for an empty buffer.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        Ok(File {
            data: Box::new(Memory::new(data)),
        })
    }

    /// Total size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the input is empty; never true for a successfully constructed `File`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// The whole input.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// A bounds-checked window into the input.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the input.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn memory_backend() {
        let mut data = vec![0xCC_u8; 64];
        data[10] = 0xBB;

        let memory = Memory::new(data);

        assert_eq!(memory.len(), 64);
        assert_eq!(memory.data_slice(8, 4).unwrap(), &[0xCC, 0xCC, 0xBB, 0xCC]);
        assert!(memory.data_slice(60, 8).is_err());
        assert!(memory.data_slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn physical_backend() {
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(&[1, 2, 3, 4, 5]).unwrap();
        temp.flush().unwrap();

        let file = File::from_file(temp.path()).unwrap();
        assert_eq!(file.len(), 5);
        assert_eq!(file.data_slice(1, 2).unwrap(), &[2, 3]);
    }

    #[test]
    fn empty_inputs_rejected() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Error::Empty)));

        let temp = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(File::from_file(temp.path()), Err(Error::Empty)));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            File::from_file(Path::new("/definitely/not/here.dshm")),
            Err(Error::FileError(_))
        ));
    }
}
