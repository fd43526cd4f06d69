use std::path::Path;

use crate::{error::Result, num_table::NumTable, str_table::StrTable};

/// How a table is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing table read-only.
    Read,
    /// Open an existing table for reading and writing.
    ReadWrite,
    /// Create a fresh empty table, discarding whatever was at the path.
    Create,
}

impl OpenMode {
    pub(crate) fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Precondition checked by `insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertMode {
    /// Insert or overwrite.
    #[default]
    Always,
    /// Overwrite only; fails with `KeyNotExists` if the key is absent.
    OnlyIfExisting,
    /// Insert only; fails with `KeyAlreadyExists` if the key is present.
    OnlyIfAbsent,
}

/// Precondition checked by `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    /// Deleting an absent key is a no-op.
    #[default]
    Always,
    /// Fails with `KeyNotExists` if the key is absent.
    OnlyIfExisting,
}

/// Builder for opening a table with RAM residency applied up front.
///
/// ```rust
/// use slottable::{OpenMode, TableOptions};
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut table = TableOptions::new()
///     .mode(OpenMode::Create)
///     .ram_data(true)
///     .ram_meta(true)
///     .open_str(dir.path().join("ponies"))
///     .unwrap();
/// assert_eq!(table.ram_mode().unwrap(), (true, true));
/// table.close().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub(crate) mode: OpenMode,
    pub(crate) ram_data: bool,
    pub(crate) ram_meta: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TableOptions {
    pub fn new() -> Self {
        Self {
            mode: OpenMode::ReadWrite,
            ram_data: false,
            ram_meta: false,
        }
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Keep the data file resident in RAM.
    pub fn ram_data(mut self, hold: bool) -> Self {
        self.ram_data = hold;
        self
    }

    /// Keep the index file resident in RAM.
    pub fn ram_meta(mut self, hold: bool) -> Self {
        self.ram_meta = hold;
        self
    }

    pub fn open_str(&self, path: impl AsRef<Path>) -> Result<StrTable> {
        StrTable::with_options(path, self)
    }

    pub fn open_num(&self, path: impl AsRef<Path>) -> Result<NumTable> {
        NumTable::with_options(path, self)
    }
}
