//! Integer keyed table.
//!
//! The key is the cell index itself: no hashing, no probing and no
//! tombstones. The index holds `highest index inserted + 1` cells and a cell
//! with `offset == 0` marks an absent key. Records are bare values.

use std::path::Path;

use crate::{
    error::{Error, Result},
    format::{record_len, NumCell, NumLayout, MAX_PACKED_SIZE},
    options::{DeleteMode, InsertMode, OpenMode, TableOptions},
    store::{CheckReport, Generation, Store},
};

fn read_cell(store: &mut Store<NumLayout>, index: u32) -> Result<NumCell> {
    if index >= store.table_len() {
        return Ok(NumCell::default());
    }
    let mut raw = [0u8; NumCell::LEN];
    store.read_cell(index, &mut raw)?;
    Ok(NumCell::decode(&raw))
}

/// Embedded key-value table addressed by `u32` index.
///
/// ```rust
/// use slottable::{InsertMode, NumTable, OpenMode};
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut table = NumTable::open(dir.path().join("ponies"), OpenMode::Create).unwrap();
///
/// table.insert(2, b"Scootaloo", InsertMode::Always).unwrap();
/// assert_eq!(table.table_size().unwrap(), 3);
/// assert_eq!(table.read(2).unwrap(), b"Scootaloo");
/// assert!(table.read(1).unwrap_err().is_not_found());
/// ```
pub struct NumTable {
    store: Option<Store<NumLayout>>,
}

impl NumTable {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::with_options(path, &TableOptions::new().mode(mode))
    }

    pub fn with_options(path: impl AsRef<Path>, options: &TableOptions) -> Result<Self> {
        let mut store = Store::<NumLayout>::open(path.as_ref(), options.mode)?;
        store.set_ram_mode(options.ram_data, options.ram_meta)?;
        Ok(Self { store: Some(store) })
    }

    fn store(&self) -> Result<&Store<NumLayout>> {
        self.store.as_ref().ok_or(Error::NotInited)
    }

    fn store_mut(&mut self) -> Result<&mut Store<NumLayout>> {
        self.store.as_mut().ok_or(Error::NotInited)
    }

    pub fn probe(&mut self, index: u32) -> Result<()> {
        if read_cell(self.store_mut()?, index)?.is_live() {
            Ok(())
        } else {
            Err(Error::KeyNotExists)
        }
    }

    pub fn contains(&mut self, index: u32) -> Result<bool> {
        Ok(read_cell(self.store_mut()?, index)?.is_live())
    }

    /// Borrows the value stored at `index`.
    pub fn read(&mut self, index: u32) -> Result<&[u8]> {
        let store = self.store_mut()?;
        let cell = read_cell(store, index)?;
        if !cell.is_live() {
            return Err(Error::KeyNotExists);
        }
        store.value(cell.offset, 0, cell.size)
    }

    /// Same as [`read`](Self::read); the index already is the slot.
    pub fn read_direct(&mut self, index: u32) -> Result<&[u8]> {
        self.read(index)
    }

    pub fn insert(&mut self, index: u32, value: &[u8], mode: InsertMode) -> Result<()> {
        let store = self.store_mut()?;
        store.require_writable()?;
        // The index must hold `index + 1` cells.
        if index == u32::MAX {
            return Err(Error::TooLarge("index"));
        }
        let size = u32::try_from(value.len())
            .ok()
            .filter(|size| *size <= MAX_PACKED_SIZE)
            .ok_or(Error::TooLarge("value"))?;

        let old = read_cell(store, index)?;
        let found = old.is_live();
        match (mode, found) {
            (InsertMode::OnlyIfExisting, false) => return Err(Error::KeyNotExists),
            (InsertMode::OnlyIfAbsent, true) => return Err(Error::KeyAlreadyExists),
            _ => {}
        }

        let cell = if found && old.size >= size {
            store.overwrite_value(old.offset, 0, value)?;
            NumCell { size, ..old }
        } else {
            NumCell {
                offset: store.append_record(&[], value)?,
                size,
                deleted: false,
            }
        };
        // Writing past the end grows the index with absent cells.
        store.write_cell(index, &cell.encode())?;

        let header = &mut store.header;
        if found {
            header.used = header.used.saturating_sub(old.size).saturating_add(size);
        } else {
            header.count += 1;
            header.used = header.used.saturating_add(size);
        }
        Ok(())
    }

    /// Clears the cell at `index`. The record bytes stay until optimize.
    pub fn delete(&mut self, index: u32, mode: DeleteMode) -> Result<()> {
        let store = self.store_mut()?;
        store.require_writable()?;

        let old = read_cell(store, index)?;
        if !old.is_live() {
            return match mode {
                DeleteMode::Always => Ok(()),
                DeleteMode::OnlyIfExisting => Err(Error::KeyNotExists),
            };
        }

        store.write_cell(index, &NumCell::default().encode())?;
        let header = &mut store.header;
        header.count = header.count.saturating_sub(1);
        header.used = header.used.saturating_sub(old.size);
        Ok(())
    }

    /// Rewrites the table into the other generation. The index shrinks to the
    /// highest live index and unreferenced record bytes are dropped.
    pub fn optimize(&mut self) -> Result<()> {
        let store = self.store_mut()?;
        store.require_writable()?;

        let (ram_data, ram_meta) = store.ram_mode();
        let mut staged = NumTable {
            store: Some(store.create_staging(0)?),
        };
        staged.set_ram_mode(ram_data, ram_meta)?;

        let copied = (0..store.table_len()).try_for_each(|index| {
            let cell = read_cell(store, index)?;
            if !cell.is_live() {
                return Ok(());
            }
            let value = store.value(cell.offset, 0, cell.size)?;
            staged.insert(index, value, InsertMode::Always)
        });

        let staged = staged.store.take().ok_or(Error::NotInited)?;
        if let Err(err) = copied {
            staged.abandon();
            return Err(err);
        }

        let before = store.data_len();
        store.commit_staging(staged)?;
        tracing::debug!(
            before,
            after = store.data_len(),
            count = store.header.count,
            "optimized number table"
        );
        Ok(())
    }

    pub fn set_ram_mode(&mut self, hold_data: bool, hold_meta: bool) -> Result<()> {
        self.store_mut()?.set_ram_mode(hold_data, hold_meta)
    }

    pub fn ram_mode(&self) -> Result<(bool, bool)> {
        Ok(self.store()?.ram_mode())
    }

    /// Calls `f` for every live entry in index order.
    pub fn for_each(&mut self, mut f: impl FnMut(u32, &[u8])) -> Result<()> {
        for index in 0..self.table_size()? {
            match self.read(index) {
                Ok(value) => f(index, value),
                Err(Error::KeyNotExists) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn check(&mut self) -> Result<CheckReport> {
        let store = self.store_mut()?;
        let data_len = store.data_len();
        let table = store.read_table()?;

        let mut report = CheckReport::default();
        for (index, raw) in table.chunks_exact(NumCell::LEN).enumerate() {
            let cell = NumCell::decode(raw);
            if !cell.is_live() {
                report.empty += 1;
                continue;
            }
            let end = u64::from(cell.offset) + record_len(0, cell.size);
            if end > data_len {
                return Err(Error::Corrupted(format!(
                    "index {index} points past the end of the data file ({end} > {data_len})"
                )));
            }
            report.live += 1;
            report.data_end = report.data_end.max(end);
        }

        if report.live != store.header.count {
            return Err(Error::Corrupted(format!(
                "header counts {} entries, index holds {}",
                store.header.count, report.live
            )));
        }
        Ok(report)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.store_mut()?.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.store.take().ok_or(Error::NotInited)?.close()
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_none()
    }

    pub fn count(&self) -> Result<u32> {
        Ok(self.store()?.header.count)
    }

    /// Number of index cells, i.e. highest index ever inserted plus one.
    pub fn table_size(&self) -> Result<u32> {
        Ok(self.store()?.table_len())
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(self.store()?.data_len())
    }

    pub fn used_size(&self) -> Result<u32> {
        Ok(self.store()?.header.used)
    }

    pub fn generation(&self) -> Result<Generation> {
        Ok(self.store()?.generation())
    }

    pub fn is_writable(&self) -> Result<bool> {
        Ok(self.store()?.is_writable())
    }
}

impl Drop for NumTable {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(err) = store.close() {
                tracing::warn!("failed to close number table: {err}");
            }
        }
    }
}
