//! Byte-string keyed table backed by a persistent open-addressing index.
//!
//! The index is a power-of-two array of [`StrCell`]s stored after the meta
//! header. A key's home slot is its FNV-1a hash masked to the table length;
//! collisions probe linearly. Deleting leaves a tombstone that keeps probe
//! chains intact until the next rehash or optimize.
//!
//! After any insert that adds a live entry the table doubles whenever
//! `2 * (count + delcount) > table_len`, which keeps the load factor at or
//! below one half.

use std::path::Path;

use crate::{
    error::{Error, Result},
    format::{record_len, StrCell, StrLayout, MAX_PACKED_SIZE},
    hash::bucket,
    options::{DeleteMode, InsertMode, OpenMode, TableOptions},
    store::{CheckReport, Generation, Store},
};

/// A live entry borrowed from a table.
///
/// Both slices stay valid until the next call on the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Outcome of walking a probe chain.
struct Probe {
    slot: u32,
    cell: StrCell,
    found: bool,
}

fn read_cell(store: &mut Store<StrLayout>, slot: u32) -> Result<StrCell> {
    let mut raw = [0u8; StrCell::LEN];
    store.read_cell(slot, &mut raw)?;
    Ok(StrCell::decode(&raw))
}

/// Locates `key`, or the slot an insert of `key` should use.
///
/// The first tombstone on the chain is remembered and preferred over the
/// terminating empty slot, but probing continues past it because a live copy
/// of the key may sit further along.
fn find(store: &mut Store<StrLayout>, key: &[u8]) -> Result<Probe> {
    let len = store.table_len();
    let mask = len - 1;
    let mut slot = bucket(key, len);
    let mut reusable: Option<(u32, StrCell)> = None;

    for _ in 0..len {
        let cell = read_cell(store, slot)?;

        if cell.is_empty() {
            let (slot, cell) = reusable.unwrap_or((slot, cell));
            return Ok(Probe {
                slot,
                cell,
                found: false,
            });
        }

        if cell.deleted {
            if reusable.is_none() {
                reusable = Some((slot, cell));
            }
        } else if cell.key_size as usize == key.len() && store.key(cell.offset, cell.key_size)? == key
        {
            return Ok(Probe {
                slot,
                cell,
                found: true,
            });
        }

        slot = (slot + 1) & mask;
    }

    // Every slot is occupied; only a tombstone can take the key.
    match reusable {
        Some((slot, cell)) => Ok(Probe {
            slot,
            cell,
            found: false,
        }),
        None => Err(Error::Corrupted("index has no free slot".into())),
    }
}

/// Smallest table length that holds `entries` within the load limit.
fn table_len_for(entries: u32) -> Result<u32> {
    entries
        .checked_mul(2)
        .and_then(|n| n.max(1).checked_next_power_of_two())
        .ok_or(Error::TooLarge("index table"))
}

/// Embedded key-value table with byte-string keys.
///
/// ```rust
/// use slottable::{DeleteMode, InsertMode, OpenMode, StrTable};
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut table = StrTable::open(dir.path().join("ponies"), OpenMode::Create).unwrap();
///
/// table.insert(b"princess", b"Luna", InsertMode::Always).unwrap();
/// assert_eq!(table.read(b"princess").unwrap(), b"Luna");
///
/// table.delete(b"princess", DeleteMode::OnlyIfExisting).unwrap();
/// assert!(table.read(b"princess").unwrap_err().is_not_found());
/// table.close().unwrap();
/// ```
pub struct StrTable {
    store: Option<Store<StrLayout>>,
}

impl StrTable {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::with_options(path, &TableOptions::new().mode(mode))
    }

    pub fn with_options(path: impl AsRef<Path>, options: &TableOptions) -> Result<Self> {
        let mut store = Store::<StrLayout>::open(path.as_ref(), options.mode)?;

        let len = store.table_len();
        if !len.is_power_of_two() {
            return Err(Error::Corrupted(format!(
                "index length {len} is not a power of two"
            )));
        }
        store.set_ram_mode(options.ram_data, options.ram_meta)?;

        Ok(Self { store: Some(store) })
    }

    fn store(&self) -> Result<&Store<StrLayout>> {
        self.store.as_ref().ok_or(Error::NotInited)
    }

    fn store_mut(&mut self) -> Result<&mut Store<StrLayout>> {
        self.store.as_mut().ok_or(Error::NotInited)
    }

    /// Succeeds when `key` is present, fails with `KeyNotExists` otherwise.
    pub fn probe(&mut self, key: &[u8]) -> Result<()> {
        let store = self.store_mut()?;
        if find(store, key)?.found {
            Ok(())
        } else {
            Err(Error::KeyNotExists)
        }
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        match self.probe(key) {
            Ok(()) => Ok(true),
            Err(Error::KeyNotExists) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Borrows the value stored for `key`.
    ///
    /// When the data file is disk-resident the slice points into a mapped
    /// window; the borrow ends before the next call can move that window.
    /// Reads need exclusive access in RAM mode as well.
    pub fn read(&mut self, key: &[u8]) -> Result<&[u8]> {
        let store = self.store_mut()?;
        let probe = find(store, key)?;
        if !probe.found {
            return Err(Error::KeyNotExists);
        }
        let cell = probe.cell;
        store.value(cell.offset, cell.key_size, cell.data_size)
    }

    /// Reads the entry at table slot `slot` without hashing.
    ///
    /// Empty slots and tombstones report `KeyNotExists`; iterate
    /// `0..table_size()` to enumerate all entries.
    pub fn read_direct(&mut self, slot: u32) -> Result<Entry<'_>> {
        let store = self.store_mut()?;
        if slot >= store.table_len() {
            return Err(Error::InvalidArgument(format!(
                "slot {slot} is outside a table of {} cells",
                store.table_len()
            )));
        }
        let cell = read_cell(store, slot)?;
        if !cell.is_live() {
            return Err(Error::KeyNotExists);
        }
        let (key, value) = store.record(cell.offset, cell.key_size, cell.data_size)?;
        Ok(Entry { key, value })
    }

    /// Stores `value` under `key`, subject to `mode`.
    ///
    /// An existing record whose value area is large enough is overwritten in
    /// place. Otherwise a new record is appended and the old bytes are left
    /// for [`optimize`](Self::optimize) to reclaim. A slot freed by a delete
    /// is reused for the new key but its record bytes never are.
    pub fn insert(&mut self, key: &[u8], value: &[u8], mode: InsertMode) -> Result<()> {
        let store = self.store_mut()?;
        store.require_writable()?;
        if key.len() > MAX_PACKED_SIZE as usize {
            return Err(Error::TooLarge("key"));
        }
        let data_size = u32::try_from(value.len()).map_err(|_| Error::TooLarge("value"))?;
        let key_size = key.len() as u32;

        let probe = find(store, key)?;
        match (mode, probe.found) {
            (InsertMode::OnlyIfExisting, false) => return Err(Error::KeyNotExists),
            (InsertMode::OnlyIfAbsent, true) => return Err(Error::KeyAlreadyExists),
            _ => {}
        }

        if probe.found {
            let old = probe.cell;
            let cell = if old.data_size >= data_size {
                store.overwrite_value(old.offset, old.key_size, value)?;
                StrCell { data_size, ..old }
            } else {
                let offset = store.append_record(key, value)?;
                StrCell {
                    offset,
                    key_size,
                    data_size,
                    deleted: false,
                }
            };
            store.write_cell(probe.slot, &cell.encode())?;

            let header = &mut store.header;
            header.used = header.used.saturating_sub(old.data_size).saturating_add(data_size);
            return Ok(());
        }

        let offset = store.append_record(key, value)?;
        let cell = StrCell {
            offset,
            key_size,
            data_size,
            deleted: false,
        };
        store.write_cell(probe.slot, &cell.encode())?;

        let header = &mut store.header;
        header.count += 1;
        if probe.cell.deleted {
            header.delcount = header.delcount.saturating_sub(1);
        }
        header.used = header.used.saturating_add(key_size).saturating_add(data_size);

        let occupied = u64::from(header.count) + u64::from(header.delcount);
        let len = store.table_len();
        if 2 * occupied > u64::from(len) {
            let doubled = len.checked_mul(2).ok_or(Error::TooLarge("index table"))?;
            rehash(store, doubled)?;
        }
        Ok(())
    }

    /// Removes `key`, leaving a tombstone in its slot.
    pub fn delete(&mut self, key: &[u8], mode: DeleteMode) -> Result<()> {
        let store = self.store_mut()?;
        store.require_writable()?;

        let probe = find(store, key)?;
        if !probe.found {
            return match mode {
                DeleteMode::Always => Ok(()),
                DeleteMode::OnlyIfExisting => Err(Error::KeyNotExists),
            };
        }

        let cell = StrCell {
            deleted: true,
            ..probe.cell
        };
        store.write_cell(probe.slot, &cell.encode())?;

        let header = &mut store.header;
        header.count = header.count.saturating_sub(1);
        header.delcount = header.delcount.saturating_add(1);
        header.used = header
            .used
            .saturating_sub(cell.key_size)
            .saturating_sub(cell.data_size);
        Ok(())
    }

    /// Rewrites the table into the other generation, dropping tombstones and
    /// every byte no live entry refers to.
    pub fn optimize(&mut self) -> Result<()> {
        let store = self.store_mut()?;
        store.require_writable()?;

        let cells = table_len_for(store.header.count)?;
        let (ram_data, ram_meta) = store.ram_mode();
        let mut staged = StrTable {
            store: Some(store.create_staging(cells)?),
        };
        staged.set_ram_mode(ram_data, ram_meta)?;

        let copied = (0..store.table_len()).try_for_each(|slot| {
            let cell = read_cell(store, slot)?;
            if !cell.is_live() {
                return Ok(());
            }
            let (key, value) = store.record(cell.offset, cell.key_size, cell.data_size)?;
            staged.insert(key, value, InsertMode::Always)
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
            "optimized string table"
        );
        Ok(())
    }

    /// Independently moves the data and index files into or out of RAM.
    pub fn set_ram_mode(&mut self, hold_data: bool, hold_meta: bool) -> Result<()> {
        self.store_mut()?.set_ram_mode(hold_data, hold_meta)
    }

    /// `(data, index)` residency.
    pub fn ram_mode(&self) -> Result<(bool, bool)> {
        Ok(self.store()?.ram_mode())
    }

    /// Calls `f` for every live entry in slot order.
    pub fn for_each(&mut self, mut f: impl FnMut(&[u8], &[u8])) -> Result<()> {
        let len = self.table_size()?;
        for slot in 0..len {
            match self.read_direct(slot) {
                Ok(entry) => f(entry.key, entry.value),
                Err(Error::KeyNotExists) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Scans every cell and cross-checks it against the header and data file.
    pub fn check(&mut self) -> Result<CheckReport> {
        let store = self.store_mut()?;
        let data_len = store.data_len();
        let table = store.read_table()?;

        let mut report = CheckReport::default();
        for (slot, raw) in table.chunks_exact(StrCell::LEN).enumerate() {
            let cell = StrCell::decode(raw);
            if cell.is_empty() {
                report.empty += 1;
                continue;
            }
            let end = u64::from(cell.offset) + record_len(cell.key_size, cell.data_size);
            if end > data_len {
                return Err(Error::Corrupted(format!(
                    "slot {slot} points past the end of the data file ({end} > {data_len})"
                )));
            }
            if cell.deleted {
                report.tombstones += 1;
            } else {
                report.live += 1;
                report.data_end = report.data_end.max(end);
            }
        }

        if report.live != store.header.count {
            return Err(Error::Corrupted(format!(
                "header counts {} entries, index holds {}",
                store.header.count, report.live
            )));
        }
        Ok(report)
    }

    /// Persists counters and dirty resident buffers without closing.
    pub fn flush(&mut self) -> Result<()> {
        self.store_mut()?.flush()
    }

    /// Flushes and releases the files. Later calls fail with `NotInited`.
    pub fn close(&mut self) -> Result<()> {
        self.store.take().ok_or(Error::NotInited)?.close()
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_none()
    }

    /// Live entries.
    pub fn count(&self) -> Result<u32> {
        Ok(self.store()?.header.count)
    }

    /// Tombstones awaiting the next rehash or optimize.
    pub fn delcount(&self) -> Result<u32> {
        Ok(self.store()?.header.delcount)
    }

    /// Number of index cells.
    pub fn table_size(&self) -> Result<u32> {
        Ok(self.store()?.table_len())
    }

    /// Length of the data file in bytes, header included.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.store()?.data_len())
    }

    /// Key and value bytes of live entries.
    pub fn used_size(&self) -> Result<u32> {
        Ok(self.store()?.header.used)
    }

    pub fn generation(&self) -> Result<Generation> {
        Ok(self.store()?.generation())
    }

    pub fn is_writable(&self) -> Result<bool> {
        Ok(self.store()?.is_writable())
    }

    #[cfg(test)]
    pub(crate) fn force_emulation(&mut self) {
        if let Some(store) = self.store.as_mut() {
            store.force_emulation();
        }
    }
}

/// Rebuilds the index with `new_len` cells, dropping tombstones.
///
/// Record bytes stay where they are; only cells move.
fn rehash(store: &mut Store<StrLayout>, new_len: u32) -> Result<()> {
    let old_len = store.table_len();
    let table = store.read_table()?;

    let mut cells = Vec::new();
    cells.try_reserve_exact(new_len as usize)?;
    cells.resize(new_len as usize, StrCell::default());
    let mask = new_len - 1;

    for raw in table.chunks_exact(StrCell::LEN) {
        let cell = StrCell::decode(raw);
        if !cell.is_live() {
            continue;
        }
        let key = store.key(cell.offset, cell.key_size)?;
        let mut slot = bucket(key, new_len);
        while !cells[slot as usize].is_empty() {
            slot = (slot + 1) & mask;
        }
        cells[slot as usize] = cell;
    }

    let mut encoded = Vec::new();
    encoded.try_reserve_exact(new_len as usize * StrCell::LEN)?;
    for cell in &cells {
        encoded.extend_from_slice(&cell.encode());
    }
    store.write_table(&encoded)?;
    store.header.delcount = 0;

    tracing::debug!(old_len, new_len, count = store.header.count, "rehashed index");
    Ok(())
}

impl Drop for StrTable {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(err) = store.close() {
                tracing::warn!("failed to close string table: {err}");
            }
        }
    }
}
