//! Machinery shared by both table flavours: file lifecycle, generations,
//! record I/O and the persisted counters.
//!
//! A table lives in two files, `<path>.dat<g>` and `<path>.idx<g>`, where the
//! generation `g` is `0` or `1`. Compaction builds the other generation next
//! to the live one and only then deletes the old files:
//!
//! 1. the new index is written as `<path>.idx<g>.tmp` together with its data
//!    file and closed,
//! 2. the `.tmp` index is renamed into place; from here on the new generation
//!    is complete,
//! 3. the old index is removed, then the old data file.
//!
//! Opening picks the generation whose index file exists. When both do, the
//! crash happened between steps 2 and 3, both are complete, and the smaller
//! (compacted) one wins.

use std::{
    ffi::OsString,
    fs, io,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    format::{
        align, encode_file_header, record_len, validate_header, Layout, MetaHeader,
        FILE_HEADER_LEN,
    },
    options::OpenMode,
    region::Region,
};

/// Which of the two alternating file sets holds the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    First,
    Second,
}

impl Generation {
    pub const BOTH: [Generation; 2] = [Generation::First, Generation::Second];

    pub fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }

    fn suffix(self) -> char {
        match self {
            Self::First => '0',
            Self::Second => '1',
        }
    }
}

fn suffixed(base: &Path, ext: &str, generation: Generation, tail: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(".");
    name.push(ext);
    name.push(generation.suffix().to_string());
    name.push(tail);
    PathBuf::from(name)
}

/// Data file of `generation` for the table at `base`.
pub fn data_path(base: &Path, generation: Generation) -> PathBuf {
    suffixed(base, "dat", generation, "")
}

/// Index file of `generation` for the table at `base`.
pub fn meta_path(base: &Path, generation: Generation) -> PathBuf {
    suffixed(base, "idx", generation, "")
}

pub(crate) fn staging_meta_path(base: &Path, generation: Generation) -> PathBuf {
    suffixed(base, "idx", generation, ".tmp")
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Picks the live generation at `base`, cleaning leftovers when writable.
fn resolve_generation(base: &Path, writable: bool) -> Result<Generation> {
    let live: Vec<Generation> = Generation::BOTH
        .into_iter()
        .filter(|generation| meta_path(base, *generation).exists())
        .collect();

    let chosen = match live.as_slice() {
        [] => {
            return Err(Error::open(
                meta_path(base, Generation::First),
                io::ErrorKind::NotFound.into(),
            ))
        }
        [only] => *only,
        _ => {
            let size = |generation| {
                fs::metadata(data_path(base, generation))
                    .map(|meta| meta.len())
                    .unwrap_or(u64::MAX)
            };
            if size(Generation::Second) < size(Generation::First) {
                Generation::Second
            } else {
                Generation::First
            }
        }
    };

    if writable {
        let stale = chosen.other();
        for path in [
            meta_path(base, stale),
            data_path(base, stale),
            staging_meta_path(base, stale),
            staging_meta_path(base, chosen),
        ] {
            if remove_if_exists(&path)? {
                tracing::warn!(path = %path.display(), "removed leftover of an interrupted optimize");
            }
        }
    }

    Ok(chosen)
}

/// Slot occupancy summary produced by a table's `check`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub live: u32,
    pub tombstones: u32,
    pub empty: u32,
    /// End of the furthest live record in the data file.
    pub data_end: u64,
}

pub(crate) struct Store<L: Layout> {
    base: PathBuf,
    generation: Generation,
    data: Region,
    meta: Region,
    writable: bool,
    pub(crate) header: MetaHeader,
    layout: PhantomData<L>,
}

impl<L: Layout> Store<L> {
    pub(crate) fn open(base: &Path, mode: OpenMode) -> Result<Self> {
        match mode {
            OpenMode::Create => {
                for generation in Generation::BOTH {
                    remove_if_exists(&meta_path(base, generation))?;
                    remove_if_exists(&data_path(base, generation))?;
                    remove_if_exists(&staging_meta_path(base, generation))?;
                }
                let generation = Generation::First;
                Self::create_files(
                    base,
                    generation,
                    &meta_path(base, generation),
                    L::INITIAL_CELLS,
                )
            }
            OpenMode::Read | OpenMode::ReadWrite => {
                let writable = mode.is_writable();
                let generation = resolve_generation(base, writable)?;
                Self::open_generation(base, generation, writable)
            }
        }
    }

    /// Creates the next generation's files under a staging index name.
    pub(crate) fn create_staging(&self, cells: u32) -> Result<Self> {
        let generation = self.generation.other();
        Self::create_files(
            &self.base,
            generation,
            &staging_meta_path(&self.base, generation),
            cells,
        )
    }

    fn create_files(
        base: &Path,
        generation: Generation,
        meta_file: &Path,
        cells: u32,
    ) -> Result<Self> {
        let mut data = Region::create(&data_path(base, generation))?;
        data.write(0, &encode_file_header(&L::DATA_SIGNATURE, L::VERSION))?;

        let header = MetaHeader::default();
        let mut meta = Region::create(meta_file)?;
        meta.write(0, &header.encode::<L>())?;
        if cells > 0 {
            let table = zeroed(cells as usize * L::CELL_LEN as usize)?;
            meta.write(L::META_HEADER_LEN, &table)?;
        }

        tracing::debug!(
            data = %data.path().display(),
            meta = %meta.path().display(),
            cells,
            "created table files"
        );

        Ok(Self {
            base: base.to_path_buf(),
            generation,
            data,
            meta,
            writable: true,
            header,
            layout: PhantomData,
        })
    }

    fn open_generation(base: &Path, generation: Generation, writable: bool) -> Result<Self> {
        let mut data = Region::open(&data_path(base, generation), writable)?;
        if data.len() < FILE_HEADER_LEN {
            return Err(Error::Signature(data.path().to_path_buf()));
        }
        let mut raw = [0u8; FILE_HEADER_LEN as usize];
        data.read(0, &mut raw)?;
        validate_header(&raw, &L::DATA_SIGNATURE, L::VERSION, data.path())?;

        let mut meta = Region::open(&meta_path(base, generation), writable)?;
        if meta.len() < L::META_HEADER_LEN {
            return Err(Error::Signature(meta.path().to_path_buf()));
        }
        let mut raw = vec![0u8; L::META_HEADER_LEN as usize];
        meta.read(0, &mut raw)?;
        validate_header(&raw, &L::META_SIGNATURE, L::VERSION, meta.path())?;
        let header = MetaHeader::decode::<L>(&raw);

        let table_bytes = meta.len() - L::META_HEADER_LEN;
        if table_bytes % L::CELL_LEN != 0 {
            return Err(Error::Corrupted(format!(
                "index '{}' holds a partial cell",
                meta.path().display()
            )));
        }
        let cells = table_bytes / L::CELL_LEN;
        if cells > u64::from(u32::MAX) || u64::from(header.count) > cells {
            return Err(Error::Corrupted(format!(
                "index '{}' claims {} entries in {} cells",
                meta.path().display(),
                header.count,
                cells
            )));
        }

        tracing::debug!(
            base = %base.display(),
            ?generation,
            writable,
            count = header.count,
            cells,
            "opened table"
        );

        Ok(Self {
            base: base.to_path_buf(),
            generation,
            data,
            meta,
            writable,
            header,
            layout: PhantomData,
        })
    }

    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    pub(crate) fn data_len(&self) -> u64 {
        self.data.len()
    }

    pub(crate) fn table_len(&self) -> u32 {
        // Bounded by the check in `open_generation` and by the growth paths.
        ((self.meta.len() - L::META_HEADER_LEN) / L::CELL_LEN) as u32
    }

    pub(crate) fn ram_mode(&self) -> (bool, bool) {
        (self.data.is_resident(), self.meta.is_resident())
    }

    pub(crate) fn set_ram_mode(&mut self, data: bool, meta: bool) -> Result<()> {
        self.data.set_hold(data)?;
        self.meta.set_hold(meta)
    }

    fn cell_pos(slot: u32) -> u64 {
        L::META_HEADER_LEN + u64::from(slot) * L::CELL_LEN
    }

    pub(crate) fn read_cell(&mut self, slot: u32, buf: &mut [u8]) -> Result<()> {
        self.meta.read(Self::cell_pos(slot), buf)
    }

    /// Writes one cell; writing past the end grows the table with empty cells.
    pub(crate) fn write_cell(&mut self, slot: u32, bytes: &[u8]) -> Result<()> {
        self.meta.write(Self::cell_pos(slot), bytes)
    }

    /// Copies out the whole cell array.
    pub(crate) fn read_table(&mut self) -> Result<Vec<u8>> {
        let mut table = zeroed(self.meta.len() as usize - L::META_HEADER_LEN as usize)?;
        self.meta.read(L::META_HEADER_LEN, &mut table)?;
        Ok(table)
    }

    /// Replaces the cell array with a larger one.
    pub(crate) fn write_table(&mut self, table: &[u8]) -> Result<()> {
        if (table.len() as u64) < self.meta.len() - L::META_HEADER_LEN {
            return Err(Error::InvalidArgument("index table cannot shrink".into()));
        }
        self.meta.write(L::META_HEADER_LEN, table)
    }

    /// Appends a record at the next aligned offset of the data file.
    ///
    /// The alignment gap is written out too, so the file always extends at
    /// least to the returned offset, even for an empty record.
    pub(crate) fn append_record(&mut self, key: &[u8], value: &[u8]) -> Result<u32> {
        let key_size = key.len() as u32;
        let end = self.data.len();
        let offset = align(end);
        let len = record_len(key_size, value.len() as u32);
        if offset + len > u64::from(u32::MAX) {
            return Err(Error::TooLarge("data file"));
        }

        let gap = (offset - end) as usize;
        let mut record = Vec::new();
        record.try_reserve_exact(gap + len as usize)?;
        record.resize(gap, 0);
        record.extend_from_slice(key);
        if !value.is_empty() {
            record.resize(gap + align(u64::from(key_size)) as usize, 0);
            record.extend_from_slice(value);
        }

        self.data.write(end, &record)?;
        Ok(offset as u32)
    }

    /// Overwrites the value of an existing record that has room for it.
    pub(crate) fn overwrite_value(&mut self, offset: u32, key_size: u32, value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        let at = u64::from(offset) + align(u64::from(key_size));
        self.data.write(at, value)
    }

    pub(crate) fn key(&mut self, offset: u32, key_size: u32) -> Result<&[u8]> {
        self.data.read_slice(u64::from(offset), key_size as usize)
    }

    pub(crate) fn value(&mut self, offset: u32, key_size: u32, data_size: u32) -> Result<&[u8]> {
        if data_size == 0 {
            return Ok(&[]);
        }
        let at = u64::from(offset) + align(u64::from(key_size));
        self.data.read_slice(at, data_size as usize)
    }

    /// Borrows key and value of a record with a single region access.
    pub(crate) fn record(
        &mut self,
        offset: u32,
        key_size: u32,
        data_size: u32,
    ) -> Result<(&[u8], &[u8])> {
        let len = record_len(key_size, data_size) as usize;
        let bytes = self.data.read_slice(u64::from(offset), len)?;
        let key = &bytes[..key_size as usize];
        let value = if data_size == 0 {
            &bytes[..0]
        } else {
            &bytes[align(u64::from(key_size)) as usize..]
        };
        Ok((key, value))
    }

    /// Persists counters and any dirty resident buffer.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let header = self.header.encode::<L>();
        self.meta.write(0, &header)?;
        self.data.flush()?;
        self.meta.flush()
    }

    pub(crate) fn close(mut self) -> Result<()> {
        self.flush()?;
        tracing::debug!(base = %self.base.display(), generation = ?self.generation, "closed table");
        Ok(())
    }

    /// Swaps in a fully built staging generation and deletes the old one.
    ///
    /// RAM residency carries over to the new generation.
    pub(crate) fn commit_staging(&mut self, staged: Store<L>) -> Result<()> {
        let generation = staged.generation;
        let staging = staged.meta.path().to_path_buf();
        staged.close()?;

        let target = meta_path(&self.base, generation);
        fs::rename(&staging, &target).map_err(|source| Error::create(&target, source))?;

        let (ram_data, ram_meta) = self.ram_mode();
        let mut fresh = Self::open_generation(&self.base, generation, true)?;
        fresh.set_ram_mode(ram_data, ram_meta)?;

        let old = std::mem::replace(self, fresh);
        let old_meta = old.meta.path().to_path_buf();
        let old_data = old.data.path().to_path_buf();
        drop(old);

        // The new generation is already live; a failure here only leaves
        // files behind that the next writable open removes.
        for path in [old_meta, old_data] {
            if let Err(err) = remove_if_exists(&path) {
                tracing::warn!(path = %path.display(), "failed to remove old generation: {err}");
            }
        }

        tracing::debug!(base = %self.base.display(), ?generation, "switched generation");
        Ok(())
    }

    /// Deletes a staging generation that could not be completed.
    pub(crate) fn abandon(self) {
        let meta = self.meta.path().to_path_buf();
        let data = self.data.path().to_path_buf();
        drop(self);
        for path in [meta, data] {
            if let Err(err) = remove_if_exists(&path) {
                tracing::warn!(path = %path.display(), "failed to remove abandoned file: {err}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_emulation(&mut self) {
        self.data.force_emulation();
        self.meta.force_emulation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{NumLayout, StrLayout};
    use tempfile::tempdir;

    #[test]
    fn file_names_carry_generation() {
        let base = Path::new("/tmp/db");
        assert_eq!(data_path(base, Generation::First), Path::new("/tmp/db.dat0"));
        assert_eq!(meta_path(base, Generation::Second), Path::new("/tmp/db.idx1"));
        assert_eq!(
            staging_meta_path(base, Generation::Second),
            Path::new("/tmp/db.idx1.tmp")
        );
        assert_eq!(Generation::First.other(), Generation::Second);
    }

    #[test]
    fn create_writes_headers_and_initial_table() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        let store = Store::<StrLayout>::open(&base, OpenMode::Create).unwrap();
        assert_eq!(store.table_len(), 1);
        assert_eq!(store.data_len(), FILE_HEADER_LEN);
        store.close().unwrap();

        let data = fs::read(data_path(&base, Generation::First)).unwrap();
        assert_eq!(&data, b"SLTSTRD\x01");
        let meta = fs::read(meta_path(&base, Generation::First)).unwrap();
        assert_eq!(meta.len(), 20 + 12);
        assert_eq!(&meta[..8], b"SLTSTRM\x01");
    }

    #[test]
    fn counters_survive_reopen() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        let mut store = Store::<NumLayout>::open(&base, OpenMode::Create).unwrap();
        store.header.count = 4;
        store.header.used = 40;
        store.write_cell(3, &[0u8; 8]).unwrap();
        store.close().unwrap();

        let store = Store::<NumLayout>::open(&base, OpenMode::Read).unwrap();
        assert_eq!(store.header.count, 4);
        assert_eq!(store.header.used, 40);
        assert_eq!(store.table_len(), 4);
        assert!(!store.is_writable());
    }

    #[test]
    fn records_are_aligned_and_split() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        let mut store = Store::<StrLayout>::open(&base, OpenMode::Create).unwrap();

        let first = store.append_record(b"abc", b"12345").unwrap();
        assert_eq!(first, 8);
        let second = store.append_record(b"k", b"").unwrap();
        assert_eq!(second, 8 + 4 + 5 + 3);
        let third = store.append_record(b"key", b"v").unwrap();
        assert_eq!(third, 24);

        assert_eq!(store.record(first, 3, 5).unwrap(), (&b"abc"[..], &b"12345"[..]));
        assert_eq!(store.record(second, 1, 0).unwrap(), (&b"k"[..], &b""[..]));
        assert_eq!(store.value(third, 3, 1).unwrap(), b"v");

        store.overwrite_value(first, 3, b"xy").unwrap();
        assert_eq!(store.value(first, 3, 2).unwrap(), b"xy");
        assert_eq!(store.key(first, 3).unwrap(), b"abc");
    }

    #[test]
    fn wrong_flavour_is_rejected() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        Store::<StrLayout>::open(&base, OpenMode::Create)
            .unwrap()
            .close()
            .unwrap();

        assert!(matches!(
            Store::<NumLayout>::open(&base, OpenMode::ReadWrite),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn missing_table_fails_to_open() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("nothing");
        assert!(matches!(
            Store::<StrLayout>::open(&base, OpenMode::Read),
            Err(Error::Open { .. })
        ));
    }

    #[test]
    fn partial_cell_is_corruption() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");
        Store::<StrLayout>::open(&base, OpenMode::Create)
            .unwrap()
            .close()
            .unwrap();

        let path = meta_path(&base, Generation::First);
        let mut meta = fs::read(&path).unwrap();
        meta.push(0);
        fs::write(&path, meta).unwrap();

        assert!(matches!(
            Store::<StrLayout>::open(&base, OpenMode::Read),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn both_generations_prefer_the_smaller_and_clean_up() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");

        let mut first = Store::<StrLayout>::open(&base, OpenMode::Create).unwrap();
        first.append_record(b"garbage", b"garbage").unwrap();
        let staged = first.create_staging(1).unwrap();
        staged.close().unwrap();
        first.close().unwrap();
        // Simulate a crash right after the staging index was renamed.
        fs::rename(
            staging_meta_path(&base, Generation::Second),
            meta_path(&base, Generation::Second),
        )
        .unwrap();

        let store = Store::<StrLayout>::open(&base, OpenMode::Read).unwrap();
        assert_eq!(store.generation(), Generation::Second);
        assert!(meta_path(&base, Generation::First).exists());
        drop(store);

        let store = Store::<StrLayout>::open(&base, OpenMode::ReadWrite).unwrap();
        assert_eq!(store.generation(), Generation::Second);
        assert!(!meta_path(&base, Generation::First).exists());
        assert!(!data_path(&base, Generation::First).exists());
    }

    #[test]
    fn unfinished_staging_is_ignored_and_removed() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t");

        let first = Store::<StrLayout>::open(&base, OpenMode::Create).unwrap();
        let staged = first.create_staging(4).unwrap();
        drop(staged);
        first.close().unwrap();

        let store = Store::<StrLayout>::open(&base, OpenMode::ReadWrite).unwrap();
        assert_eq!(store.generation(), Generation::First);
        assert!(!staging_meta_path(&base, Generation::Second).exists());
        assert!(!data_path(&base, Generation::Second).exists());
    }
}
