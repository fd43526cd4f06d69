//! Uniform access to one table file, whether it lives on disk or in RAM.
//!
//! Every table owns two regions: the data file holding record bytes and the
//! index file holding the meta header and the cell array. Record lookups are
//! two hops (cell, then record) and both hops go through the same
//! [`Region`] calls regardless of residency, so the table logic is written
//! once.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    mapping::MapCache,
};

/// A file handle that remembers where the OS cursor is, so sequential
/// accesses skip the seek syscall.
pub(crate) struct FileCursor {
    file: File,
    pos: Option<u64>,
}

impl FileCursor {
    pub(crate) fn new(file: File) -> Self {
        Self { file, pos: None }
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek_to(offset)?;
        let res = self.file.read_exact(buf);
        self.advance(offset, buf.len(), res)
    }

    pub(crate) fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek_to(offset)?;
        let res = self.file.write_all(buf);
        self.advance(offset, buf.len(), res)
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if self.pos != Some(offset) {
            tracing::trace!(from = ?self.pos, to = offset, "seek");
            self.pos = None;
            self.file.seek(SeekFrom::Start(offset))?;
            self.pos = Some(offset);
        }
        Ok(())
    }

    fn advance(&mut self, offset: u64, len: usize, res: io::Result<()>) -> io::Result<()> {
        // After a short read or write the OS cursor position is unknown.
        self.pos = match res {
            Ok(()) => Some(offset + len as u64),
            Err(_) => None,
        };
        res
    }
}

enum Backing {
    Disk { window: MapCache },
    Resident { buf: Vec<u8>, changed: bool },
}

pub(crate) struct Region {
    path: PathBuf,
    handle: FileCursor,
    size: u64,
    writable: bool,
    backing: Backing,
}

impl Region {
    /// Creates (or truncates) the file at `path`.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Error::create(path, source))?;

        Ok(Self::with_file(path, file, 0, true))
    }

    pub(crate) fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|source| Error::open(path, source))?;
        let size = file
            .metadata()
            .map_err(|source| Error::open(path, source))?
            .len();

        Ok(Self::with_file(path, file, size, writable))
    }

    fn with_file(path: &Path, file: File, size: u64, writable: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            handle: FileCursor::new(file),
            size,
            writable,
            backing: Backing::Disk {
                window: MapCache::new(),
            },
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn len(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_resident(&self) -> bool {
        matches!(self.backing, Backing::Resident { .. })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Copies `buf.len()` bytes at `offset` into `buf`.
    pub(crate) fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;

        match &self.backing {
            Backing::Resident { buf: resident, .. } => {
                let start = offset as usize;
                buf.copy_from_slice(&resident[start..start + buf.len()]);
            }
            Backing::Disk { .. } => self.handle.read_at(offset, buf)?,
        }
        Ok(())
    }

    /// Writes `data` at `offset`, growing the region when the write ends past
    /// the current end.
    pub(crate) fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::TooLarge("write offset"))?;

        match &mut self.backing {
            Backing::Resident { buf, changed } => {
                let end = usize::try_from(end).map_err(|_| Error::TooLarge("region size"))?;
                if end > buf.len() {
                    buf.try_reserve(end - buf.len())?;
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(data);
                *changed = true;
            }
            Backing::Disk { .. } => self.handle.write_at(offset, data)?,
        }

        self.size = self.size.max(end);
        Ok(())
    }

    /// Borrows `len` bytes at `offset` without copying when possible.
    ///
    /// The slice stays valid until the next call on this region.
    pub(crate) fn read_slice(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        self.check_bounds(offset, len)?;

        match &mut self.backing {
            Backing::Resident { buf, .. } => {
                let start = offset as usize;
                Ok(&buf[start..start + len])
            }
            // Writes go straight to the OS through `handle`, so there is no
            // user-space buffer to flush before the mapping looks at the file.
            Backing::Disk { window } => window.map(&mut self.handle, self.size, offset, len),
        }
    }

    /// Switches between RAM-resident and disk-resident access.
    ///
    /// Going resident reads the whole file; leaving residency writes the
    /// buffer back if it was modified.
    pub(crate) fn set_hold(&mut self, hold: bool) -> Result<()> {
        match (&self.backing, hold) {
            (Backing::Disk { .. }, true) => {
                let len = usize::try_from(self.size).map_err(|_| Error::TooLarge("region size"))?;
                let mut buf = Vec::new();
                buf.try_reserve_exact(len)?;
                buf.resize(len, 0);
                self.handle.read_at(0, &mut buf)?;

                tracing::debug!(path = %self.path.display(), bytes = len, "region is now RAM-resident");
                self.backing = Backing::Resident {
                    buf,
                    changed: false,
                };
            }
            (Backing::Resident { .. }, false) => {
                self.write_back()?;
                tracing::debug!(path = %self.path.display(), "region is now disk-resident");
                self.backing = Backing::Disk {
                    window: MapCache::new(),
                };
            }
            _ => {}
        }
        Ok(())
    }

    /// Pushes a dirty resident buffer to the file.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.write_back()
    }

    fn write_back(&mut self) -> Result<()> {
        if let Backing::Resident { buf, changed } = &mut self.backing {
            if *changed && self.writable {
                self.handle.write_at(0, buf)?;
                *changed = false;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_emulation(&mut self) {
        if let Backing::Disk { window } = &mut self.backing {
            *window = MapCache::emulated();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_on_disk() {
        let dir = tempdir().unwrap();
        let mut region = Region::create(&dir.path().join("r")).unwrap();

        region.write(0, b"hello").unwrap();
        region.write(5, b" world").unwrap();
        assert_eq!(region.len(), 11);

        let mut buf = [0u8; 5];
        region.read(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(region.read_slice(0, 11).unwrap(), b"hello world");
    }

    #[test]
    fn slice_sees_writes_made_after_mapping() {
        let dir = tempdir().unwrap();
        let mut region = Region::create(&dir.path().join("r")).unwrap();

        region.write(0, b"aaaa").unwrap();
        assert_eq!(region.read_slice(0, 4).unwrap(), b"aaaa");
        region.write(0, b"bb").unwrap();
        assert_eq!(region.read_slice(0, 4).unwrap(), b"bbaa");
        region.write(4, b"cc").unwrap();
        assert_eq!(region.read_slice(2, 4).unwrap(), b"aacc");
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let dir = tempdir().unwrap();
        let mut region = Region::create(&dir.path().join("r")).unwrap();
        region.write(0, b"1234").unwrap();

        let mut buf = [0u8; 2];
        assert!(matches!(
            region.read(3, &mut buf),
            Err(Error::OutOfBounds { offset: 3, len: 2, size: 4 })
        ));
        assert!(region.read_slice(5, 0).is_err());
        assert!(region.read_slice(4, 0).unwrap().is_empty());
    }

    #[test]
    fn resident_writes_are_written_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r");
        let mut region = Region::create(&path).unwrap();
        region.write(0, b"disk").unwrap();

        region.set_hold(true).unwrap();
        assert!(region.is_resident());
        region.write(4, b"+ram").unwrap();
        assert_eq!(region.read_slice(0, 8).unwrap(), b"disk+ram");
        // Not yet on disk.
        assert_eq!(std::fs::read(&path).unwrap(), b"disk");

        region.set_hold(false).unwrap();
        assert!(!region.is_resident());
        assert_eq!(std::fs::read(&path).unwrap(), b"disk+ram");
    }

    #[test]
    fn flush_keeps_residency() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r");
        let mut region = Region::create(&path).unwrap();
        region.set_hold(true).unwrap();
        region.write(0, b"abc").unwrap();
        region.flush().unwrap();
        assert!(region.is_resident());
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn read_only_region_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r");
        Region::create(&path).unwrap().write(0, b"x").unwrap();

        let mut region = Region::open(&path, false).unwrap();
        assert!(matches!(region.write(0, b"y"), Err(Error::ReadOnly)));

        // Holding and releasing a clean read-only region never writes.
        region.set_hold(true).unwrap();
        region.set_hold(false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn emulated_reads_match_mapped_reads() {
        let dir = tempdir().unwrap();
        let mut region = Region::create(&dir.path().join("r")).unwrap();
        let bytes: Vec<u8> = (0..=255).collect();
        region.write(0, &bytes).unwrap();

        let mapped = region.read_slice(17, 100).unwrap().to_vec();
        region.force_emulation();
        assert_eq!(region.read_slice(17, 100).unwrap(), mapped.as_slice());

        // The emulated path moved the cursor; a plain read must still land right.
        let mut buf = [0u8; 3];
        region.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2]);
    }

    #[test]
    fn open_missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        match Region::open(&path, true) {
            Err(Error::Open { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
