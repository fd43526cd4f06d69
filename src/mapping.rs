//! Windowed read-only mapping of a table file.
//!
//! A [`MapCache`] keeps at most one mapped window of a file. A request that
//! falls inside the window is served straight from the mapping; anything else
//! drops the window and maps a new one around the request. When the OS refuses
//! to map (exotic filesystems, platforms without the facility) the cache
//! degrades to reading the requested bytes into a scratch buffer.
//!
//! Returned slices borrow the cache mutably, so the borrow checker guarantees
//! that a slice is gone before the next call can unmap or overwrite it.

use memmap2::{Mmap, MmapOptions};

use crate::{
    error::{Error, Result},
    region::FileCursor,
};

/// Window boundaries are aligned to this. 64 KiB satisfies both the page size
/// on common Unix targets and the allocation granularity on Windows.
pub(crate) const WINDOW_ALIGN: u64 = 64 * 1024;

/// Smallest window worth mapping; avoids remapping on every short hop.
pub(crate) const MIN_WINDOW: u64 = 1024 * 1024;

struct Window {
    low: u64,
    map: Mmap,
}

impl Window {
    fn contains(&self, offset: u64, end: u64) -> bool {
        self.low <= offset && end <= self.low + self.map.len() as u64
    }
}

pub(crate) struct MapCache {
    window: Option<Window>,
    scratch: Vec<u8>,
    emulate: bool,
}

impl MapCache {
    pub(crate) fn new() -> Self {
        Self {
            window: None,
            scratch: Vec::new(),
            emulate: false,
        }
    }

    /// A cache that never maps and always goes through seek+read.
    #[cfg(test)]
    pub(crate) fn emulated() -> Self {
        Self {
            emulate: true,
            ..Self::new()
        }
    }

    /// Returns `len` bytes of the file starting at `offset`.
    ///
    /// `file_len` is the current logical length of the file; the caller has
    /// already checked that `offset + len <= file_len`.
    pub(crate) fn map<'a>(
        &'a mut self,
        handle: &mut FileCursor,
        file_len: u64,
        offset: u64,
        len: usize,
    ) -> Result<&'a [u8]> {
        if len == 0 {
            return Ok(&[]);
        }
        let end = offset + len as u64;

        let hit = self
            .window
            .as_ref()
            .is_some_and(|window| window.contains(offset, end));

        if !hit && !self.emulate {
            if let Err(err) = self.remap(handle, file_len, offset, end) {
                tracing::warn!(
                    offset,
                    len,
                    "mapping failed, falling back to read emulation: {err}"
                );
                self.emulate = true;
            }
        }

        let start = match &self.window {
            Some(window) if window.contains(offset, end) => Some((offset - window.low) as usize),
            _ => None,
        };

        match start {
            Some(start) => self
                .window
                .as_ref()
                .map(|window| &window.map[start..start + len])
                .ok_or_else(|| Error::Corrupted("mapping window vanished".into())),
            None => self.read_into_scratch(handle, offset, len),
        }
    }

    fn remap(
        &mut self,
        handle: &FileCursor,
        file_len: u64,
        offset: u64,
        end: u64,
    ) -> std::io::Result<()> {
        // Unmap before mapping the replacement so at most one window is live.
        self.window = None;

        let low = offset / WINDOW_ALIGN * WINDOW_ALIGN;
        let high = end
            .max(low + MIN_WINDOW)
            .div_ceil(WINDOW_ALIGN)
            .saturating_mul(WINDOW_ALIGN)
            .min(file_len);

        tracing::trace!(low, high, "remapping window");

        // SAFETY: the mapping is read-only and the file is owned by this table
        // for its whole lifetime. The table is the only writer and every write
        // goes through the same handle, so the shared page cache keeps the
        // window coherent. Slices handed out borrow `self` mutably and cannot
        // outlive the next remap.
        let map = unsafe {
            MmapOptions::new()
                .offset(low)
                .len((high - low) as usize)
                .map(handle.file())?
        };

        self.window = Some(Window { low, map });
        Ok(())
    }

    fn read_into_scratch(
        &mut self,
        handle: &mut FileCursor,
        offset: u64,
        len: usize,
    ) -> Result<&[u8]> {
        if self.scratch.len() < len {
            self.scratch.try_reserve(len - self.scratch.len())?;
            self.scratch.resize(len, 0);
        }

        handle
            .read_at(offset, &mut self.scratch[..len])
            .map_err(|source| Error::Map {
                offset,
                len,
                source,
            })?;

        Ok(&self.scratch[..len])
    }
}
