//! On-disk layout of table files.
//!
//! Data file: `[file header][record]*`. The header is a 7-byte ASCII
//! signature followed by a version byte. Records carry no framing of their
//! own: a record is the key bytes, zero padding up to the next 4-byte
//! boundary, then the value bytes. Sizes live only in the index cell.
//!
//! Index file: `[meta header][cell]*`. All integers are little-endian.
//!
//! ```text
//! string table meta   sig[7] ver[1] count[4] delcount[4] used[4]
//! string table cell   offset[4] key_size:31|deleted:1 [4] data_size[4]
//! number table meta   sig[7] ver[1] count[4] used[4]
//! number table cell   offset[4] size:31|deleted:1 [4]
//! ```
//!
//! A cell with `offset == 0` was never used. Offset 0 is always inside the
//! data file header, so no record can live there.

use std::path::Path;

use crate::error::{Error, Result};

pub(crate) const SIGNATURE_LEN: usize = 7;
pub(crate) const FILE_HEADER_LEN: u64 = SIGNATURE_LEN as u64 + 1;
pub(crate) const RECORD_ALIGN: u64 = 4;

const DELETED_BIT: u32 = 1 << 31;
pub(crate) const MAX_PACKED_SIZE: u32 = DELETED_BIT - 1;

/// Rounds `n` up to the record alignment.
pub(crate) const fn align(n: u64) -> u64 {
    (n + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// Bytes a record occupies in the data file.
///
/// The padding after the key only exists when a value follows it.
pub(crate) const fn record_len(key_size: u32, data_size: u32) -> u64 {
    if data_size == 0 {
        key_size as u64
    } else {
        align(key_size as u64) + data_size as u64
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn pack(size: u32, deleted: bool) -> u32 {
    (size & MAX_PACKED_SIZE) | if deleted { DELETED_BIT } else { 0 }
}

fn unpack(raw: u32) -> (u32, bool) {
    (raw & MAX_PACKED_SIZE, raw & DELETED_BIT != 0)
}

/// Static description of one table flavour.
pub(crate) trait Layout {
    const DATA_SIGNATURE: [u8; SIGNATURE_LEN];
    const META_SIGNATURE: [u8; SIGNATURE_LEN];
    const VERSION: u8;
    /// Whether the meta header persists a tombstone counter.
    const TRACKS_TOMBSTONES: bool;
    const CELL_LEN: u64;
    /// Number of cells in a freshly created table.
    const INITIAL_CELLS: u32;

    const META_HEADER_LEN: u64 = FILE_HEADER_LEN + if Self::TRACKS_TOMBSTONES { 12 } else { 8 };
}

/// String-keyed table.
pub(crate) enum StrLayout {}

impl Layout for StrLayout {
    const DATA_SIGNATURE: [u8; SIGNATURE_LEN] = *b"SLTSTRD";
    const META_SIGNATURE: [u8; SIGNATURE_LEN] = *b"SLTSTRM";
    const VERSION: u8 = 1;
    const TRACKS_TOMBSTONES: bool = true;
    const CELL_LEN: u64 = StrCell::LEN as u64;
    const INITIAL_CELLS: u32 = 1;
}

/// Number-keyed table.
pub(crate) enum NumLayout {}

impl Layout for NumLayout {
    const DATA_SIGNATURE: [u8; SIGNATURE_LEN] = *b"SLTNUMD";
    const META_SIGNATURE: [u8; SIGNATURE_LEN] = *b"SLTNUMM";
    const VERSION: u8 = 1;
    const TRACKS_TOMBSTONES: bool = false;
    const CELL_LEN: u64 = NumCell::LEN as u64;
    const INITIAL_CELLS: u32 = 0;
}

pub(crate) fn encode_file_header(signature: &[u8; SIGNATURE_LEN], version: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..SIGNATURE_LEN].copy_from_slice(signature);
    out[SIGNATURE_LEN] = version;
    out
}

/// Checks signature and version at the start of `bytes`.
pub(crate) fn validate_header(
    bytes: &[u8],
    signature: &[u8; SIGNATURE_LEN],
    version: u8,
    path: &Path,
) -> Result<()> {
    if bytes.len() < FILE_HEADER_LEN as usize || &bytes[..SIGNATURE_LEN] != signature {
        return Err(Error::Signature(path.to_path_buf()));
    }
    let found = bytes[SIGNATURE_LEN];
    if found != version {
        return Err(Error::Version {
            path: path.to_path_buf(),
            found,
            expected: version,
        });
    }
    Ok(())
}

/// Counters persisted in the meta header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Live entries.
    pub(crate) count: u32,
    /// Tombstones; always zero for layouts that do not track them.
    pub(crate) delcount: u32,
    /// Key plus value bytes of live entries.
    pub(crate) used: u32,
}

impl MetaHeader {
    pub(crate) fn encode<L: Layout>(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(L::META_HEADER_LEN as usize);
        out.extend_from_slice(&encode_file_header(&L::META_SIGNATURE, L::VERSION));
        out.extend_from_slice(&self.count.to_le_bytes());
        if L::TRACKS_TOMBSTONES {
            out.extend_from_slice(&self.delcount.to_le_bytes());
        }
        out.extend_from_slice(&self.used.to_le_bytes());
        out
    }

    /// Decodes a header whose signature was already validated.
    pub(crate) fn decode<L: Layout>(bytes: &[u8]) -> Self {
        let at = FILE_HEADER_LEN as usize;
        if L::TRACKS_TOMBSTONES {
            Self {
                count: read_u32(bytes, at),
                delcount: read_u32(bytes, at + 4),
                used: read_u32(bytes, at + 8),
            }
        } else {
            Self {
                count: read_u32(bytes, at),
                delcount: 0,
                used: read_u32(bytes, at + 4),
            }
        }
    }
}

/// Index cell of the string-keyed table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StrCell {
    pub(crate) offset: u32,
    pub(crate) key_size: u32,
    pub(crate) data_size: u32,
    pub(crate) deleted: bool,
}

impl StrCell {
    pub(crate) const LEN: usize = 12;

    pub(crate) fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub(crate) fn is_live(&self) -> bool {
        self.offset != 0 && !self.deleted
    }

    pub(crate) fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&pack(self.key_size, self.deleted).to_le_bytes());
        out[8..12].copy_from_slice(&self.data_size.to_le_bytes());
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Self {
        let (key_size, deleted) = unpack(read_u32(bytes, 4));
        Self {
            offset: read_u32(bytes, 0),
            key_size,
            data_size: read_u32(bytes, 8),
            deleted,
        }
    }
}

/// Index cell of the number-keyed table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct NumCell {
    pub(crate) offset: u32,
    pub(crate) size: u32,
    pub(crate) deleted: bool,
}

impl NumCell {
    pub(crate) const LEN: usize = 8;

    pub(crate) fn is_live(&self) -> bool {
        self.offset != 0 && !self.deleted
    }

    pub(crate) fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&pack(self.size, self.deleted).to_le_bytes());
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Self {
        let (size, deleted) = unpack(read_u32(bytes, 4));
        Self {
            offset: read_u32(bytes, 0),
            size,
            deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn alignment() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 4);
        assert_eq!(align(4), 4);
        assert_eq!(align(13), 16);
        assert_eq!(record_len(3, 0), 3);
        assert_eq!(record_len(3, 5), 9);
        assert_eq!(record_len(0, 5), 5);
    }

    #[test]
    fn meta_header_widths() {
        assert_eq!(StrLayout::META_HEADER_LEN, 20);
        assert_eq!(NumLayout::META_HEADER_LEN, 16);

        let header = MetaHeader {
            count: 3,
            delcount: 2,
            used: 99,
        };
        let bytes = header.encode::<StrLayout>();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..7], b"SLTSTRM");
        assert_eq!(MetaHeader::decode::<StrLayout>(&bytes), header);

        let bytes = header.encode::<NumLayout>();
        assert_eq!(bytes.len(), 16);
        assert_eq!(
            MetaHeader::decode::<NumLayout>(&bytes),
            MetaHeader {
                delcount: 0,
                ..header
            }
        );
    }

    #[test]
    fn str_cell_bit_layout() {
        let cell = StrCell {
            offset: 8,
            key_size: 5,
            data_size: 7,
            deleted: true,
        };
        let bytes = cell.encode();
        assert_eq!(bytes, [8, 0, 0, 0, 5, 0, 0, 0x80, 7, 0, 0, 0]);
        assert_eq!(StrCell::decode(&bytes), cell);
        assert!(!cell.is_live());
        assert!(!cell.is_empty());
        assert!(StrCell::default().is_empty());
    }

    #[test]
    fn num_cell_bit_layout() {
        let cell = NumCell {
            offset: 0x0102_0304,
            size: MAX_PACKED_SIZE,
            deleted: false,
        };
        let bytes = cell.encode();
        assert_eq!(bytes, [4, 3, 2, 1, 0xff, 0xff, 0xff, 0x7f]);
        assert_eq!(NumCell::decode(&bytes), cell);
        assert!(cell.is_live());
    }

    #[test]
    fn header_validation() {
        let path = PathBuf::from("t.dat0");
        let good = encode_file_header(&StrLayout::DATA_SIGNATURE, 1);
        assert!(validate_header(&good, &StrLayout::DATA_SIGNATURE, 1, &path).is_ok());

        assert!(matches!(
            validate_header(&good, &NumLayout::DATA_SIGNATURE, 1, &path),
            Err(Error::Signature(_))
        ));
        assert!(matches!(
            validate_header(&good, &StrLayout::DATA_SIGNATURE, 2, &path),
            Err(Error::Version { found: 1, expected: 2, .. })
        ));
        assert!(matches!(
            validate_header(b"SLT", &StrLayout::DATA_SIGNATURE, 1, &path),
            Err(Error::Signature(_))
        ));
    }
}
