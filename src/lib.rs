//! Embedded Single-File Table Store
//!
//! This library provides two persistent key-value tables that live in a pair of plain files each: a data file of
//! append-only records and an index file holding a hash table (or a flat array) of fixed-size cells. Reads hand out
//! slices straight from a memory-mapped window of the data file, or from a RAM-resident copy when asked to.
//!
//! # Modules
//!
//! - `str_table`: Byte-string keyed table with an open-addressing FNV-1a index, tombstones and rehashing.
//! - `num_table`: `u32` keyed table where the key is the index cell itself.
//! - `options`: Open, insert and delete modes plus the `TableOptions` builder.
//! - `error`: Error type shared by every operation.
//! - `store`: Generations, record I/O and counters shared by both tables.
//! - `region`, `mapping`: File access through a sliding mmap window or a resident buffer.
//! - `format`: On-disk headers, cells and record layout.
//!
//! # Usage
//!
//! Add this library as a dependency in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! slottable = "0.1.0"
//! ```
//!
//! # Examples
//!
//! ```rust
//! use slottable::{DeleteMode, InsertMode, OpenMode, StrTable};
//!
//! fn main() -> slottable::Result<()> {
//!     let dir = tempfile::tempdir()?;
//!     let path = dir.path().join("ponies");
//!
//!     // Create a fresh table, discarding anything at `path`
//!     let mut table = StrTable::open(&path, OpenMode::Create)?;
//!     table.insert(b"Sweety Belle", b"unicorn", InsertMode::Always)?;
//!     table.insert(b"Scootaloo", b"pegasus", InsertMode::OnlyIfAbsent)?;
//!     table.delete(b"Sweety Belle", DeleteMode::OnlyIfExisting)?;
//!
//!     // Drop deleted records and switch to the other file generation
//!     table.optimize()?;
//!     table.close()?;
//!
//!     let mut table = StrTable::open(&path, OpenMode::Read)?;
//!     assert_eq!(table.read(b"Scootaloo")?, b"pegasus");
//!     assert_eq!(table.count()?, 1);
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! Tables are `Send` but every read takes `&mut self`, since a disk-resident read may move the mapped window or the
//! file cursor. This holds in RAM mode too: `set_ram_mode(true, true)` does not enable shared reads from several
//! threads. Wrap a table in a `Mutex` to use it from more than one thread.
//!
//! # Testing
//!
//! Unit tests sit next to each module, integration tests under `tests/`. Set `RUST_LOG=slottable=debug` when running
//! the CLI to see file lifecycle events.
//!
//! ```bash
//! $ cargo test
//! ```
//!
//! # License
//!
//! This library is licensed under the MIT or Apache-2.0 license.

/// Error type of every table operation
pub mod error;
/// Open, insert and delete modes
pub mod options;
/// Integer keyed table
pub mod num_table;
/// String keyed table
pub mod str_table;

mod format;
mod hash;
mod mapping;
mod region;
mod store;

pub use error::{Error, Result};
pub use num_table::NumTable;
pub use options::{DeleteMode, InsertMode, OpenMode, TableOptions};
pub use store::{data_path, meta_path, CheckReport, Generation};
pub use str_table::{Entry, StrTable};
