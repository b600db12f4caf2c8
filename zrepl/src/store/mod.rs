//! Interface to the block-store engine backing a volume.
//!
//! The engine itself lives outside this crate; everything here is the
//! contract the data plane relies on: plain reads and writes keyed by io
//! number, a flush, a metadata diff walk for rebuilds and the persisted
//! last-committed io number used by the checkpoint timer. The in-memory
//! engine in [`mem`] implements the contract for tests and for running
//! the server without a real store behind it.

use snafu::Snafu;

pub mod mem;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum StoreError {
    #[snafu(display(
        "I/O beyond end of volume: offset {} len {} size {}",
        offset,
        len,
        size
    ))]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[snafu(display("{} failed: {}", op, reason))]
    EngineFault { op: &'static str, reason: String },
    #[snafu(display("diff walk aborted: {}", reason))]
    WalkAborted { reason: String },
}

/// One run of stored metadata covering a span of a read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaRun {
    /// Io number the span was written with; 0 for never-written gaps.
    pub io_num: u64,
    pub len: u64,
}

/// Visitor for [`BlockStore::diff`]; called as `(offset, len, io_num)`
/// for each qualifying run in offset order.
pub type DiffVisitor<'a> =
    &'a mut dyn FnMut(u64, u64, u64) -> Result<(), StoreError>;

pub trait BlockStore: Send + Sync {
    /// Volume size in bytes.
    fn size(&self) -> u64;

    /// Read `buf.len()` bytes at `offset`; unwritten ranges read as zero.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Same as [`read`](Self::read) but also returns the metadata runs
    /// covering the buffer, in offset order and summing to `buf.len()`.
    fn read_with_metadata(
        &self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<Vec<MetaRun>, StoreError>;

    /// Write `data` at `offset`, stamping it with `io_num`. A rebuild
    /// write must not clobber spans already holding a newer io number.
    fn write(
        &self,
        offset: u64,
        data: &[u8],
        io_num: u64,
        rebuild: bool,
    ) -> Result<(), StoreError>;

    /// Flush outstanding writes to stable storage.
    fn flush(&self) -> Result<(), StoreError>;

    /// Walk every stored run intersecting `[offset, offset + len)` whose
    /// io number is strictly greater than `threshold`, clamped to the
    /// window. An error from the visitor aborts the walk.
    fn diff(
        &self,
        threshold: u64,
        offset: u64,
        len: u64,
        visit: DiffVisitor,
    ) -> Result<(), StoreError>;

    /// The io number most recently persisted via
    /// [`store_last_committed_io_num`](Self::store_last_committed_io_num).
    fn last_committed_io_num(&self) -> Result<u64, StoreError>;

    /// Persist `io_num` as the new durable checkpoint.
    fn store_last_committed_io_num(&self, io_num: u64)
        -> Result<(), StoreError>;
}
