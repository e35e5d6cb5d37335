//! Everything involved in getting chunk bytes to and from a backing
//! store: the placement allocator (component B), the async I/O
//! emulation (component C), and the two concrete backends the manager
//! (component E) can be built against — file-backed (component D) and
//! in-memory (component H).
mod aio;
mod file_backend;
mod memory_backend;
mod placement;

pub(crate) use aio::{AioOp, AioRequest, BufferHandle};
pub(crate) use placement::PlacementId;

pub use file_backend::FileSwap;
pub use memory_backend::MemorySwap;

use crate::chunk::ChunkId;
use crate::error::RambrainError;

pub(crate) type CompletionFn = Box<dyn FnOnce(Result<(), RambrainError>) + Send>;

/// Abstracts over where a chunk's swapped-out bytes actually live.
/// The manager (component E) and swap engine logic (component D) are
/// generic over this trait so the same eviction/fault-in code path
/// drives either a real file-backed store or the RAM-only dummy.
///
/// Kept crate-private: its associated types (`PlacementId`,
/// `BufferHandle`) are internal, so implementing it from outside this
/// crate isn't meaningful. Callers choose a backend by picking
/// [`FileSwap`] or [`MemorySwap`], not by implementing this trait.
pub(crate) trait SwapBackend: Send + Sync {
    /// Reserves backing space for `size` bytes, growing the store per
    /// its configured policy if the current free space can't cover it.
    fn alloc(&self, size: usize, owner: ChunkId) -> Result<PlacementId, RambrainError>;

    /// Releases a placement obtained from `alloc`.
    fn free(&self, placement: PlacementId);

    /// Schedules an asynchronous write of `buffer`'s bytes into
    /// `placement`; `on_complete` runs once every sub-request finishes.
    fn schedule_write(
        &self,
        chunk: ChunkId,
        placement: PlacementId,
        buffer: BufferHandle,
        on_complete: CompletionFn,
    );

    /// Schedules an asynchronous read of `placement`'s bytes into
    /// `buffer`; `on_complete` runs once every sub-request finishes.
    fn schedule_read(
        &self,
        chunk: ChunkId,
        placement: PlacementId,
        buffer: BufferHandle,
        on_complete: CompletionFn,
    );

    /// Total bytes currently backed by this store (used for ceiling
    /// accounting and diagnostics, not for the allocator itself).
    fn capacity_bytes(&self) -> u64;
}
