//! The chunk registry (component A): every chunk Rambrain knows
//! about, keyed by a stable id, plus the RAM buffer type chunks use
//! while resident.
use std::alloc::Layout;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::ptr::NonNull;

use crate::swap::PlacementId;

/// A page-aligned (or, with DMA disabled, byte-aligned) heap buffer
/// backing a resident chunk.
///
/// `RamBuffer` is `Send`, not `Sync`: the chunk state machine
/// guarantees at most one thread touches a given buffer's bytes at a
/// time (the owning worker during a swap transaction, or the pinning
/// caller during a use).
#[derive(Debug)]
pub(crate) struct RamBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RamBuffer {
    pub(crate) fn alloc(size: usize, dma: bool) -> Result<Self, i32> {
        let align = if dma { crate::map::page_size() } else { 1 };
        let (ptr, layout) = crate::map::alloc_aligned(size.max(1), align)?;
        Ok(Self { ptr, layout })
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The caller must ensure no other thread is concurrently
    /// accessing the buffer (guaranteed by chunk state: only
    /// SwapIn/SwapOut/in-use chunks have a live buffer pointer handed
    /// out, and those states are exclusive).
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size())
    }

    /// # Safety
    /// See [`RamBuffer::as_slice`].
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size())
    }
}

impl Drop for RamBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`layout` are exactly the pair `alloc` produced.
        unsafe { crate::map::dealloc_aligned(self.ptr, self.layout) };
    }
}

unsafe impl Send for RamBuffer {}

/// Stable identity for a chunk, valid for the chunk's lifetime.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ChunkId(NonZeroU32);

static_assertions::assert_eq_size!(ChunkId, u32);

impl ChunkId {
    pub(crate) fn as_u32(self) -> u32 {
        self.0.get()
    }
}

/// Where a chunk's bytes currently live, per the data model's state
/// machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkState {
    Allocated,
    AllocatedInUseRead,
    AllocatedInUseWrite,
    SwapIn,
    SwapOut,
    Swapped,
}

impl ChunkState {
    pub(crate) fn is_evictable(self) -> bool {
        matches!(self, ChunkState::Allocated)
    }

    pub(crate) fn is_resident(self) -> bool {
        matches!(
            self,
            ChunkState::Allocated
                | ChunkState::AllocatedInUseRead
                | ChunkState::AllocatedInUseWrite
                | ChunkState::SwapIn
                | ChunkState::SwapOut
        )
    }
}

pub(crate) struct Chunk {
    pub(crate) id: ChunkId,
    pub(crate) size: usize,
    pub(crate) state: ChunkState,
    pub(crate) use_count: u32,
    pub(crate) loc: Option<RamBuffer>,
    /// Present when there is a valid (possibly cached) swap copy.
    pub(crate) placement: Option<PlacementId>,
    /// External reference count (`Manager::reference`/`dereference`);
    /// the chunk is freed once this reaches zero.
    pub(crate) refcount: u32,
}

impl Chunk {
    /// A chunk has a usable cached swap copy when it is fully
    /// resident (`Allocated*`) but still carries a placement from a
    /// previous swap-out that nothing has written through since.
    pub(crate) fn has_cached_swap(&self) -> bool {
        self.loc.is_some() && self.placement.is_some() && self.state != ChunkState::SwapOut
    }
}

/// Holds every live chunk, keyed by id.  All mutation happens under
/// the manager's state mutex; the registry itself adds no locking.
#[derive(Default)]
pub(crate) struct Registry {
    chunks: HashMap<ChunkId, Chunk>,
    next_id: u32,
}

impl Registry {
    pub(crate) fn insert(&mut self, size: usize, state: ChunkState, loc: Option<RamBuffer>) -> ChunkId {
        self.next_id += 1;
        let id = ChunkId(NonZeroU32::new(self.next_id).expect("ids start at 1"));
        self.chunks.insert(
            id,
            Chunk {
                id,
                size,
                state,
                use_count: 0,
                loc,
                placement: None,
                refcount: 1,
            },
        );
        id
    }

    pub(crate) fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: ChunkId) -> Option<Chunk> {
        self.chunks.remove(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }
}
