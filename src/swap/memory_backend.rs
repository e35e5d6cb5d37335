//! The in-memory dummy swap backend (component H): backs chunks with
//! a single growable byte buffer instead of files. There's no
//! positioning cost to model, so allocation is a simple bump
//! allocator over a free-list of `(offset, length)` holes, and "I/O"
//! is a synchronous `copy_from_slice` run inline rather than handed to
//! a worker pool. Lets the manager and facade be exercised without
//! touching the filesystem.
use std::sync::Mutex;

use crate::chunk::ChunkId;
use crate::error::RambrainError;
use crate::swap::{BufferHandle, CompletionFn, PlacementId, SwapBackend};

struct Hole {
    offset: usize,
    length: usize,
}

struct Inner {
    bytes: Vec<u8>,
    holes: Vec<Hole>,
    // Placements are keyed by a dense id; index directly into this
    // table rather than threading a real arena through, since there's
    // no fragmentation to model.
    placements: Vec<Option<(usize, usize)>>,
}

/// A `SwapBackend` that never touches disk: still enforces the same
/// residency/accounting bookkeeping as [`FileSwap`](crate::FileSwap),
/// but all bytes stay resident in one `Vec<u8>`.
pub struct MemorySwap {
    inner: Mutex<Inner>,
}

impl Default for MemorySwap {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                bytes: Vec::new(),
                holes: Vec::new(),
                placements: Vec::new(),
            }),
        }
    }
}

impl MemorySwap {
    pub fn new() -> Self {
        Self::default()
    }
}

fn placement_id(index: usize) -> PlacementId {
    // `PlacementId` is a thin newtype around the slot index; both
    // backends share the type so the manager stays backend-agnostic.
    PlacementId::from_raw(index)
}

impl SwapBackend for MemorySwap {
    fn alloc(&self, size: usize, _owner: ChunkId) -> Result<PlacementId, RambrainError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pos) = inner.holes.iter().position(|h| h.length >= size) {
            let hole = &mut inner.holes[pos];
            let offset = hole.offset;
            hole.offset += size;
            hole.length -= size;
            if hole.length == 0 {
                inner.holes.remove(pos);
            }
            let slot = inner.placements.len();
            inner.placements.push(Some((offset, size)));
            return Ok(placement_id(slot));
        }

        let offset = inner.bytes.len();
        inner.bytes.resize(offset + size, 0);
        let slot = inner.placements.len();
        inner.placements.push(Some((offset, size)));
        Ok(placement_id(slot))
    }

    fn free(&self, placement: PlacementId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((offset, length)) = inner.placements[placement.raw()].take() {
            inner.holes.push(Hole { offset, length });
        }
    }

    fn schedule_write(
        &self,
        _chunk: ChunkId,
        placement: PlacementId,
        buffer: BufferHandle,
        on_complete: CompletionFn,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let (offset, length) = inner.placements[placement.raw()].expect("freed placement reused");
        debug_assert_eq!(length, buffer.len());
        inner.bytes[offset..offset + length].copy_from_slice(buffer.as_slice());
        drop(inner);
        on_complete(Ok(()));
    }

    fn schedule_read(
        &self,
        _chunk: ChunkId,
        placement: PlacementId,
        buffer: BufferHandle,
        on_complete: CompletionFn,
    ) {
        let inner = self.inner.lock().unwrap();
        let (offset, length) = inner.placements[placement.raw()].expect("freed placement reused");
        debug_assert_eq!(length, buffer.len());
        buffer.as_mut_slice().copy_from_slice(&inner.bytes[offset..offset + length]);
        drop(inner);
        on_complete(Ok(()));
    }

    fn capacity_bytes(&self) -> u64 {
        self.inner.lock().unwrap().bytes.len() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn id(n: u32) -> ChunkId {
        unsafe { std::mem::transmute(NonZeroU32::new(n).unwrap()) }
    }

    #[test]
    fn write_then_read_roundtrips() {
        let backend = MemorySwap::new();
        let placement = backend.alloc(8, id(1)).unwrap();

        let mut src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let handle = BufferHandle::new(src.as_mut_ptr(), src.len());
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        backend.schedule_write(id(1), placement, handle, Box::new(move |r| {
            r.unwrap();
            done2.store(true, Ordering::SeqCst);
        }));
        assert!(done.load(Ordering::SeqCst));

        let mut dst = [0u8; 8];
        let handle = BufferHandle::new(dst.as_mut_ptr(), dst.len());
        backend.schedule_read(id(1), placement, handle, Box::new(|r| r.unwrap()));
        assert_eq!(dst, src);
    }
}
