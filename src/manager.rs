//! The cyclic memory manager (component E): the public allocate/free/
//! use surface, RAM and swap budget accounting, and the CLOCK-like
//! eviction policy that drives the swap engine.
//!
//! Every method that can touch chunk state takes `self: &Arc<Self>`:
//! eviction and fault-in schedule asynchronous I/O whose completion
//! callback needs to reach back into the manager from a worker
//! thread, so the manager is always handled through an `Arc`.
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::chunk::{ChunkId, ChunkState, RamBuffer, Registry};
use crate::config::Config;
use crate::error::{invariant, RambrainError};
use crate::ring::Ring;
use crate::stats::Stats;
use crate::swap::{BufferHandle, FileSwap, MemorySwap, SwapBackend};

struct State {
    registry: Registry,
    ring: Ring,
    used_memory: usize,
    /// Bytes currently backed by an allocated placement, resident or
    /// not: a chunk keeps its placement (and its share of this count)
    /// as a cache even after it's faulted back in, until a writable
    /// use invalidates it.
    used_swap: usize,
}

/// Owns one swap-backed memory budget. Construct with
/// [`Manager::with_file_swap`] or [`Manager::with_memory_swap`].
pub struct Manager {
    config: Config,
    backend: Box<dyn SwapBackend>,
    state: Mutex<State>,
    swap_cond: Condvar,
    stats: Arc<Stats>,
}

impl Manager {
    pub fn with_file_swap(config: Config) -> Result<Arc<Self>, RambrainError> {
        let backend = FileSwap::open(&config)?;
        Ok(Self::build(config, Box::new(backend)))
    }

    pub fn with_memory_swap(config: Config) -> Arc<Self> {
        Self::build(config, Box::new(MemorySwap::new()))
    }

    fn build(config: Config, backend: Box<dyn SwapBackend>) -> Arc<Self> {
        Arc::new(Self {
            config,
            backend,
            state: Mutex::new(State {
                registry: Registry::default(),
                ring: Ring::default(),
                used_memory: 0,
                used_swap: 0,
            }),
            swap_cond: Condvar::new(),
            stats: Arc::new(Stats::default()),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Allocates a fresh, resident chunk of `size` bytes, evicting
    /// cold chunks first if the RAM ceiling would otherwise be
    /// exceeded. A `size` of zero is a valid degenerate chunk: it
    /// never touches the swap engine.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<ChunkId, RambrainError> {
        if self.state.lock().unwrap().used_memory + size > self.config.memory_ceiling {
            self.evict_for(size)?;
        }

        let buffer = RamBuffer::alloc(size, self.config.dma).map_err(|_| RambrainError::OutOfMemory {
            requested: size,
            ceiling: self.config.memory_ceiling,
        })?;

        let mut state = self.state.lock().unwrap();
        if state.used_memory + size > self.config.memory_ceiling {
            return Err(RambrainError::OutOfMemory {
                requested: size,
                ceiling: self.config.memory_ceiling,
            });
        }

        let id = state.registry.insert(size, ChunkState::Allocated, Some(buffer));
        state.ring.insert(id);
        state.used_memory += size;
        log::trace!("chunk {:?} allocated ({} bytes)", id, size);
        Ok(id)
    }

    /// Frees `id` outright: drops its RAM buffer (if resident) and its
    /// swap placement (if one is still allocated).
    pub fn free(self: &Arc<Self>, id: ChunkId) {
        let state = self.state.lock().unwrap();
        let mut state = self.wait_until_stable(state, id);

        let chunk = match state.registry.remove(id) {
            Some(c) => c,
            None => return,
        };
        state.ring.remove(id);
        if chunk.loc.is_some() {
            state.used_memory -= chunk.size;
        }
        if let Some(placement) = chunk.placement {
            state.used_swap -= chunk.size;
            drop(state);
            self.backend.free(placement);
        }
        log::trace!("chunk {:?} freed", id);
    }

    /// Pins `id` resident for the duration of a use, blocking until
    /// any in-flight swap crossing completes and faulting the chunk
    /// back in if necessary. Mirrors `setUse`.
    pub fn set_use(self: &Arc<Self>, id: ChunkId, writable: bool) -> Result<(), RambrainError> {
        let mut state = self.state.lock().unwrap();

        loop {
            let needs_swap_in = {
                let chunk = state
                    .registry
                    .get(id)
                    .ok_or(RambrainError::InvariantViolation("set_use on unknown chunk"))?;
                match chunk.state {
                    ChunkState::Allocated | ChunkState::AllocatedInUseRead | ChunkState::AllocatedInUseWrite => false,
                    ChunkState::SwapIn | ChunkState::SwapOut => {
                        state = self.swap_cond.wait(state).unwrap();
                        continue;
                    }
                    ChunkState::Swapped => true,
                }
            };

            if needs_swap_in {
                drop(state);
                self.swap_in_and_wait(id)?;
                state = self.state.lock().unwrap();
                continue;
            }

            break;
        }

        state.ring.touch(id);

        // A writable use invalidates any cached swap copy: the bytes
        // on disk no longer match what's about to be mutated in RAM.
        if writable {
            let size = state.registry.get(id).expect("checked above").size;
            let placement = state.registry.get_mut(id).expect("checked above").placement.take();
            if let Some(placement) = placement {
                state.used_swap -= size;
                drop(state);
                self.backend.free(placement);
                state = self.state.lock().unwrap();
            }
        }

        let chunk = state.registry.get_mut(id).expect("checked above");
        chunk.use_count += 1;
        chunk.state = if writable || chunk.state == ChunkState::AllocatedInUseWrite {
            ChunkState::AllocatedInUseWrite
        } else {
            ChunkState::AllocatedInUseRead
        };
        drop(state);

        self.preemptive_swap_in(id);
        Ok(())
    }

    /// Bumps `id`'s external reference count. Used by the C facade,
    /// where callers can't rely on Rust's `Drop` to release a chunk.
    pub fn reference(&self, id: ChunkId) {
        let mut state = self.state.lock().unwrap();
        if let Some(chunk) = state.registry.get_mut(id) {
            chunk.refcount += 1;
        }
    }

    /// Drops one external reference to `id`, freeing the chunk once
    /// the count reaches zero.
    pub fn dereference(self: &Arc<Self>, id: ChunkId) {
        let should_free = {
            let mut state = self.state.lock().unwrap();
            match state.registry.get_mut(id) {
                Some(chunk) => {
                    chunk.refcount = chunk.refcount.saturating_sub(1);
                    chunk.refcount == 0
                }
                None => false,
            }
        };
        if should_free {
            self.free(id);
        }
    }

    /// Releases `n` use counts previously acquired with `set_use`.
    pub fn unset_use(self: &Arc<Self>, id: ChunkId, n: u32) {
        let mut state = self.state.lock().unwrap();
        let chunk = match state.registry.get_mut(id) {
            Some(c) => c,
            None => return,
        };
        chunk.use_count = chunk.use_count.saturating_sub(n);
        if chunk.use_count == 0 {
            chunk.state = ChunkState::Allocated;
        }
    }

    /// Returns a raw pointer to `id`'s resident bytes. Caller must
    /// already hold a use (`set_use`) on the chunk.
    pub(crate) fn loc_ptr(&self, id: ChunkId) -> Option<*mut u8> {
        let state = self.state.lock().unwrap();
        state.registry.get(id).and_then(|c| c.loc.as_ref()).map(RamBuffer::as_ptr)
    }

    pub(crate) fn chunk_size(&self, id: ChunkId) -> usize {
        self.state.lock().unwrap().registry.get(id).map(|c| c.size).unwrap_or(0)
    }

    fn wait_until_stable<'a>(&self, mut state: MutexGuard<'a, State>, id: ChunkId) -> MutexGuard<'a, State> {
        loop {
            let in_flight = matches!(
                state.registry.get(id).map(|c| c.state),
                Some(ChunkState::SwapIn) | Some(ChunkState::SwapOut)
            );
            if !in_flight {
                return state;
            }
            state = self.swap_cond.wait(state).unwrap();
        }
    }

    /// Walks the eviction ring from `active`, swapping out cold
    /// chunks until at least `needed` bytes (or the configured
    /// fraction of the ceiling, whichever is larger) have been freed.
    fn evict_for(self: &Arc<Self>, needed: usize) -> Result<(), RambrainError> {
        let target = needed.max((self.config.swap_out_fraction * self.config.memory_ceiling as f64) as usize);

        loop {
            let candidates = {
                let state = self.state.lock().unwrap();
                if state.used_memory + needed <= self.config.memory_ceiling {
                    return Ok(());
                }
                state.ring.candidates(state.ring.len())
            };

            let mut freed = 0usize;
            let mut evicted = 0usize;
            for id in &candidates {
                if freed >= target {
                    break;
                }
                let evictable = {
                    let state = self.state.lock().unwrap();
                    state
                        .registry
                        .get(*id)
                        .map(|c| c.state.is_evictable() && c.use_count == 0)
                        .unwrap_or(false)
                };
                if !evictable {
                    continue;
                }

                let size = self.chunk_size(*id);
                self.swap_out_and_wait(*id)?;
                freed += size;
                evicted += 1;
            }

            if evicted == 0 {
                return Err(RambrainError::OutOfMemory {
                    requested: needed,
                    ceiling: self.config.memory_ceiling,
                });
            }

            let mut state = self.state.lock().unwrap();
            state.ring.advance_active(evicted);
            if state.used_memory + needed <= self.config.memory_ceiling {
                return Ok(());
            }
        }
    }

    /// `id` was just used, so its ring neighbor -- the next-coldest
    /// chunk -- is a plausible access target. Schedules an
    /// asynchronous, best-effort swap-in for it when it's currently
    /// `Swapped`, there's enough free RAM to stay above
    /// `preemptive_turnoff_fraction · memory_ceiling`, and claiming its
    /// bytes wouldn't push `used_memory` past `swap_in_fraction ·
    /// memory_ceiling`. Failures are logged and otherwise ignored: the
    /// use that triggered this has already succeeded on its own.
    fn preemptive_swap_in(self: &Arc<Self>, id: ChunkId) {
        if !self.config.preemptive_load {
            return;
        }

        let ceiling = self.config.memory_ceiling as f64;
        let state = self.state.lock().unwrap();

        let free = self.config.memory_ceiling.saturating_sub(state.used_memory) as f64;
        if free < self.config.preemptive_turnoff_fraction * ceiling {
            return;
        }

        let neighbor = match state.ring.neighbor(id) {
            Some(n) => n,
            None => return,
        };
        let candidate = match state.registry.get(neighbor) {
            Some(c) if c.state == ChunkState::Swapped => c,
            _ => return,
        };
        if (state.used_memory + candidate.size) as f64 > self.config.swap_in_fraction * ceiling {
            return;
        }
        drop(state);

        log::trace!("preemptively swapping in chunk {:?} (neighbor of {:?})", neighbor, id);
        if let Err(e) = self.swap_in(neighbor) {
            log::trace!("preemptive swap-in of {:?} skipped: {}", neighbor, e);
        }
    }

    /// Schedules `id`'s swap-out and blocks the calling thread until
    /// it completes. A synchronous wait here, rather than truly
    /// overlapping eviction with the allocation that triggered it,
    /// trades some concurrency for a much simpler, clearly correct
    /// budget-accounting story (see DESIGN.md's open-question note).
    fn swap_out_and_wait(self: &Arc<Self>, id: ChunkId) -> Result<(), RambrainError> {
        self.swap_out(id)?;

        let mut state = self.state.lock().unwrap();
        loop {
            match state.registry.get(id).map(|c| c.state) {
                Some(ChunkState::SwapOut) => state = self.swap_cond.wait(state).unwrap(),
                _ => return Ok(()),
            }
        }
    }

    fn swap_in_and_wait(self: &Arc<Self>, id: ChunkId) -> Result<(), RambrainError> {
        self.swap_in(id)?;

        let mut state = self.state.lock().unwrap();
        loop {
            match state.registry.get(id).map(|c| c.state) {
                Some(ChunkState::SwapIn) => state = self.swap_cond.wait(state).unwrap(),
                _ => return Ok(()),
            }
        }
    }

    /// `swapOut`: if a valid cached swap copy already exists, this is
    /// a free transition straight to `Swapped`; otherwise allocates a
    /// placement and schedules a write.
    fn swap_out(self: &Arc<Self>, id: ChunkId) -> Result<(), RambrainError> {
        let mut state = self.state.lock().unwrap();
        let chunk = state
            .registry
            .get_mut(id)
            .ok_or(RambrainError::InvariantViolation("swap_out on unknown chunk"))?;

        invariant(
            matches!(chunk.state, ChunkState::Allocated),
            "swap_out called on a chunk that isn't plain Allocated",
        );

        if chunk.size == 0 {
            chunk.state = ChunkState::Swapped;
            return Ok(());
        }

        if chunk.has_cached_swap() {
            self.stats.record_cached_hit();
            let size = chunk.size;
            chunk.loc = None;
            chunk.state = ChunkState::Swapped;
            state.used_memory -= size;
            self.swap_cond.notify_all();
            log::trace!("chunk {:?} swapped out from cache, no write needed", id);
            return Ok(());
        }

        let size = chunk.size;
        let ptr = chunk.loc.as_ref().expect("Allocated chunks are resident").as_ptr();

        if state.used_swap + size > self.config.swap_ceiling {
            return Err(RambrainError::OutOfSwap {
                requested: size,
                available: self.config.swap_ceiling.saturating_sub(state.used_swap),
            });
        }
        drop(state);

        let placement = self.backend.alloc(size, id)?;
        self.stats.record_action_queued();

        let mut state = self.state.lock().unwrap();
        let chunk = state.registry.get_mut(id).expect("still present");
        chunk.state = ChunkState::SwapOut;
        chunk.placement = Some(placement);
        state.used_swap += size;
        drop(state);

        let manager = Arc::clone(self);
        let buffer = BufferHandle::new(ptr, size);
        self.backend.schedule_write(
            id,
            placement,
            buffer,
            Box::new(move |result| manager.on_write_complete(id, result)),
        );
        Ok(())
    }

    /// `swapIn`: acquires a fresh RAM buffer, claims budget for it,
    /// and schedules a read. The placement is left in place afterward
    /// as a cache, valid until the next writable use. A no-op if the
    /// chunk isn't `Swapped` by the time this runs -- already
    /// resident, already mid-transition, or raced with another caller
    /// (the preemptive-load policy calls this speculatively, without
    /// holding any lock across the call).
    fn swap_in(self: &Arc<Self>, id: ChunkId) -> Result<(), RambrainError> {
        {
            let state = self.state.lock().unwrap();
            if state.registry.get(id).map(|c| c.state) != Some(ChunkState::Swapped) {
                return Ok(());
            }
        }

        if self.state.lock().unwrap().used_memory + self.chunk_size(id) > self.config.memory_ceiling {
            self.evict_for(self.chunk_size(id))?;
        }

        let size = self.chunk_size(id);
        if size == 0 {
            let mut state = self.state.lock().unwrap();
            if let Some(chunk) = state.registry.get_mut(id) {
                if chunk.state == ChunkState::Swapped {
                    chunk.state = ChunkState::Allocated;
                }
            }
            self.swap_cond.notify_all();
            return Ok(());
        }

        let buffer = RamBuffer::alloc(size, self.config.dma).map_err(|_| RambrainError::OutOfMemory {
            requested: size,
            ceiling: self.config.memory_ceiling,
        })?;
        let ptr = buffer.as_ptr();

        let mut state = self.state.lock().unwrap();
        let chunk = match state.registry.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if chunk.state != ChunkState::Swapped {
            // Raced with another caller (e.g. a concurrent `set_use`
            // already faulted this chunk back in); let their
            // transition stand and drop this buffer unused.
            return Ok(());
        }

        let placement = chunk.placement.expect("Swapped chunks carry a placement");
        chunk.loc = Some(buffer);
        chunk.state = ChunkState::SwapIn;
        state.used_memory += size;
        drop(state);

        self.stats.record_action_queued();
        let manager = Arc::clone(self);
        let buffer = BufferHandle::new(ptr, size);
        self.backend.schedule_read(
            id,
            placement,
            buffer,
            Box::new(move |result| manager.on_read_complete(id, result)),
        );
        Ok(())
    }

    fn on_write_complete(self: Arc<Self>, id: ChunkId, result: Result<(), RambrainError>) {
        if let Err(e) = result {
            log::error!("swap-out failed for chunk {:?}: {}", id, e);
            panic!("rambrain: unrecoverable swap-out failure: {}", e);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(chunk) = state.registry.get_mut(id) {
            let size = chunk.size;
            chunk.loc = None;
            chunk.state = ChunkState::Swapped;
            state.used_memory -= size;
            self.stats.record_swap_out(size);
            log::trace!("chunk {:?} swap-out completed", id);
        }
        drop(state);
        self.swap_cond.notify_all();
    }

    fn on_read_complete(self: Arc<Self>, id: ChunkId, result: Result<(), RambrainError>) {
        if let Err(e) = result {
            log::error!("swap-in failed for chunk {:?}: {}", id, e);
            panic!("rambrain: unrecoverable swap-in failure: {}", e);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(chunk) = state.registry.get_mut(id) {
            chunk.state = if chunk.use_count > 0 {
                ChunkState::AllocatedInUseRead
            } else {
                ChunkState::Allocated
            };
            self.stats.record_swap_in(chunk.size);
            log::trace!("chunk {:?} swap-in completed", id);
        }
        drop(state);
        self.swap_cond.notify_all();
    }
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
#[allow(dead_code)]
fn manager_is_send_sync() {
    assert_send_sync::<Manager>();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ConfigBuilder;

    fn small_manager() -> Arc<Manager> {
        let config = ConfigBuilder::new(1024, 1 << 20).build().unwrap();
        Manager::with_memory_swap(config)
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let manager = small_manager();
        let id = manager.allocate(64).expect("should allocate");
        manager.set_use(id, true).expect("should use");

        let ptr = manager.loc_ptr(id).expect("resident after use");
        unsafe { std::ptr::write_bytes(ptr, 0x42, 64) };

        manager.unset_use(id, 1);
        manager.free(id);
    }

    #[test]
    fn eviction_makes_room_and_faults_back_in() {
        let manager = small_manager();
        let a = manager.allocate(600).unwrap();
        let b = manager.allocate(600).unwrap();

        manager.set_use(a, true).unwrap();
        manager.unset_use(a, 1);

        // Allocating `b` forced `a` to swap out since both can't be
        // resident under a 1024-byte ceiling; using it again should
        // transparently fault it back in.
        let _ = b;
        manager.set_use(a, false).expect("should fault back in");
        manager.unset_use(a, 1);
    }

    #[test]
    fn zero_size_chunk_never_touches_swap() {
        let manager = small_manager();
        let id = manager.allocate(0).unwrap();
        manager.set_use(id, true).unwrap();
        manager.unset_use(id, 1);
        manager.free(id);
    }

    #[test]
    fn cached_swap_is_invalidated_on_writable_use() {
        let manager = small_manager();
        let a = manager.allocate(600).unwrap();
        let b = manager.allocate(600).unwrap();
        let _ = b;

        // Force `a` out and back in, leaving a cached placement.
        manager.set_use(a, false).unwrap();
        manager.unset_use(a, 1);

        // A writable use must invalidate the cache rather than leave
        // stale bytes on disk silently out of sync.
        manager.set_use(a, true).unwrap();
        manager.unset_use(a, 1);
    }

    #[test]
    fn swap_out_respects_swap_ceiling() {
        let config = ConfigBuilder::new(1024, 500).build().unwrap();
        let manager = Manager::with_memory_swap(config);

        let a = manager.allocate(600).unwrap();
        manager.set_use(a, true).unwrap();
        manager.unset_use(a, 1);

        // `b` needs `a` evicted to fit under the memory ceiling, but
        // `a`'s 600 bytes alone exceed the 500-byte swap ceiling.
        let err = manager.allocate(600).expect_err("swap ceiling should block eviction");
        assert!(matches!(err, RambrainError::OutOfSwap { .. }));
    }

    #[test]
    fn preemptive_swap_in_prefetches_ring_neighbor() {
        let config = ConfigBuilder::new(1024, 1 << 20).swap_in_fraction(1.0).build().unwrap();
        let manager = Manager::with_memory_swap(config);

        let a = manager.allocate(100).unwrap();
        let b = manager.allocate(100).unwrap();
        // Forces both `a` and `b` out to make room; `big` is the only
        // chunk left resident once this returns.
        let big = manager.allocate(900).unwrap();

        let swapped_before = [a, b]
            .iter()
            .filter(|id| {
                manager.state.lock().unwrap().registry.get(**id).map(|c| c.state) == Some(ChunkState::Swapped)
            })
            .count();
        assert_eq!(swapped_before, 2, "both small chunks should have been evicted for `big`");

        manager.set_use(big, true).unwrap();
        manager.unset_use(big, 1);

        // `big` is the only other cell in the ring, so one of its two
        // neighbors -- whichever `big` is adjacent to -- should have
        // been speculatively swapped back in.
        let swapped_after = [a, b]
            .iter()
            .filter(|id| {
                manager.state.lock().unwrap().registry.get(**id).map(|c| c.state) == Some(ChunkState::Swapped)
            })
            .count();
        assert_eq!(swapped_after, 1, "preemptive load should have faulted one neighbor back in");
    }

    #[test]
    fn preemptive_load_disabled_leaves_neighbor_swapped() {
        let config = ConfigBuilder::new(1024, 1 << 20)
            .swap_in_fraction(1.0)
            .preemptive_load(false)
            .build()
            .unwrap();
        let manager = Manager::with_memory_swap(config);

        let a = manager.allocate(100).unwrap();
        let b = manager.allocate(100).unwrap();
        let big = manager.allocate(900).unwrap();

        manager.set_use(big, true).unwrap();
        manager.unset_use(big, 1);

        let swapped = [a, b]
            .iter()
            .filter(|id| {
                manager.state.lock().unwrap().registry.get(**id).map(|c| c.state) == Some(ChunkState::Swapped)
            })
            .count();
        assert_eq!(swapped, 2, "preemptive_load(false) must not prefetch anything");
    }
}
