//! The C-callable facade (component G): a process-wide manager reached
//! through a handful of `#[no_mangle] extern "C"` entry points.
//!
//! A single global [`Manager`] backs every call; `rambrain_init` must
//! run first. Handles carry a fixed magic token alongside the chunk
//! id, checked before any lookup, so a garbage or stale integer can be
//! rejected instead of fed into a live dereference.
use std::sync::{Arc, OnceLock};

use crate::chunk::ChunkId;
use crate::config::{Config, ConfigBuilder, SwapPolicy};
use crate::manager::Manager;

// A `OnceLock`, not `lazy_static`'s `Mutex`-guarded static: once set,
// reading it is a lock-free load, which `rambrain_dump_stats` below
// depends on to stay callable from a signal handler.
static MANAGER: OnceLock<Arc<Manager>> = OnceLock::new();

/// Stamped into every handle this facade hands out; rejected on
/// mismatch so a garbage integer (or a handle from a different
/// process generation) is never fed into a live lookup.
const HANDLE_MAGIC: u32 = 0x5241_4d42; // "RAMB"

/// An opaque, non-pointer reference to a chunk. `id` is `0` and
/// `magic` is `0` for [`RambrainHandle::INVALID`], the value every
/// fallible entry point returns on failure.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RambrainHandle {
    id: u32,
    magic: u32,
}

impl RambrainHandle {
    pub const INVALID: RambrainHandle = RambrainHandle { id: 0, magic: 0 };

    fn new(id: ChunkId) -> Self {
        Self {
            id: id.as_u32(),
            magic: HANDLE_MAGIC,
        }
    }
}

fn handle_to_id(handle: RambrainHandle) -> Option<ChunkId> {
    if handle.magic != HANDLE_MAGIC {
        return None;
    }
    std::num::NonZeroU32::new(handle.id).map(|n| {
        // SAFETY: `ChunkId` is `#[repr(transparent)]` over `NonZeroU32`
        // and carries no other invariant; any nonzero value round-trips.
        unsafe { std::mem::transmute::<std::num::NonZeroU32, ChunkId>(n) }
    })
}

fn manager() -> Arc<Manager> {
    Arc::clone(MANAGER.get().expect("rambrain_init must run before any other rambrain_* call"))
}

/// Initializes the process-wide manager with an in-memory swap backend
/// (no filesystem writes; suitable for embedding in processes that
/// don't want swap files of their own). Returns `false` if a manager
/// was already initialized.
#[no_mangle]
pub extern "C" fn rambrain_init_memory(memory_ceiling: usize, swap_ceiling: usize) -> bool {
    let config = match ConfigBuilder::new(memory_ceiling, swap_ceiling).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    MANAGER.set(Manager::with_memory_swap(config)).is_ok()
}

/// Initializes the process-wide manager with a file-backed swap store
/// rooted at `file_name_template` (UTF-8, NUL-terminated). Returns
/// `false` on invalid UTF-8, a configuration error, or if a manager
/// was already initialized.
///
/// # Safety
/// `file_name_template` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rambrain_init_file_backed(
    memory_ceiling: usize,
    swap_ceiling: usize,
    file_name_template: *const std::os::raw::c_char,
    auto_extend: bool,
) -> bool {
    let mut builder = ConfigBuilder::new(memory_ceiling, swap_ceiling);
    if !file_name_template.is_null() {
        let template = match std::ffi::CStr::from_ptr(file_name_template).to_str() {
            Ok(s) => s.to_owned(),
            Err(_) => return false,
        };
        builder = builder.file_name_template(template);
    }
    if auto_extend {
        builder = builder.swap_policy(SwapPolicy::AutoExtendable);
    }

    let config: Config = match builder.build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    let manager = match Manager::with_file_swap(config) {
        Ok(m) => m,
        Err(_) => return false,
    };
    MANAGER.set(manager).is_ok()
}

/// Allocates a fresh chunk of `size` bytes with one reference already
/// held, returning an opaque handle ([`RambrainHandle::INVALID`] on
/// failure).
#[no_mangle]
pub extern "C" fn rambrain_allocate(size: usize) -> RambrainHandle {
    match manager().allocate(size) {
        Ok(id) => {
            manager().reference(id);
            RambrainHandle::new(id)
        }
        Err(e) => {
            log::error!("rambrain_allocate failed: {}", e);
            RambrainHandle::INVALID
        }
    }
}

/// Adds one external reference to `handle`. No-op on an invalid
/// handle.
#[no_mangle]
pub extern "C" fn rambrain_reference(handle: RambrainHandle) {
    if let Some(id) = handle_to_id(handle) {
        manager().reference(id);
    }
}

/// Drops one external reference to `handle`, freeing the chunk once
/// none remain. No-op on an invalid handle.
#[no_mangle]
pub extern "C" fn rambrain_dereference(handle: RambrainHandle) {
    if let Some(id) = handle_to_id(handle) {
        manager().dereference(id);
    }
}

/// Pins `handle` resident and returns a pointer to its bytes, or NULL
/// on an invalid handle or allocation/swap failure. Pair with
/// `rambrain_unset_use`.
#[no_mangle]
pub extern "C" fn rambrain_set_use(handle: RambrainHandle, writable: bool) -> *mut u8 {
    let id = match handle_to_id(handle) {
        Some(id) => id,
        None => return std::ptr::null_mut(),
    };
    match manager().set_use(id, writable) {
        Ok(()) => manager().loc_ptr(id).unwrap_or(std::ptr::null_mut()),
        Err(e) => {
            log::error!("rambrain_set_use failed: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Releases one use count on `handle`. No-op on an invalid handle.
#[no_mangle]
pub extern "C" fn rambrain_unset_use(handle: RambrainHandle) {
    if let Some(id) = handle_to_id(handle) {
        manager().unset_use(id, 1);
    }
}

/// Writes a human-readable statistics line to stderr. Safe to call
/// from a signal handler: touches only relaxed atomics.
#[no_mangle]
pub extern "C" fn rambrain_dump_stats() {
    if let Some(manager) = MANAGER.get() {
        eprintln!("rambrain stats: {}", manager.stats().snapshot());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // `MANAGER` is a process-wide `OnceLock`: only one test in this
    // process may initialize it, so the full init -> allocate -> use
    // -> free path is exercised in a single test rather than split
    // across several that would race on first-call-wins semantics.
    #[test]
    fn full_lifecycle_through_the_c_facade() {
        assert!(rambrain_init_memory(1 << 16, 1 << 20));
        // A second init attempt must fail rather than silently swap
        // out the already-published manager.
        assert!(!rambrain_init_memory(1 << 16, 1 << 20));

        let handle = rambrain_allocate(256);
        assert_ne!(handle.id, RambrainHandle::INVALID.id);

        let ptr = rambrain_set_use(handle, true);
        assert!(!ptr.is_null());
        unsafe { std::ptr::write_bytes(ptr, 0xAB, 256) };
        rambrain_unset_use(handle);

        rambrain_reference(handle);
        rambrain_dereference(handle);
        rambrain_dereference(handle);

        // A stale id wrapped in a correctly-stamped handle must be
        // rejected by the manager lookup, not dereferenced.
        let stale = RambrainHandle {
            id: handle.id.wrapping_add(999),
            magic: handle.magic,
        };
        assert_eq!(rambrain_set_use(stale, false), std::ptr::null_mut());

        // A handle with the right id but a forged/corrupted magic
        // token must be rejected before it ever reaches the manager.
        let forged = RambrainHandle {
            id: handle.id,
            magic: 0xDEAD_BEEF,
        };
        assert_eq!(rambrain_set_use(forged, false), std::ptr::null_mut());

        rambrain_dump_stats();
    }
}
