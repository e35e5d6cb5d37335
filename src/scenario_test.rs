//! End-to-end scenarios exercising the manager, swap engine, and
//! pointer facade together, rather than one module in isolation.
use std::sync::Arc;

use proptest::prelude::*;

use crate::config::{ConfigBuilder, SwapPolicy};
use crate::manager::Manager;
use crate::ptr::ManagedPtr;

const SMALL_CEILING: usize = 8 * 1024;
const GENEROUS_SWAP: usize = 8 << 20;

fn memory_manager(memory_ceiling: usize) -> Arc<Manager> {
    let config = ConfigBuilder::new(memory_ceiling, GENEROUS_SWAP).build().unwrap();
    Manager::with_memory_swap(config)
}

/// Allocate, write once, drop the only reference without ever
/// re-reading: the chunk should swap out lazily (only if evicted) and
/// never round-trip through disk unnecessarily.
#[test]
fn lazy_cached_read() {
    let manager = memory_manager(SMALL_CEILING);
    let mut ptr: ManagedPtr<u8> = manager.allocate_typed(64).unwrap();
    {
        let mut guard = ptr.adhere_mut().unwrap();
        guard.as_mut_slice().fill(7);
    }
    drop(ptr);
}

/// Write a buffer, force it out under memory pressure, read it back,
/// and confirm the bytes survived the round trip through swap.
#[test]
fn manual_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let manager = memory_manager(1536);
    let mut victim: ManagedPtr<u8> = manager.allocate_typed(1024).unwrap();
    {
        let mut guard = victim.adhere_mut().unwrap();
        for (i, b) in guard.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    }

    // Allocate enough to force `victim` out under the 2048-byte ceiling.
    let _pressure: ManagedPtr<u8> = manager.allocate_typed(1024).unwrap();

    let guard = victim.adhere().unwrap();
    for (i, b) in guard.as_slice().iter().enumerate() {
        assert_eq!(*b, (i % 251) as u8);
    }
}

proptest! {
    /// Random reads and writes across many small chunks under tight
    /// memory, confirming every chunk's last-written byte pattern
    /// survives however many evictions happen in between.
    #[test]
    fn random_access_uniform(ops in prop::collection::vec(0usize..8, 1..64)) {
        // 8 chunks of 96 bytes each (768 bytes total) under a ceiling
        // that fits under half of them, forcing repeated eviction.
        let manager = memory_manager(384);
        let mut ptrs: Vec<ManagedPtr<u8>> = (0..8)
            .map(|_| manager.allocate_typed(96).unwrap())
            .collect();
        let mut expected = vec![0u8; 8];

        for (step, idx) in ops.into_iter().enumerate() {
            let value = (step % 256) as u8;
            {
                let mut guard = ptrs[idx].adhere_mut().unwrap();
                guard.as_mut_slice().fill(value);
            }
            expected[idx] = value;

            let guard = ptrs[idx].adhere().unwrap();
            prop_assert!(guard.as_slice().iter().all(|b| *b == value));
        }
    }
}

/// A transpose-like access pattern: two matrices resident together,
/// touched in an interleaved row/column order that keeps evicting and
/// re-faulting both.
#[test]
fn matrix_transpose_like_access() {
    const N: usize = 16;
    // Each N x N f64 matrix is N*N*8 bytes; cap memory at one full
    // matrix plus a sliver, so both can never be resident together.
    let manager = memory_manager(N * N * 8 + 256);

    let mut a: ManagedPtr<f64> = manager.allocate_typed(N * N).unwrap();
    let mut b: ManagedPtr<f64> = manager.allocate_typed(N * N).unwrap();

    {
        let mut guard = a.adhere_mut().unwrap();
        for (i, v) in guard.as_mut_slice().iter_mut().enumerate() {
            *v = i as f64;
        }
    }

    for row in 0..N {
        for col in 0..N {
            let value = {
                let guard = a.adhere().unwrap();
                guard.as_slice()[row * N + col]
            };
            let mut guard = b.adhere_mut().unwrap();
            guard.as_mut_slice()[col * N + row] = value;
        }
    }

    let guard = b.adhere().unwrap();
    for row in 0..N {
        for col in 0..N {
            assert_eq!(guard.as_slice()[col * N + row], (row * N + col) as f64);
        }
    }
}

/// Under `SwapPolicy::Fixed`, exhausting the swap-file set surfaces
/// `OutOfSwap`/`OutOfMemory`; under `AutoExtendable`, the same pattern
/// grows the backing store and succeeds instead.
#[test]
fn swap_policy_fixed_vs_auto_extend() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("rambrainswap").to_str().unwrap().to_owned();

    let fixed_config = ConfigBuilder::new(4096, 1 << 16)
        .file_size(1 << 16)
        .swap_policy(SwapPolicy::Fixed)
        .file_name_template(format!("{}-fixed", template))
        .build()
        .unwrap();
    let fixed_manager = Manager::with_file_swap(fixed_config).unwrap();
    let mut fixed_ptrs = Vec::new();
    let mut out_of_swap = false;
    for _ in 0..40 {
        match fixed_manager.allocate_typed::<u8>(8192) {
            Ok(p) => fixed_ptrs.push(p),
            Err(_) => {
                out_of_swap = true;
                break;
            }
        }
    }
    assert!(out_of_swap, "Fixed policy must eventually refuse once the single swap file fills up");

    let auto_config = ConfigBuilder::new(4096, 1 << 16)
        .file_size(1 << 16)
        .swap_policy(SwapPolicy::AutoExtendable)
        .file_name_template(format!("{}-auto", template))
        .build()
        .unwrap();
    let manager = Manager::with_file_swap(auto_config).unwrap();

    // Allocate well past the single swap file's capacity; AutoExtendable
    // should transparently grow the file set rather than fail.
    let mut ptrs = Vec::new();
    for _ in 0..40 {
        ptrs.push(manager.allocate_typed::<u8>(8192).unwrap());
    }
}

/// A single chunk, alone in the ring, should still evict and fault
/// back in correctly: the "hot window" logic can't assume at least
/// two entries.
#[test]
fn swap_single_island() {
    let manager = memory_manager(64);
    let mut ptr: ManagedPtr<u8> = manager.allocate_typed(64).unwrap();
    {
        let mut guard = ptr.adhere_mut().unwrap();
        guard.as_mut_slice().fill(0x5a);
    }

    // `ptr` is the ring's only entry; this allocation must still be
    // able to evict it to make room, with no second chunk to anchor
    // the hot-window boundary against.
    let pressure: ManagedPtr<u8> = manager.allocate_typed(32).unwrap();
    drop(pressure);

    let guard = ptr.adhere().unwrap();
    assert!(guard.as_slice().iter().all(|b| *b == 0x5a));
}
