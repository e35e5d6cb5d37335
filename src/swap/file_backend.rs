//! The file-backed `SwapBackend` (component B + the file half of
//! component D): a growable set of plain files opened from a
//! caller-supplied name template, carved up by a [`PlacementArena`].
//!
//! Grounded directly on `managedFileSwap.cpp`'s constructor (file
//! naming/opening/DMA probing), `pfmalloc`/`pffree` (the allocator,
//! lifted into `placement.rs`), and `extendSwap`/`extendSwapByPolicy`
//! (the policy-driven growth implemented in [`FileSwap::alloc`]
//! below).
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::{Mutex, RwLock};

use crate::chunk::ChunkId;
use crate::config::{Config, SwapPolicy};
use crate::error::RambrainError;
use crate::stats::Stats;
use crate::swap::aio::{AioOp, AioQueue, AioRequest, BufferHandle};
use crate::swap::placement::PlacementArena;
use crate::swap::{CompletionFn, PlacementId, SwapBackend};

pub struct FileSwap {
    arena: Mutex<PlacementArena>,
    files: RwLock<Vec<File>>,
    aio: AioQueue,
    file_size: u64,
    name_template: String,
    policy: SwapPolicy,
    resize_fraction: f64,
    dma: bool,
}

impl FileSwap {
    /// Opens the first file (probing for DMA support, per the design's
    /// "on DMA/O_DIRECT failure on file 0, disable DMA and retry") and
    /// returns a ready-to-use backend.
    pub fn open(config: &Config) -> Result<Self, RambrainError> {
        let mut dma = config.dma;
        let first = Self::open_one(&config.file_name_template, 0, dma);
        let first = match (first, dma) {
            (Ok(f), _) => f,
            (Err(_), true) => {
                log::warn!("rambrain: DMA unsupported on this filesystem, disabling");
                dma = false;
                Self::open_one(&config.file_name_template, 0, dma)?
            }
            (Err(e), false) => return Err(RambrainError::Config(e)),
        };
        first.set_len(config.file_size as u64).map_err(RambrainError::Config)?;

        let num_workers = std::thread::available_parallelism()
            .map(|n| (n.get() / 2).max(1))
            .unwrap_or(1);

        let mut arena = PlacementArena::new(config.file_size as u64);
        arena.extend_files(1);

        let backend = Self {
            arena: Mutex::new(arena),
            files: RwLock::new(vec![first]),
            aio: AioQueue::new(num_workers),
            file_size: config.file_size as u64,
            name_template: config.file_name_template.clone(),
            policy: config.swap_policy,
            resize_fraction: config.resize_fraction,
            dma,
        };

        // `Fixed` never grows past what's opened here, so the initial
        // set must already cover the whole swap ceiling rather than
        // just the first file.
        let num_files = ((config.swap_ceiling as u64 + backend.file_size - 1) / backend.file_size).max(1) as usize;
        if num_files > 1 {
            backend.grow(num_files - 1)?;
        }

        Ok(backend)
    }

    fn open_one(template: &str, index: usize, dma: bool) -> io::Result<File> {
        let path = format!("{}-{}", template, index);
        let mut options = OpenOptions::new();
        options.create(true).truncate(true).read(true).write(true);

        #[cfg(target_os = "linux")]
        if dma {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc_o_direct());
        }
        let _ = dma;

        options.open(path)
    }

    /// Adds `extra_files` whole files to the set and registers the
    /// range with the placement arena.
    fn grow(&self, extra_files: usize) -> Result<(), RambrainError> {
        let mut files = self.files.write().unwrap();
        for i in 0..extra_files {
            let index = files.len() + i;
            let file = Self::open_one(&self.name_template, index, self.dma).map_err(RambrainError::Config)?;
            file.set_len(self.file_size).map_err(RambrainError::Config)?;
            files.push(file);
        }
        drop(files);

        self.arena.lock().unwrap().extend_files(extra_files);
        Ok(())
    }

    fn disk_free_bytes(&self) -> u64 {
        // Best-effort: without a `statvfs` binding in this crate's
        // dependency set, report "unbounded" and let the filesystem
        // itself reject the eventual `set_len`/write if it's wrong.
        u64::MAX
    }
}

#[cfg(target_os = "linux")]
fn libc_o_direct() -> i32 {
    0o40000 // O_DIRECT, from <fcntl.h>; avoids a direct libc dependency.
}

fn round_up_to_page(size: usize) -> usize {
    let page = crate::map::page_size();
    (size + page - 1) / page * page
}

impl SwapBackend for FileSwap {
    fn alloc(&self, size: usize, owner: ChunkId) -> Result<PlacementId, RambrainError> {
        // O_DIRECT requires page-aligned file offsets and lengths;
        // rounding the request up here keeps every placement the arena
        // carves a whole number of pages, since `file_size` is itself
        // a page multiple (see `ConfigBuilder::build`).
        let size = if self.dma {
            round_up_to_page(size)
        } else {
            size
        };
        loop {
            let attempt = self.arena.lock().unwrap().alloc(size as u64, owner);
            match attempt {
                Ok(placement) => return Ok(placement),
                Err(RambrainError::OutOfSwap { requested, available }) => match self.policy {
                    SwapPolicy::Fixed => {
                        return Err(RambrainError::OutOfSwap { requested, available })
                    }
                    SwapPolicy::AutoExtendable => {
                        let deficit = (requested - available) as u64;
                        let extra_files = ((deficit as f64 / self.resize_fraction / self.file_size as f64).ceil() as usize).max(1);
                        if (extra_files as u64 * self.file_size) > self.disk_free_bytes() {
                            return Err(RambrainError::OutOfSwap { requested, available });
                        }
                        log::warn!("rambrain: extending swap by {} file(s)", extra_files);
                        self.grow(extra_files)?;
                    }
                    SwapPolicy::Interactive => {
                        eprint!(
                            "rambrain: swap exhausted ({} of {} bytes free); how many extra {}-byte files to add? ",
                            available, requested, self.file_size
                        );
                        let mut line = String::new();
                        io::stdin().read_line(&mut line).map_err(RambrainError::Config)?;
                        let extra_files: usize = line.trim().parse().unwrap_or(1).max(1);
                        self.grow(extra_files)?;
                    }
                },
                Err(other) => return Err(other),
            }
        }
    }

    fn free(&self, placement: PlacementId) {
        self.arena.lock().unwrap().free(placement);
    }

    fn schedule_write(
        &self,
        chunk: ChunkId,
        placement: PlacementId,
        buffer: BufferHandle,
        on_complete: CompletionFn,
    ) {
        self.dispatch(chunk, placement, buffer, AioOp::Write, on_complete);
    }

    fn schedule_read(
        &self,
        chunk: ChunkId,
        placement: PlacementId,
        buffer: BufferHandle,
        on_complete: CompletionFn,
    ) {
        self.dispatch(chunk, placement, buffer, AioOp::Read, on_complete);
    }

    fn capacity_bytes(&self) -> u64 {
        self.arena.lock().unwrap().total_bytes()
    }
}

impl FileSwap {
    fn dispatch(
        &self,
        chunk: ChunkId,
        placement: PlacementId,
        buffer: BufferHandle,
        op_kind: AioOp,
        on_complete: CompletionFn,
    ) {
        let regions = self.arena.lock().unwrap().regions(placement);
        let files = self.files.read().unwrap();

        let mut requests = Vec::with_capacity(regions.len());
        let mut buf_offset = 0usize;
        for region in regions {
            let file = &files[region.file_index];
            let required_len = region.offset_in_file + region.length;
            if file.metadata().map(|m| m.len()).unwrap_or(0) < required_len {
                let _ = file.set_len(required_len);
                if matches!(op_kind, AioOp::Write) {
                    // Force allocation on filesystems that leave
                    // `set_len` sparse by touching the new tail page.
                    let _ = file.write_at(&[0u8], required_len.saturating_sub(1));
                }
            }

            requests.push(AioRequest {
                file: std::sync::Arc::new(file.try_clone().expect("fd should be cloneable")),
                file_offset: region.offset_in_file,
                buffer: buffer_slice(buffer, buf_offset, region.length as usize),
                op: clone_op(&op_kind),
            });
            buf_offset += region.length as usize;
        }
        drop(files);

        self.aio.submit(chunk.as_u32(), requests, on_complete);
    }
}

fn clone_op(op: &AioOp) -> AioOp {
    match op {
        AioOp::Read => AioOp::Read,
        AioOp::Write => AioOp::Write,
    }
}

fn buffer_slice(buffer: BufferHandle, offset: usize, len: usize) -> BufferHandle {
    buffer.sub_slice(offset, len)
}
