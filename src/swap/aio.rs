//! A portable asynchronous I/O queue (component C), backed by a plain
//! worker pool rather than a kernel-specific AIO interface: each
//! worker pulls a sub-request, performs a positioned, synchronous
//! read/write, and is itself the thread that decrements the owning
//! transaction's counter and, if it reaches zero, runs the completion
//! action. That preserves the contract the rest of the engine depends
//! on: sub-requests of one transaction complete before its terminal
//! action runs, and completions across different transactions are
//! unordered.
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::RambrainError;

/// A transient, cross-thread view of a slice of a chunk's RAM buffer.
///
/// # Safety
/// Valid only as long as the owning chunk stays in `SwapIn`/`SwapOut`
/// for the duration of the transaction, which the manager guarantees
/// by construction (no other code path touches the buffer while a
/// transaction referencing it is in flight).
#[derive(Clone, Copy)]
pub(crate) struct BufferHandle {
    ptr: *mut u8,
    len: usize,
}

impl BufferHandle {
    pub(crate) fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Returns the sub-range `[offset, offset + len)` of this buffer,
    /// used to split a multi-region placement's transfer across its
    /// backing file regions while keeping each sub-request's buffer
    /// view correctly offset.
    pub(crate) fn sub_slice(&self, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "sub_slice out of bounds");
        Self {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub(crate) fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

unsafe impl Send for BufferHandle {}

pub(crate) enum AioOp {
    Read,
    Write,
}

pub(crate) struct AioRequest {
    pub(crate) file: Arc<File>,
    pub(crate) file_offset: u64,
    /// The portion of the chunk's buffer this sub-request covers;
    /// length must match the placement region's length.
    pub(crate) buffer: BufferHandle,
    pub(crate) op: AioOp,
}

type CompletionFn = Box<dyn FnOnce(Result<(), RambrainError>) + Send>;

struct Transaction {
    remaining: AtomicUsize,
    failure: Mutex<Option<RambrainError>>,
    on_complete: Mutex<Option<CompletionFn>>,
}

impl Transaction {
    fn record(&self, result: Result<(), RambrainError>) {
        if let Err(e) = result {
            let mut failure = self.failure.lock().unwrap();
            if failure.is_none() {
                *failure = Some(e);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let outcome = match self.failure.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            };
            if let Some(cb) = self.on_complete.lock().unwrap().take() {
                cb(outcome);
            }
        }
    }
}

struct Job {
    request: AioRequest,
    transaction: Arc<Transaction>,
    chunk: u32,
}

/// The shared submission FIFO; cloned into every worker thread.
struct QueueState {
    jobs: Mutex<VecDeque<Job>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl QueueState {
    fn worker_loop(&self) {
        loop {
            let job = {
                let mut jobs = self.jobs.lock().unwrap();
                loop {
                    if let Some(job) = jobs.pop_front() {
                        break Some(job);
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    jobs = self.cond.wait(jobs).unwrap();
                }
            };

            let job = match job {
                Some(job) => job,
                None => return,
            };

            let result = perform(&job.request, job.chunk);
            job.transaction.record(result);
        }
    }
}

/// The submission FIFO plus its worker pool.  Not `Clone`; holds the
/// `JoinHandle`s outright so `Drop` can wait for workers to exit.
pub(crate) struct AioQueue {
    state: Arc<QueueState>,
    workers: Vec<JoinHandle<()>>,
}

impl AioQueue {
    pub(crate) fn new(num_workers: usize) -> Self {
        let state = Arc::new(QueueState {
            jobs: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..num_workers.max(1))
            .map(|worker_id| {
                let state = Arc::clone(&state);
                std::thread::Builder::new()
                    .name(format!("rambrain-aio-{}", worker_id))
                    .spawn(move || state.worker_loop())
                    .expect("failed to spawn rambrain AIO worker")
            })
            .collect();

        Self { state, workers }
    }

    /// Submits every sub-request in `requests` as one transaction;
    /// `on_complete` runs on whichever worker thread completes last.
    pub(crate) fn submit(&self, chunk: u32, requests: Vec<AioRequest>, on_complete: CompletionFn) {
        let transaction = Arc::new(Transaction {
            remaining: AtomicUsize::new(requests.len()),
            failure: Mutex::new(None),
            on_complete: Mutex::new(Some(on_complete)),
        });

        let mut jobs = self.state.jobs.lock().unwrap();
        for request in requests {
            jobs.push_back(Job {
                request,
                transaction: Arc::clone(&transaction),
                chunk,
            });
        }
        self.state.cond.notify_all();
    }

    fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.cond.notify_all();
    }
}

impl Drop for AioQueue {
    fn drop(&mut self) {
        self.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn perform(request: &AioRequest, chunk: u32) -> Result<(), RambrainError> {
    let outcome = match request.op {
        AioOp::Write => request.file.write_at(request.buffer.as_slice(), request.file_offset),
        AioOp::Read => request.file.read_at(request.buffer.as_mut_slice(), request.file_offset),
    };

    match outcome {
        Ok(n) if n == request.buffer.len => Ok(()),
        Ok(n) => Err(RambrainError::SwapIo {
            chunk,
            source: std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short I/O: {} of {} bytes", n, request.buffer.len),
            ),
        }),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::Interrupted) => {
            // Retry once, synchronously; a second interruption is
            // treated as a genuine failure rather than looping forever.
            perform_retry(request, chunk)
        }
        Err(e) => Err(RambrainError::SwapIo { chunk, source: e }),
    }
}

fn perform_retry(request: &AioRequest, chunk: u32) -> Result<(), RambrainError> {
    let outcome = match request.op {
        AioOp::Write => request.file.write_at(request.buffer.as_slice(), request.file_offset),
        AioOp::Read => request.file.read_at(request.buffer.as_mut_slice(), request.file_offset),
    };
    outcome
        .map(|_| ())
        .map_err(|source| RambrainError::SwapIo { chunk, source })
}
