//! Rambrain's error hierarchy.  Allocation-time failures
//! (`OutOfMemory`, `OutOfSwap`, `Config`) are ordinary `Result::Err`
//! values; failures detected off the caller's stack, in the async I/O
//! worker pool, are unrecoverable and are raised through `panic!`
//! instead (see `invariant` below).
use thiserror::Error;

/// Every way a Rambrain operation can fail.
#[derive(Error, Debug)]
pub enum RambrainError {
    /// The RAM ceiling was reached and no chunk could be evicted to
    /// make room.
    #[error("out of memory: requested {requested} bytes, ceiling is {ceiling} bytes")]
    OutOfMemory { requested: usize, ceiling: usize },

    /// The swap ceiling was reached (`SwapPolicy::Fixed`), or the
    /// backing filesystem ran out of room while extending
    /// (`SwapPolicy::AutoExtendable`).
    #[error("out of swap: requested {requested} bytes, {available} bytes available")]
    OutOfSwap { requested: usize, available: usize },

    /// The asynchronous I/O layer reported a non-retryable failure.
    /// Fatal: the chunk's residency can no longer be trusted.
    #[error("swap I/O failed for chunk {chunk}: {source}")]
    SwapIo {
        chunk: u32,
        #[source]
        source: std::io::Error,
    },

    /// Swap-file creation, truncation, or resizing failed at startup
    /// or during an extend.
    #[error("swap configuration error: {0}")]
    Config(#[from] std::io::Error),

    /// The chunk state machine reached a state it should never reach.
    /// Fatal.
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),
}

/// Logs and panics if `cond` doesn't hold.  Used at every point the
/// design calls "any other pre-state is an invariant violation".
#[inline]
pub(crate) fn invariant(cond: bool, msg: &'static str) {
    if !cond {
        log::error!("invariant violated: {}", msg);
        panic!("rambrain: invariant violated: {}", msg);
    }
}
