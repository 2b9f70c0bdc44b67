//! Error types for the engine, scheduler and cache manager.

use thiserror::Error;

use crate::sequence::RequestId;

/// Error type for pagedserve-core.
///
/// Variants fall into three groups:
/// - rejected at the boundary and never enqueued (`InvalidRequest`, `CapacityExceeded`),
/// - recovered locally by the scheduler (`OutOfMemory`),
/// - fatal for the affected unit of work (`ExecutorFailure`) or a bug
///   (`DoubleFree`, `AllocatorInvariantViolation`).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed request, rejected by `add_request`.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request could never fit in the KV cache, even with every other sequence preempted.
    #[error(
        "request needs up to {required_blocks} KV cache blocks but the pool only has {num_blocks}"
    )]
    CapacityExceeded {
        required_blocks: usize,
        num_blocks: usize,
    },

    /// The block pool is exhausted. The scheduler recovers from this by preemption.
    #[error("out of KV cache blocks")]
    OutOfMemory,

    /// `free` was called for a sequence whose blocks were already released.
    #[error("sequence {0} experienced a double free")]
    DoubleFree(RequestId),

    /// Internal bookkeeping is inconsistent. Always a bug.
    #[error("allocator invariant violated: {0}")]
    AllocatorInvariantViolation(String),

    /// The model executor (or sampler) failed; every sequence of the batch was aborted.
    #[error("model executor failed for requests {request_ids:?}: {source}")]
    ExecutorFailure {
        request_ids: Vec<RequestId>,
        #[source]
        source: anyhow::Error,
    },

    /// The request was canceled by the caller.
    #[error("request {0} was aborted by the user")]
    AbortedByUser(RequestId),

    /// The request was aborted because the model executor failed on its batch.
    #[error("request {0} was aborted after a model executor failure")]
    RequestFailed(RequestId),

    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// The engine behind an `EngineHandle` was dropped.
    #[error("the engine is no longer accepting requests")]
    Disconnected,

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// `true` for the error classes that indicate a bug rather than a runtime condition.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree(_) | Self::AllocatorInvariantViolation(_)
        )
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::AllocatorInvariantViolation(msg.into())
    }
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
