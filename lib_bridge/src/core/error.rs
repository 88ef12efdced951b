//! # Broadcast Errors
//!
//! Every failure the broadcast core can hand back to a producer. A saturated
//! pool is answered by waiting; only a timeout or a dead worker turns into an
//! error.

use thiserror::Error;

use crate::configs::bridge_config::ConfigError;
use crate::core::slot_pool::MessageId;

/// Errors surfaced by the `Broadcaster` and the `BatchCache`.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The allocation worker is gone, so a slot request can never be answered.
    #[error("Data broadcaster failed to allocate memory: out of resources")]
    OutOfResources,

    /// No slot was handed out within the caller's timeout.
    #[error("No memory slot became available within {0} ms")]
    AcquireTimeout(u64),

    /// More hand-released ids are queued than the pool has slots.
    #[error("Completion queue is full while releasing message {id}; a caller is leaking releases")]
    CompletionOverflow {
        /// Id of the completion that could not be queued.
        id: MessageId,
    },

    /// The merged cache message did not match its pre-computed size.
    #[error("Merged message size mismatch: computed {expected} bytes, wrote {actual} bytes")]
    MergeSizeMismatch {
        /// Size computed before the merge.
        expected: usize,
        /// Bytes actually written.
        actual: usize,
    },

    /// The broadcaster or cache was constructed from an unusable configuration.
    #[error("Invalid bridge configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The component has been shut down.
    #[error("Data broadcaster has been shut down")]
    ShutDown,
}
