//! # Core Engine Module
//!
//! Moves signal packages from producers to viewer sessions through a bounded
//! pool of reusable buffers.
//!
//! ## Core Components:
//!
//! - **`slot_pool`**: The circular slot table. Round-robin scan, lease ids and
//!   stale-lease reclamation. Plain data, owned by one task.
//!
//! - **`broadcaster`**: Runs the pool on a dedicated worker task. Producers ask
//!   for a slot asynchronously, fill it, and publish it; the transport's
//!   completion hands it back.
//!
//! - **`transport`**: The seam to the socket layer: the outbound frame and its
//!   single-use completion.
//!
//! - **`batch_cache`**: Batches small text packages into array-shaped
//!   messages and flushes them on size or on a timer.
//!
//! - **`error`**: The error type shared by all of the above.

#![forbid(unsafe_code)]

/// Coalescing cache in front of the broadcaster.
pub mod batch_cache;
/// Asynchronous slot allocation and publishing.
pub mod broadcaster;
/// Errors returned by the engine.
pub mod error;
/// The circular slot table.
pub mod slot_pool;
/// Frame and completion types handed to the socket layer.
pub mod transport;

// --- Public API Re-exports ---
pub use batch_cache::{BatchCache, CacheEntry, CacheStats, PayloadPublisher};
pub use broadcaster::{Broadcaster, SlotHandle};
pub use error::BroadcastError;
pub use slot_pool::{MessageId, PoolSnapshot, SlotInfo, SlotStatus};
pub use transport::{Completion, OutboundFrame, SessionId, TransportSink};
