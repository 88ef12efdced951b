//! # Transport Seam
//!
//! The broadcaster never writes to a socket itself. It hands every published
//! slot to a [`TransportSink`] together with a [`Completion`]; the sink fires
//! the completion once the network write is done, which frees the slot.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::core::slot_pool::MessageId;

/// Id of a connected viewer session.
pub type SessionId = usize;

type ReleaseFn = Box<dyn FnOnce(MessageId, Option<BytesMut>) + Send + Sync + 'static>;

/// One filled slot on its way to the viewers.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Lease id of the slot that carried the payload.
    pub id: MessageId,
    pub payload: Bytes,
    /// Target sessions. Empty means every connected session.
    pub destinations: Vec<SessionId>,
    pub binary: bool,
}

/// Single-use completion callback for one published frame.
///
/// Calling [`Completion::complete`] releases the slot. A completion that is
/// dropped without being called completes itself, so a sink can never fire it
/// twice or forget it. Sharing it behind an `Arc` across several sessions
/// completes the frame when the last session lets go.
pub struct Completion {
    id: MessageId,
    storage: Option<BytesMut>,
    on_complete: Option<ReleaseFn>,
}

impl Completion {
    /// Builds a completion around an arbitrary callback.
    pub fn new<F>(id: MessageId, on_complete: F) -> Self
    where
        F: FnOnce(MessageId) + Send + Sync + 'static,
    {
        Self {
            id,
            storage: None,
            on_complete: Some(Box::new(move |id, _| on_complete(id))),
        }
    }

    /// Completion that also hands the slot's spare storage back for reuse.
    pub(crate) fn with_storage(id: MessageId, storage: BytesMut, on_complete: ReleaseFn) -> Self {
        Self {
            id,
            storage: Some(storage),
            on_complete: Some(on_complete),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Signals that the network write for this frame has finished.
    pub fn complete(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(self.id, self.storage.take());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("pending", &self.on_complete.is_some())
            .finish()
    }
}

/// Socket layer that writes frames to viewer sessions.
///
/// `send` must not block. The completion may be fired from any thread, at any
/// later time, but it is fired exactly once.
pub trait TransportSink: Send + Sync + 'static {
    fn send(&self, frame: OutboundFrame, on_complete: Completion);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_completion_fires_once_when_called() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let completion = Completion::new(7, move |id| {
            assert_eq!(id, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        completion.complete();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_completion_completes_itself() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        drop(Completion::new(1, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_completion_fires_after_last_holder() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let shared = Arc::new(Completion::new(3, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let sessions: Vec<_> = (0..3).map(|_| Arc::clone(&shared)).collect();
        drop(shared);
        for (written, session) in sessions.into_iter().enumerate() {
            assert_eq!(calls.load(Ordering::SeqCst), 0, "fired after {} writes", written);
            drop(session);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
