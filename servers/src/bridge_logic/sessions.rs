//! Viewer session bookkeeping and the WebSocket side of the broadcaster.
//!
//! Every connected viewer owns an outbound queue. [`SessionRegistry`] fans a
//! published frame out to the queues of its destination sessions; the socket
//! task of each session writes it and then lets go of its share of the frame's
//! completion. The slot is released once the last session has done so.

use bytes::Bytes;
use lib_bridge::core::transport::{Completion, OutboundFrame, SessionId, TransportSink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Called with every message a viewer sends to the bridge.
pub type ForwardFn = Arc<dyn Fn(SessionId, &[u8]) + Send + Sync>;

/// One frame queued for one session.
#[derive(Debug)]
pub struct Outgoing {
    pub payload: Bytes,
    pub binary: bool,
    /// Shared with the other destination sessions of the same frame.
    pub completion: Arc<Completion>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Outgoing>>>,
    next_id: AtomicUsize,
    forward: RwLock<ForwardFn>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            forward: RwLock::new(Arc::new(|session_id: SessionId, message: &[u8]| {
                log::debug!(
                    "Message from session {}: {}",
                    session_id,
                    String::from_utf8_lossy(message)
                );
            })),
        }
    }

    /// Adds a session and returns its id with the receiving end of its queue.
    pub fn register(&self) -> (SessionId, mpsc::UnboundedReceiver<Outgoing>) {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .expect("Session registry lock poisoned")
            .insert(session_id, tx);
        (session_id, rx)
    }

    pub fn unregister(&self, session_id: SessionId) {
        self.sessions
            .lock()
            .expect("Session registry lock poisoned")
            .remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("Session registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_forward_callback(&self, forward: ForwardFn) {
        *self.forward.write().expect("Forward callback lock poisoned") = forward;
    }

    /// Passes a viewer message to the current forward callback.
    pub fn forward(&self, session_id: SessionId, message: &[u8]) {
        let forward = Arc::clone(&self.forward.read().expect("Forward callback lock poisoned"));
        forward(session_id, message);
    }

    fn targets(&self, destinations: &[SessionId]) -> Vec<(SessionId, mpsc::UnboundedSender<Outgoing>)> {
        let sessions = self.sessions.lock().expect("Session registry lock poisoned");
        if destinations.is_empty() {
            return sessions.iter().map(|(id, tx)| (*id, tx.clone())).collect();
        }

        destinations
            .iter()
            .filter_map(|id| match sessions.get(id) {
                Some(tx) => Some((*id, tx.clone())),
                None => {
                    log::warn!("Session {} not found; frame not delivered to it.", id);
                    None
                }
            })
            .collect()
    }
}

impl TransportSink for SessionRegistry {
    fn send(&self, frame: OutboundFrame, on_complete: Completion) {
        if frame.payload.is_empty() {
            log::debug!("Empty frame for message id {}; completing at once.", frame.id);
            on_complete.complete();
            return;
        }

        let targets = self.targets(&frame.destinations);
        if targets.is_empty() {
            log::debug!("No session to deliver message id {} to; completing at once.", frame.id);
            on_complete.complete();
            return;
        }

        let completion = Arc::new(on_complete);
        for (session_id, tx) in targets {
            let outgoing = Outgoing {
                payload: frame.payload.clone(),
                binary: frame.binary,
                completion: Arc::clone(&completion),
            };
            if tx.send(outgoing).is_err() {
                log::debug!("Session {} closed before message id {} was queued.", session_id, frame.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn frame(destinations: Vec<SessionId>, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame {
            id: 0,
            payload: Bytes::from_static(payload),
            destinations,
            binary: false,
        }
    }

    fn counting_completion(calls: &Arc<AtomicUsize>) -> Completion {
        let calls = Arc::clone(calls);
        Completion::new(0, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_empty_destinations_reach_every_session() {
        let registry = SessionRegistry::new();
        let (_, mut rx_a) = registry.register();
        let (_, mut rx_b) = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.send(frame(vec![], b"hello"), counting_completion(&calls));

        let a = rx_a.try_recv().unwrap();
        let b = rx_b.try_recv().unwrap();
        assert_eq!(&a.payload[..], b"hello");
        drop(a);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "one session still holds the frame");
        drop(b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_sessions_are_skipped() {
        let registry = SessionRegistry::new();
        let (known, mut rx) = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.send(frame(vec![known, 999], b"x"), counting_completion(&calls));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_valid_session_completes_immediately() {
        let registry = SessionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.send(frame(vec![42], b"x"), counting_completion(&calls));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_payload_completes_immediately() {
        let registry = SessionRegistry::new();
        let (_, mut rx) = registry.register();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.send(frame(vec![], b""), counting_completion(&calls));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_callback_can_be_replaced() {
        let registry = SessionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.set_forward_callback(Arc::new(move |session_id: SessionId, message: &[u8]| {
            sink.lock().unwrap().push((session_id, message.to_vec()));
        }));

        registry.forward(3, b"ping");
        assert_eq!(*seen.lock().unwrap(), vec![(3, b"ping".to_vec())]);
    }

    #[test]
    fn test_unregistered_session_no_longer_receives() {
        let registry = SessionRegistry::new();
        let (id, _rx) = registry.register();
        registry.unregister(id);
        assert!(registry.is_empty());
    }
}
