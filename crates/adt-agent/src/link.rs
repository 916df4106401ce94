use adt_core::protocol::Envelope;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Path from background producers to the current connection's writer.
///
/// Attached only while a connection is up. Sends while detached are dropped,
/// so nothing produced during a gap is replayed after reconnecting.
#[derive(Clone, Default)]
pub struct OutboundLink {
    sender: Arc<Mutex<Option<mpsc::Sender<Envelope>>>>,
}

impl OutboundLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sender: mpsc::Sender<Envelope>) {
        *self.lock() = Some(sender);
    }

    pub fn detach(&self) {
        *self.lock() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }

    /// Queues `envelope` without waiting. Returns false when it was dropped.
    pub fn send(&self, envelope: Envelope) -> bool {
        let sender = self.lock().clone();
        match sender {
            Some(sender) => sender.try_send(envelope).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::Sender<Envelope>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adt_core::protocol::ErrorPayload;

    fn envelope() -> Envelope {
        Envelope::Error(ErrorPayload {
            code: 1,
            message: "x".to_string(),
        })
    }

    #[test]
    fn detached_link_drops_envelopes() {
        let link = OutboundLink::new();
        assert!(!link.send(envelope()));

        let (tx, mut rx) = mpsc::channel(4);
        link.attach(tx);
        assert!(link.send(envelope()));
        assert_eq!(rx.try_recv().ok(), Some(envelope()));

        link.detach();
        assert!(!link.is_attached());
        assert!(!link.send(envelope()));
        assert!(rx.try_recv().is_err());
    }
}
