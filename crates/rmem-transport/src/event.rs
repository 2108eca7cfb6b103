//! Connection-management event channel.

use crate::transport::{TransportError, TransportResult};
use crate::verbs::CmEvent;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::time::Duration;

/// Queue of connection-management events, consumed one at a time.
///
/// Clones share the same queue. Several handles may report on one channel,
/// as a listening handle and the connections it spawns do.
#[derive(Clone, Debug)]
pub struct EventChannel {
    tx: Sender<CmEvent>,
    rx: Receiver<CmEvent>,
}

impl EventChannel {
    /// Create an empty channel
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Block until the next event arrives
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if every sender is gone.
    pub fn get_event(&self) -> TransportResult<CmEvent> {
        self.rx.recv().map_err(|_| TransportError::Closed)
    }

    /// Wait at most `timeout` for the next event
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] naming `waiting_for` when the wait
    /// elapses.
    pub fn get_event_timeout(
        &self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> TransportResult<CmEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(waiting_for)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    /// Receiving end, for use in `crossbeam_channel::select!`
    #[must_use]
    pub fn receiver(&self) -> &Receiver<CmEvent> {
        &self.rx
    }

    /// Number of events waiting
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn notify(&self, event: CmEvent) {
        // The channel owns a receiver, so this only fails after drop
        let _ = self.tx.send(event);
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::CmEventKind;

    #[test]
    fn test_events_in_order() {
        let channel = EventChannel::new();
        channel.notify(CmEvent::new(CmEventKind::AddrResolved));
        channel.notify(CmEvent::new(CmEventKind::RouteResolved));

        assert_eq!(channel.pending(), 2);
        assert_eq!(channel.get_event().unwrap().kind, CmEventKind::AddrResolved);
        assert_eq!(
            channel.get_event().unwrap().kind,
            CmEventKind::RouteResolved
        );
    }

    #[test]
    fn test_timeout_names_expected_event() {
        let channel = EventChannel::new();
        let err = channel
            .get_event_timeout(Duration::from_millis(10), "RDMA_CM_EVENT_ESTABLISHED")
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Timeout("RDMA_CM_EVENT_ESTABLISHED")
        ));
    }

    #[test]
    fn test_clones_share_queue() {
        let channel = EventChannel::new();
        let other = channel.clone();
        other.notify(CmEvent::new(CmEventKind::Established).with_remote_qpn(7));

        let event = channel.get_event().unwrap();
        assert_eq!(event.kind, CmEventKind::Established);
        assert_eq!(event.remote_qpn, Some(7));
    }
}
