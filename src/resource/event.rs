//! Event/coalescing channel (spec §4.4, component C4).
//!
//! An [`Event`] carries no payload; coalescing is the channel's job, not
//! the receiver's. The channel is a capacity-1 `mpsc`: a publish while a
//! previous event is still pending is dropped, so a burst of `N`
//! publishes between two drains is observed as exactly one event. This
//! mirrors a stats-reporting signaling channel, adapted from a
//! counter update to a pure coalescing signal.

use tokio::sync::mpsc;

/// A unit-typed change notification.
#[derive(Debug, Clone, Copy)]
pub struct Event;

#[derive(Clone)]
pub struct EventSender(mpsc::Sender<Event>);

impl EventSender {
    /// Publish a change. Collapses with any event already pending.
    pub fn publish(&self) {
        // try_send fails with Full when a prior event hasn't been
        // drained yet; that's the coalescing, not an error.
        let _ = self.0.try_send(Event);
    }
}

pub struct EventReceiver(mpsc::Receiver<Event>);

impl EventReceiver {
    /// Waits for the next coalesced event, draining any backlog to a
    /// single notification first (spec §4.4: "drain any event-source
    /// queue to end-of-backlog before each publish").
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.0.recv().await?;

        // Collapse anything that queued up while we were away; a
        // capacity-1 channel can hold at most one more, so this is a
        // bounded drain, not an unbounded spin.
        while self.0.try_recv().is_ok() {}

        Some(event)
    }
}

/// Create a coalescing event channel (capacity 1 by construction).
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (EventSender(tx), EventReceiver(rx))
}
