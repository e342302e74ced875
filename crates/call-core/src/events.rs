//! Facade notifications
//!
//! The core publishes one-way notifications about calls, peers, messages,
//! transfers and DTMF to an [`EventSink`]. Sinks never call back into the
//! core; publishing is synchronous and must not block.
//!
//! ```rust
//! use rvoip_call_core::events::{ChannelEventSink, CoreEvent, EventSink};
//! use rvoip_call_core::CallId;
//!
//! let (sink, mut rx) = ChannelEventSink::new();
//! let call_id = CallId::new();
//! sink.publish(CoreEvent::CallEnded { call_id });
//! let envelope = rx.try_recv().unwrap();
//! assert!(matches!(envelope.event, CoreEvent::CallEnded { .. }));
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::dtmf::DtmfTone;
use crate::errors::CallError;
use crate::msrp::{TransferDescriptor, TransferDirection, TransferId};
use crate::sdp::RenegotiationDelta;
use crate::types::{CallDirection, CallId, CallPeerState, PeerId};

/// Everything the core tells the outside world about
#[derive(Debug, Clone)]
pub enum CoreEvent {
    CallCreated {
        call_id: CallId,
        direction: CallDirection,
    },
    CallEnded {
        call_id: CallId,
    },
    PeerAdded {
        call_id: CallId,
        peer_id: PeerId,
        remote: String,
    },
    PeerRemoved {
        call_id: CallId,
        peer_id: PeerId,
    },
    PeerStateChanged {
        call_id: CallId,
        peer_id: PeerId,
        old: CallPeerState,
        new: CallPeerState,
        reason: Option<String>,
        /// Error that caused a transition to `Failed`
        error: Option<CallError>,
    },
    MediaStreamsChanged {
        peer_id: PeerId,
        delta: RenegotiationDelta,
    },
    HoldChanged {
        peer_id: PeerId,
        on_hold: bool,
    },
    MessageReceived {
        peer_id: PeerId,
        message_id: String,
        content_type: String,
        body: Bytes,
    },
    MessageDelivered {
        peer_id: PeerId,
        message_id: String,
    },
    /// An inbound file offer waits for accept or reject
    TransferRequested {
        peer_id: PeerId,
        transfer_id: TransferId,
        descriptor: TransferDescriptor,
    },
    TransferCreated {
        peer_id: PeerId,
        transfer_id: TransferId,
        direction: TransferDirection,
    },
    TransferProgress {
        peer_id: PeerId,
        transfer_id: TransferId,
        bytes: u64,
        total: Option<u64>,
    },
    TransferCompleted {
        peer_id: PeerId,
        transfer_id: TransferId,
    },
    TransferFailed {
        peer_id: PeerId,
        transfer_id: TransferId,
        reason: String,
    },
    TransferRejected {
        peer_id: PeerId,
        transfer_id: TransferId,
    },
    TransferCancelled {
        peer_id: PeerId,
        transfer_id: TransferId,
    },
    DtmfReceived {
        peer_id: PeerId,
        tone: DtmfTone,
        duration_ms: Option<u64>,
    },
    /// The remote party asked us to call `target` instead (REFER).
    /// `call_id` is the new call, `None` when it could not be placed.
    CallReferred {
        peer_id: PeerId,
        target: String,
        call_id: Option<CallId>,
    },
}

/// A published event with the time it was emitted
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: CoreEvent,
}

/// One-way notification target for the messaging, telephony and
/// file-transfer facades
pub trait EventSink: Send + Sync {
    fn publish(&self, event: CoreEvent);
}

/// Sink that forwards events over an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: CoreEvent) {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        if self.tx.send(envelope).is_err() {
            tracing::trace!("Event receiver dropped, discarding notification");
        }
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: CoreEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelEventSink::new();
        let call_id = CallId::new();
        sink.publish(CoreEvent::CallCreated {
            call_id,
            direction: CallDirection::Outgoing,
        });
        sink.publish(CoreEvent::CallEnded { call_id });

        assert!(matches!(rx.try_recv().unwrap().event, CoreEvent::CallCreated { .. }));
        assert!(matches!(rx.try_recv().unwrap().event, CoreEvent::CallEnded { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_after_receiver_dropped_is_silent() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);
        sink.publish(CoreEvent::CallEnded { call_id: CallId::new() });
    }
}
