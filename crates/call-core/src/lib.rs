//! # Call-Core - Call and Call-Peer Management for RVoIP
//!
//! This crate is the call layer that sits between a SIP transaction/dialog
//! engine and the user-facing telephony, messaging and file-transfer
//! facades. It provides:
//!
//! - **Calls and peers**: the [`Call`] aggregate and the per-party
//!   [`CallPeer`] state machine, driven by [`SignalingEvent`]s
//! - **Active-calls repository**: dialog-keyed routing of in-dialog requests
//! - **Offer/answer**: SDP negotiation, hold and re-negotiation
//! - **Sub-sessions**: MSRP instant messages and file transfers
//! - **DTMF**: RFC 4733 telephone events or SIP INFO fallback
//!
//! The transaction engine, the media engine and the SDP codec are injected
//! collaborators; see [`SignalingTransport`], [`MediaEngine`] and
//! [`sdp::SdpCodec`]. Everything the layer wants the outside world to know
//! is published to an [`EventSink`].

pub mod call;
pub mod config;
pub(crate) mod context;
pub mod dtmf;
pub mod errors;
pub mod events;
pub mod logging;
pub mod media;
pub mod msrp;
pub mod peer;
pub mod provider;
pub mod repository;
pub mod sdp;
pub mod signaling;
pub mod types;

pub use call::{Call, CallObserver};
pub use config::CallCoreConfig;
pub use dtmf::{DtmfMethod, DtmfTone};
pub use errors::{CallError, Result};
pub use events::{ChannelEventSink, CoreEvent, EventEnvelope, EventSink, NullEventSink};
pub use media::{MediaCapabilities, MediaEngine, NegotiatedStreams};
pub use msrp::{DataChannel, MsrpSession, TransferDescriptor, TransferDirection, TransferId, TransferStatus};
pub use peer::CallPeer;
pub use provider::CallProvider;
pub use repository::ActiveCallsRepository;
pub use signaling::{Body, Reason, SignalingEvent, SignalingTransport, SipMethod};
pub use types::{
    CallDirection, CallId, CallPeerState, CallState, DialogId, HangupReason, MediaType, PeerId,
    ProviderId, TransactionId,
};

pub mod prelude {
    pub use crate::{
        Body, Call, CallCoreConfig, CallDirection, CallError, CallId, CallPeer, CallPeerState,
        CallProvider, CallState, ChannelEventSink, CoreEvent, DataChannel, DialogId, DtmfTone,
        EventSink, HangupReason, MediaCapabilities, MediaEngine, MediaType, MsrpSession,
        NegotiatedStreams, PeerId, Reason, Result, SignalingEvent, SignalingTransport, SipMethod,
        TransactionId, TransferDescriptor, TransferId, TransferStatus,
    };
}
