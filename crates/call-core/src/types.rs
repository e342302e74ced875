//! Core types for call-core
//!
//! Identifiers, call and call-peer states, and the small value types shared
//! by every component of the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Provider-scoped identifier of a call
    CallId
);
uuid_id!(
    /// Identifier of one remote participant within a call
    PeerId
);
uuid_id!(
    /// Opaque signalling dialog identity handed out by the transaction engine
    DialogId
);
uuid_id!(
    /// Server transaction handle used to answer an inbound request
    TransactionId
);
uuid_id!(
    /// Identity of the provider (account) owning calls and peers
    ProviderId
);

/// Aggregate state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Created, no peer added yet
    Initializing,
    /// At least one live peer
    InProgress,
    /// Every peer has left; terminal
    Ended,
}

/// State of one call peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallPeerState {
    Initiating,
    Ringing,
    Connecting,
    Connected,
    OnHold,
    Disconnecting,
    Disconnected,
    Failed,
}

impl CallPeerState {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPeerState::Disconnected | CallPeerState::Failed)
    }

    /// Established states in which in-dialog re-negotiation is possible
    pub fn is_established(&self) -> bool {
        matches!(self, CallPeerState::Connected | CallPeerState::OnHold)
    }
}

impl fmt::Display for CallPeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side initiated the call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Media stream kinds the negotiator knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    /// Screen sharing, carried as a video m-line tagged `a=content:slides`
    Desktop,
    /// MSRP message stream
    Message,
}

impl MediaType {
    /// The SDP media token used on the m-line
    pub fn sdp_token(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video | MediaType::Desktop => "video",
            MediaType::Message => "message",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Desktop => "desktop",
            MediaType::Message => "message",
        };
        f.write_str(name)
    }
}

/// Why a peer is being hung up locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HangupReason {
    NormalClearing,
    Busy,
    Timeout,
    EncryptionRequired,
    Custom { code: u16, text: String },
}

impl HangupReason {
    /// Status code carried in the RFC 3326 Reason header, if any.
    ///
    /// Normal clearing sends a plain BYE without a Reason header.
    pub fn sip_code(&self) -> Option<u16> {
        match self {
            HangupReason::NormalClearing => None,
            HangupReason::Busy => Some(486),
            HangupReason::Timeout => Some(408),
            HangupReason::EncryptionRequired => Some(606),
            HangupReason::Custom { code, .. } => Some(*code),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            HangupReason::NormalClearing => "Normal call clearing",
            HangupReason::Busy => "Busy here",
            HangupReason::Timeout => "Request timeout",
            HangupReason::EncryptionRequired => "Encryption required",
            HangupReason::Custom { text, .. } => text,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, HangupReason::NormalClearing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(CallId::new(), CallId::new());
        assert_ne!(DialogId::new(), DialogId::new());
    }

    #[test]
    fn test_id_display_matches_uuid() {
        let id = PeerId::new();
        assert_eq!(id.to_string(), id.0.to_string());
    }

    #[test]
    fn test_terminal_states() {
        assert!(CallPeerState::Disconnected.is_terminal());
        assert!(CallPeerState::Failed.is_terminal());
        assert!(!CallPeerState::Disconnecting.is_terminal());
        assert!(!CallPeerState::OnHold.is_terminal());
    }

    #[test]
    fn test_hangup_reason_codes() {
        assert_eq!(HangupReason::NormalClearing.sip_code(), None);
        assert_eq!(HangupReason::Busy.sip_code(), Some(486));
        assert!(HangupReason::Timeout.is_failure());
    }

    #[test]
    fn test_desktop_rides_on_video_mline() {
        assert_eq!(MediaType::Desktop.sdp_token(), "video");
        assert_eq!(MediaType::Desktop.to_string(), "desktop");
    }
}
