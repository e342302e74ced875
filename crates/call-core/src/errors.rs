//! Error Types for Call Core
//!
//! A single error enum covers every failure the call layer can report.
//! Errors raised while processing inbound network traffic are absorbed into
//! peer/sub-session transitions; errors raised by caller-initiated operations
//! (answer, accept, start-tone, ...) are returned directly.

use thiserror::Error;

/// Main result type for call-core operations
pub type Result<T> = std::result::Result<T, CallError>;

/// Main error type for call-core operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// No common media, or the remote description could not be used
    #[error("Negotiation failed: {message}")]
    Negotiation { message: String },

    /// A sub-session transfer descriptor lacks a mandatory attribute
    #[error("Malformed transfer offer: {message}")]
    MalformedOffer { message: String },

    /// Local resource or data sink failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The peer handed to an operation belongs to another provider
    #[error("Unsupported peer: {message}")]
    UnsupportedPeer { message: String },

    /// Caller passed an unset or invalid argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The signalling transport reported a terminal error for a dialog
    #[error("Transport failure: {message}")]
    TransportFailure { message: String },

    /// Operation not allowed in the current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Call, peer or sub-session not found
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Session description could not be parsed or serialized
    #[error("SDP error: {message}")]
    Sdp { message: String },

    /// MSRP framing error on the data channel
    #[error("MSRP error: {message}")]
    Msrp { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl CallError {
    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation { message: message.into() }
    }

    pub fn malformed_offer(message: impl Into<String>) -> Self {
        Self::MalformedOffer { message: message.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn unsupported_peer(message: impl Into<String>) -> Self {
        Self::UnsupportedPeer { message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure { message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn sdp(message: impl Into<String>) -> Self {
        Self::Sdp { message: message.into() }
    }

    pub fn msrp(message: impl Into<String>) -> Self {
        Self::Msrp { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether this error, absorbed from a network event, must fail the peer.
    ///
    /// Caller contract violations never reach the state machine this way;
    /// everything else that breaks media or signalling does.
    pub fn is_terminal_for_peer(&self) -> bool {
        !matches!(
            self,
            Self::InvalidArgument { .. } | Self::UnsupportedPeer { .. } | Self::NotFound { .. }
        )
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        CallError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for CallError {
    fn from(err: serde_yaml::Error) -> Self {
        CallError::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_category() {
        let err = CallError::negotiation("no common media");
        assert_eq!(err.to_string(), "Negotiation failed: no common media");

        let err = CallError::malformed_offer("missing size");
        assert!(err.to_string().contains("missing size"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CallError = io.into();
        assert!(matches!(err, CallError::Io { .. }));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(CallError::transport("timeout").is_terminal_for_peer());
        assert!(CallError::negotiation("x").is_terminal_for_peer());
        assert!(!CallError::invalid_argument("x").is_terminal_for_peer());
    }
}
