//! Signalling transport interface
//!
//! The transaction/dialog engine is an external collaborator. The core asks
//! it to send requests and responses through [`SignalingTransport`] and is
//! fed what the engine observed as [`SignalingEvent`]s. Message parsing,
//! retransmission and transaction timers all live on the other side of this
//! boundary.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::errors::Result;
use crate::types::{DialogId, TransactionId};

pub const CONTENT_TYPE_SDP: &str = "application/sdp";
pub const CONTENT_TYPE_DTMF_RELAY: &str = "application/dtmf-relay";
/// Body of the NOTIFY reporting how a REFER went
pub const CONTENT_TYPE_SIPFRAG: &str = "message/sipfrag";

/// SIP methods this layer sends or routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Info,
    Message,
    Update,
    Refer,
    Notify,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Info => "INFO",
            SipMethod::Message => "MESSAGE",
            SipMethod::Update => "UPDATE",
            SipMethod::Refer => "REFER",
            SipMethod::Notify => "NOTIFY",
        };
        f.write_str(name)
    }
}

/// Message body with its content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub content_type: String,
    pub content: Bytes,
}

impl Body {
    pub fn new(content_type: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            content: content.into(),
        }
    }

    pub fn sdp(sdp: impl Into<String>) -> Self {
        Self::new(CONTENT_TYPE_SDP, Bytes::from(sdp.into()))
    }

    pub fn is_sdp(&self) -> bool {
        self.content_type.eq_ignore_ascii_case(CONTENT_TYPE_SDP)
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Body as UTF-8 text, lossy
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// RFC 3326 Reason header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub protocol: String,
    pub cause: u16,
    pub text: Option<String>,
}

impl Reason {
    pub fn sip(cause: u16, text: impl Into<String>) -> Self {
        Self {
            protocol: "SIP".to_string(),
            cause,
            text: Some(text.into()),
        }
    }
}

/// Requests and responses sent on behalf of call peers
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send a request inside (or creating) `dialog`. Responses come back as
    /// [`SignalingEvent::Response`] keyed by the same dialog.
    async fn send_request(
        &self,
        dialog: &DialogId,
        method: SipMethod,
        body: Option<Body>,
        reason: Option<Reason>,
    ) -> Result<()>;

    /// Answer the server transaction that delivered an inbound request
    async fn send_response(
        &self,
        transaction: &TransactionId,
        status: u16,
        reason_phrase: &str,
        body: Option<Body>,
    ) -> Result<()>;

    /// Whether the underlying transport retransmits on its own
    fn is_reliable(&self) -> bool {
        true
    }
}

/// What the transaction engine tells the core
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Request {
        transaction: TransactionId,
        dialog: DialogId,
        method: SipMethod,
        body: Option<Body>,
        /// Remote party address (From for requests we receive)
        remote: String,
        reason: Option<Reason>,
        /// Refer-To address of a REFER
        refer_to: Option<String>,
        /// Dialog named by the Replaces header of an INVITE, as resolved by
        /// the transaction engine
        replaces: Option<DialogId>,
    },
    Response {
        dialog: DialogId,
        /// Method of the request this response answers
        method: SipMethod,
        status: u16,
        body: Option<Body>,
    },
    DialogConfirmed {
        dialog: DialogId,
    },
    DialogTerminated {
        dialog: DialogId,
    },
    TransportError {
        dialog: DialogId,
        message: String,
    },
    Timeout {
        dialog: DialogId,
    },
}

impl SignalingEvent {
    pub fn dialog(&self) -> &DialogId {
        match self {
            SignalingEvent::Request { dialog, .. }
            | SignalingEvent::Response { dialog, .. }
            | SignalingEvent::DialogConfirmed { dialog }
            | SignalingEvent::DialogTerminated { dialog }
            | SignalingEvent::TransportError { dialog, .. }
            | SignalingEvent::Timeout { dialog } => dialog,
        }
    }
}

/// Standard reason phrase for the status codes this layer emits
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        180 => "Ringing",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        500 => "Server Internal Error",
        603 => "Decline",
        606 => "Not Acceptable",
        _ => "",
    }
}
