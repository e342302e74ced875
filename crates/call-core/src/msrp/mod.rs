//! Messaging and file-transfer sub-sessions (MSRP)
//!
//! Each call peer that negotiated a message stream gets one
//! [`MsrpSession`]. The session multiplexes instant messages and file
//! transfers over a single [`DataChannel`] supplied by the embedding
//! application once the MSRP connection is up.

pub mod descriptor;
pub mod frame;
pub mod session;
pub mod transfer;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::Result;

pub use descriptor::TransferDescriptor;
pub use frame::{ByteRange, Continuation, Decoded, MsrpDecoder, MsrpFrame, MsrpRequest, MsrpResponse};
pub use session::MsrpSession;
pub use transfer::SubSession;

/// Identifier of a file transfer sub-session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// Sub-session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Preparing,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// Byte stream underneath an MSRP session
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<()>;
}
