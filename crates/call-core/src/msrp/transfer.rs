//! Streaming transfer sub-session state machine

use crate::errors::{CallError, Result};
use crate::types::PeerId;

use super::descriptor::TransferDescriptor;
use super::{TransferDirection, TransferId, TransferStatus};

/// One file transfer riding on a peer's MSRP session.
///
/// `Preparing -> Active -> Completed | Failed | Cancelled`; a transfer may
/// also be cancelled straight from `Preparing` when it is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubSession {
    id: TransferId,
    direction: TransferDirection,
    peer_id: PeerId,
    descriptor: TransferDescriptor,
    status: TransferStatus,
    offset: u64,
    /// MSRP Message-ID carrying the file once chunks flow
    message_id: Option<String>,
}

impl SubSession {
    pub fn new(peer_id: PeerId, direction: TransferDirection, descriptor: TransferDescriptor) -> Self {
        Self {
            id: TransferId::new(),
            direction,
            peer_id,
            descriptor,
            status: TransferStatus::Preparing,
            offset: 0,
            message_id: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Bytes written or sent so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn bind_message_id(&mut self, message_id: impl Into<String>) {
        self.message_id = Some(message_id.into());
    }

    /// Preparing -> Active. Returns false when already active.
    pub fn activate(&mut self) -> Result<bool> {
        match self.status {
            TransferStatus::Preparing => {
                self.status = TransferStatus::Active;
                Ok(true)
            }
            TransferStatus::Active => Ok(false),
            terminal => Err(CallError::invalid_state(format!(
                "Transfer {} already {:?}",
                self.id, terminal
            ))),
        }
    }

    /// Record `n` more bytes moved
    pub fn advance(&mut self, n: u64) -> Result<u64> {
        if self.status != TransferStatus::Active {
            return Err(CallError::invalid_state(format!(
                "Transfer {} is {:?}, not active",
                self.id, self.status
            )));
        }
        self.offset += n;
        Ok(self.offset)
    }

    pub fn complete(&mut self) -> bool {
        self.finish(TransferStatus::Completed)
    }

    pub fn fail(&mut self) -> bool {
        self.finish(TransferStatus::Failed)
    }

    /// Cancel unless already terminal. Returns whether anything changed.
    pub fn cancel(&mut self) -> bool {
        self.finish(TransferStatus::Cancelled)
    }

    fn finish(&mut self, status: TransferStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}
