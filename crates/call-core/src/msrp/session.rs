//! Per-peer MSRP session
//!
//! Routes inbound chunks to instant-message reassembly or to the file
//! transfer whose Message-ID they carry, answers every SEND, and drives
//! outgoing messages and files in chunks. Inbound errors never escape as
//! panics or tear down the channel: unknown or finished transfers get a 481
//! and oversized chunks a 413.

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::MsrpConfig;
use crate::errors::{CallError, Result};
use crate::events::{CoreEvent, EventSink};
use crate::types::PeerId;

use super::descriptor::TransferDescriptor;
use super::frame::{
    new_message_id, ByteRange, Continuation, Decoded, MsrpDecoder, MsrpFrame, MsrpRequest, MsrpResponse,
};
use super::transfer::SubSession;
use super::{DataChannel, TransferDirection, TransferId, TransferStatus};

/// Destination of an accepted incoming file
pub type TransferSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
enum PendingKind {
    Message { message_id: String },
    File { transfer: TransferId },
}

#[derive(Debug)]
struct PendingSend {
    kind: PendingKind,
    last: bool,
}

struct IncomingMessage {
    content_type: String,
    body: BytesMut,
}

#[derive(Default)]
struct SessionState {
    transfers: HashMap<TransferId, SubSession>,
    /// Creation order, used to bind the first chunk of an accepted file
    order: Vec<TransferId>,
    by_message_id: HashMap<String, TransferId>,
    sinks: HashMap<TransferId, TransferSink>,
    messages: HashMap<String, IncomingMessage>,
    /// Our outstanding SEND transactions
    pending: HashMap<String, PendingSend>,
    closed: bool,
}

/// Messaging and file-transfer session of one call peer
pub struct MsrpSession {
    peer_id: PeerId,
    config: MsrpConfig,
    events: Arc<dyn EventSink>,
    local_path: RwLock<Option<String>>,
    remote_path: RwLock<Option<String>>,
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
    decoder: Mutex<MsrpDecoder>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for MsrpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsrpSession")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl MsrpSession {
    pub fn new(peer_id: PeerId, config: MsrpConfig, events: Arc<dyn EventSink>) -> Self {
        let decoder = MsrpDecoder::new(config.max_message_size);
        Self {
            peer_id,
            config,
            events,
            local_path: RwLock::new(None),
            remote_path: RwLock::new(None),
            channel: RwLock::new(None),
            decoder: Mutex::new(decoder),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// MSRP URIs from the negotiated `a=path` attributes
    pub fn set_paths(&self, local: impl Into<String>, remote: impl Into<String>) {
        *self.local_path.write() = Some(local.into());
        *self.remote_path.write() = Some(remote.into());
    }

    pub fn bind_channel(&self, channel: Arc<dyn DataChannel>) {
        debug!(peer = %self.peer_id, "MSRP data channel bound");
        *self.channel.write() = Some(channel);
    }

    pub fn has_channel(&self) -> bool {
        self.channel.read().is_some()
    }

    pub async fn transfer(&self, id: TransferId) -> Option<SubSession> {
        self.state.lock().await.transfers.get(&id).cloned()
    }

    pub async fn transfer_status(&self, id: TransferId) -> Option<TransferStatus> {
        self.state.lock().await.transfers.get(&id).map(|t| t.status())
    }

    pub async fn transfers(&self) -> Vec<SubSession> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.transfers.get(id).cloned())
            .collect()
    }

    /// Register an inbound file offer.
    ///
    /// The offer is validated first; a malformed one creates nothing. A
    /// valid one waits in `Preparing` for [`accept`](Self::accept) or
    /// [`reject`](Self::reject). Re-offers of the same file-transfer-id
    /// return the existing transfer.
    pub async fn offer_incoming(
        &self,
        file_selector: Option<&str>,
        file_transfer_id: Option<&str>,
    ) -> Result<TransferId> {
        let descriptor = TransferDescriptor::from_attributes(file_selector, file_transfer_id)?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(CallError::invalid_state("MSRP session is closed"));
        }
        if let Some(existing) = state
            .transfers
            .values()
            .find(|t| t.direction() == TransferDirection::Incoming && t.descriptor().transfer_id == descriptor.transfer_id)
        {
            return Ok(existing.id());
        }

        let transfer = SubSession::new(self.peer_id, TransferDirection::Incoming, descriptor.clone());
        let id = transfer.id();
        state.transfers.insert(id, transfer);
        state.order.push(id);
        drop(state);

        info!(peer = %self.peer_id, transfer = %id, name = %descriptor.name, size = descriptor.size, "Incoming file offer");
        self.events.publish(CoreEvent::TransferRequested {
            peer_id: self.peer_id,
            transfer_id: id,
            descriptor,
        });
        Ok(id)
    }

    /// Accept an incoming transfer into a file at `path`
    pub async fn accept(&self, id: TransferId, path: impl AsRef<Path>) -> Result<()> {
        {
            let state = self.state.lock().await;
            let transfer = state
                .transfers
                .get(&id)
                .ok_or_else(|| CallError::not_found(format!("Transfer {}", id)))?;
            match transfer.status() {
                TransferStatus::Preparing => {}
                TransferStatus::Active => return Ok(()),
                other => {
                    return Err(CallError::invalid_state(format!(
                        "Transfer {} is {:?}",
                        id, other
                    )))
                }
            }
        }

        let file = tokio::fs::File::create(path.as_ref()).await.map_err(|e| {
            CallError::io(format!("Cannot open {}: {}", path.as_ref().display(), e))
        })?;
        self.accept_with_sink(id, file).await
    }

    /// Accept an incoming transfer into an arbitrary writer
    pub async fn accept_with_sink<W>(&self, id: TransferId, sink: W) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut state = self.state.lock().await;
        let transfer = state
            .transfers
            .get_mut(&id)
            .ok_or_else(|| CallError::not_found(format!("Transfer {}", id)))?;
        if transfer.direction() != TransferDirection::Incoming {
            return Err(CallError::invalid_argument(format!("Transfer {} is outgoing", id)));
        }
        if !transfer.activate()? {
            return Ok(());
        }
        state.sinks.insert(id, Box::new(sink));
        drop(state);

        info!(peer = %self.peer_id, transfer = %id, "Accepted incoming transfer");
        self.events.publish(CoreEvent::TransferCreated {
            peer_id: self.peer_id,
            transfer_id: id,
            direction: TransferDirection::Incoming,
        });
        Ok(())
    }

    /// Reject or cancel a transfer. Always succeeds.
    pub async fn reject(&self, id: TransferId) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(transfer) = state.transfers.get_mut(&id) else {
            debug!(peer = %self.peer_id, transfer = %id, "Reject for unknown transfer ignored");
            return Ok(());
        };
        let was = transfer.status();
        if !transfer.cancel() {
            return Ok(());
        }
        state.sinks.remove(&id);
        drop(state);

        let event = if was == TransferStatus::Preparing {
            info!(peer = %self.peer_id, transfer = %id, "Transfer rejected");
            CoreEvent::TransferRejected {
                peer_id: self.peer_id,
                transfer_id: id,
            }
        } else {
            info!(peer = %self.peer_id, transfer = %id, "Transfer cancelled");
            CoreEvent::TransferCancelled {
                peer_id: self.peer_id,
                transfer_id: id,
            }
        };
        self.events.publish(event);
        Ok(())
    }

    /// Send an instant message, chunked when larger than the chunk size.
    /// Returns its Message-ID; delivery is reported once the last chunk is
    /// acknowledged.
    pub async fn send_message(&self, content_type: &str, body: Bytes) -> Result<String> {
        if content_type.trim().is_empty() {
            return Err(CallError::invalid_argument("Message content type is unset"));
        }
        if body.len() > self.config.max_message_size {
            return Err(CallError::invalid_argument(format!(
                "Message of {} bytes exceeds maximum of {}",
                body.len(),
                self.config.max_message_size
            )));
        }
        let (to, from) = self.paths()?;
        let message_id = new_message_id();
        let total = body.len() as u64;

        let mut requests = Vec::new();
        let mut offset = 0usize;
        loop {
            let end = (offset + self.config.chunk_size).min(body.len());
            let last = end == body.len();
            let range = ByteRange::new(offset as u64 + 1, end as u64, total);
            let continuation = if last { Continuation::Complete } else { Continuation::More };
            requests.push((
                MsrpRequest::send(to.clone(), from.clone(), message_id.clone())
                    .with_body(content_type, body.slice(offset..end), range)
                    .with_continuation(continuation),
                last,
            ));
            offset = end;
            if last {
                break;
            }
        }

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(CallError::invalid_state("MSRP session is closed"));
            }
            for (req, last) in &requests {
                state.pending.insert(
                    req.transaction_id.clone(),
                    PendingSend {
                        kind: PendingKind::Message {
                            message_id: message_id.clone(),
                        },
                        last: *last,
                    },
                );
            }
        }

        let transactions: Vec<String> = requests.iter().map(|(req, _)| req.transaction_id.clone()).collect();
        for (req, _) in requests {
            if let Err(e) = self.send_bytes(req.encode()).await {
                let mut state = self.state.lock().await;
                for transaction in &transactions {
                    state.pending.remove(transaction);
                }
                warn!(peer = %self.peer_id, message_id = %message_id, error = %e, "Message send failed");
                return Err(e);
            }
        }
        debug!(peer = %self.peer_id, message_id = %message_id, bytes = total, "Sent message");
        Ok(message_id)
    }

    /// Stream a local file to the peer in Byte-Range chunks.
    ///
    /// The transfer completes when the last chunk is acknowledged. A
    /// concurrent [`reject`](Self::reject) aborts it between chunks.
    pub async fn send_file(&self, path: impl AsRef<Path>, descriptor: TransferDescriptor) -> Result<TransferId> {
        let (to, from) = self.paths()?;
        let mut file = tokio::fs::File::open(path.as_ref()).await.map_err(|e| {
            CallError::io(format!("Cannot open {}: {}", path.as_ref().display(), e))
        })?;
        let total = file.metadata().await?.len();

        let mut transfer = SubSession::new(self.peer_id, TransferDirection::Outgoing, descriptor);
        let id = transfer.id();
        let message_id = new_message_id();
        transfer.bind_message_id(message_id.clone());
        transfer.activate()?;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(CallError::invalid_state("MSRP session is closed"));
            }
            state.by_message_id.insert(message_id.clone(), id);
            state.transfers.insert(id, transfer);
            state.order.push(id);
        }
        info!(peer = %self.peer_id, transfer = %id, bytes = total, "Sending file");
        self.events.publish(CoreEvent::TransferCreated {
            peer_id: self.peer_id,
            transfer_id: id,
            direction: TransferDirection::Outgoing,
        });

        let content_type = {
            let state = self.state.lock().await;
            state
                .transfers
                .get(&id)
                .and_then(|t| t.descriptor().content_type.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string())
        };

        let mut sent: u64 = 0;
        loop {
            let chunk = match read_chunk(&mut file, self.config.chunk_size).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.fail_transfer(id, format!("read failed: {}", e)).await;
                    return Err(e.into());
                }
            };
            if chunk.is_empty() && sent < total {
                let reason = format!("file ended after {} of {} bytes", sent, total);
                self.fail_transfer(id, reason.clone()).await;
                return Err(CallError::io(reason));
            }
            let last = sent + chunk.len() as u64 >= total;

            let request = {
                let mut state = self.state.lock().await;
                let Some(transfer) = state.transfers.get_mut(&id) else {
                    return Ok(id);
                };
                if transfer.is_terminal() {
                    debug!(peer = %self.peer_id, transfer = %id, "Transfer stopped, aborting send");
                    MsrpRequest::send(to.clone(), from.clone(), message_id.clone())
                        .with_body(
                            content_type.clone(),
                            Bytes::new(),
                            ByteRange {
                                start: sent + 1,
                                end: None,
                                total: Some(total),
                            },
                        )
                        .with_continuation(Continuation::Aborted)
                } else {
                    transfer.advance(chunk.len() as u64)?;
                    let range = ByteRange::new(sent + 1, sent + chunk.len() as u64, total);
                    let req = MsrpRequest::send(to.clone(), from.clone(), message_id.clone())
                        .with_body(content_type.clone(), Bytes::from(chunk), range)
                        .with_continuation(if last { Continuation::Complete } else { Continuation::More });
                    state.pending.insert(
                        req.transaction_id.clone(),
                        PendingSend {
                            kind: PendingKind::File { transfer: id },
                            last,
                        },
                    );
                    req
                }
            };

            let aborted = request.continuation == Continuation::Aborted;
            let chunk_len = request.body.len() as u64;
            if let Err(e) = self.send_bytes(request.encode()).await {
                self.state.lock().await.pending.remove(&request.transaction_id);
                self.fail_transfer(id, e.to_string()).await;
                return Err(e);
            }
            if aborted {
                return Ok(id);
            }

            sent += chunk_len;
            self.events.publish(CoreEvent::TransferProgress {
                peer_id: self.peer_id,
                transfer_id: id,
                bytes: sent,
                total: Some(total),
            });
            if last {
                return Ok(id);
            }
        }
    }

    /// Feed bytes read from the data channel
    pub async fn receive(&self, data: &[u8]) -> Result<()> {
        let mut decoder = self.decoder.lock().await;
        decoder.extend(data);
        loop {
            let decoded = match decoder.decode() {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(peer = %self.peer_id, error = %e, "Dropping undecodable MSRP data");
                    decoder.reset();
                    return Err(e);
                }
            };

            let response = match decoded {
                Decoded::Frame(MsrpFrame::Request(request)) => self.handle_request(request).await,
                Decoded::Frame(MsrpFrame::Response(response)) => {
                    self.handle_response(response).await;
                    None
                }
                Decoded::Oversized(request) => self.handle_oversized(request).await,
            };

            if let Some(response) = response {
                if let Err(e) = self.send_bytes(response.encode()).await {
                    warn!(peer = %self.peer_id, error = %e, "Failed to send MSRP response");
                }
            }
        }
    }

    /// Cancel every unfinished transfer and drop the channel
    pub async fn close(&self) {
        let cancelled: Vec<TransferId> = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.sinks.clear();
            state.messages.clear();
            state.pending.clear();
            let ids = state.order.clone();
            ids.into_iter()
                .filter(|id| state.transfers.get_mut(id).map_or(false, |t| t.cancel()))
                .collect()
        };
        *self.channel.write() = None;

        debug!(peer = %self.peer_id, cancelled = cancelled.len(), "MSRP session closed");
        for id in cancelled {
            self.events.publish(CoreEvent::TransferCancelled {
                peer_id: self.peer_id,
                transfer_id: id,
            });
        }
    }

    fn paths(&self) -> Result<(String, String)> {
        let remote = self.remote_path.read().clone();
        let local = self.local_path.read().clone();
        match (remote, local) {
            (Some(remote), Some(local)) => Ok((remote, local)),
            _ => Err(CallError::invalid_state("MSRP paths not negotiated")),
        }
    }

    async fn send_bytes(&self, data: Bytes) -> Result<()> {
        let channel = self.channel.read().clone();
        match channel {
            Some(channel) => channel.send(data).await,
            None => Err(CallError::invalid_state("No MSRP data channel bound")),
        }
    }

    async fn fail_transfer(&self, id: TransferId, reason: String) {
        let failed = {
            let mut state = self.state.lock().await;
            state.sinks.remove(&id);
            state
                .pending
                .retain(|_, p| !matches!(p.kind, PendingKind::File { transfer } if transfer == id));
            state.transfers.get_mut(&id).map_or(false, |t| t.fail())
        };
        if failed {
            warn!(peer = %self.peer_id, transfer = %id, %reason, "Transfer failed");
            self.events.publish(CoreEvent::TransferFailed {
                peer_id: self.peer_id,
                transfer_id: id,
                reason,
            });
        }
    }

    async fn handle_oversized(&self, request: MsrpRequest) -> Option<MsrpResponse> {
        warn!(
            peer = %self.peer_id,
            transaction = %request.transaction_id,
            max = self.config.max_message_size,
            "Refusing oversized MSRP chunk"
        );
        if let Some(message_id) = &request.message_id {
            let transfer = {
                let mut state = self.state.lock().await;
                state.messages.remove(message_id);
                state.by_message_id.get(message_id).copied()
            };
            if let Some(id) = transfer {
                self.fail_transfer(id, "chunk exceeds maximum message size".to_string())
                    .await;
            }
        }
        Some(MsrpResponse::for_request(&request, 413))
    }

    async fn handle_request(&self, request: MsrpRequest) -> Option<MsrpResponse> {
        if request.method == "REPORT" {
            trace!(peer = %self.peer_id, "Ignoring MSRP REPORT");
            return None;
        }
        if request.method != "SEND" {
            return Some(MsrpResponse::for_request(&request, 501));
        }
        let Some(message_id) = request.message_id.clone() else {
            return Some(MsrpResponse::for_request(&request, 400));
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return Some(MsrpResponse::for_request(&request, 481));
        }

        let bound = state.by_message_id.get(&message_id).copied();
        let transfer = bound.or_else(|| self.bind_first_chunk(&mut state, &message_id, &request));
        if let Some(id) = transfer {
            let status = self.write_chunk(&mut state, id, &request).await;
            return Some(MsrpResponse::for_request(&request, status));
        }
        if let Some(id) = Self::awaits_acceptance(&state, &request) {
            debug!(peer = %self.peer_id, transfer = %id, message_id = %message_id, "Chunk for transfer not yet accepted");
            return Some(MsrpResponse::for_request(&request, 481));
        }

        let content_type = request.content_type.clone().unwrap_or_default();
        if content_type.is_empty() && request.body.is_empty() {
            return Some(MsrpResponse::for_request(&request, 200));
        }
        if !self.accepts(&content_type) {
            warn!(
                peer = %self.peer_id,
                message_id = %message_id,
                content_type = %content_type,
                "Discarding chunk for unknown sub-session"
            );
            return Some(MsrpResponse::for_request(&request, 481));
        }

        let status = self.reassemble(&mut state, message_id, content_type, &request);
        Some(MsrpResponse::for_request(&request, status))
    }

    /// First chunk of an accepted incoming file binds to the oldest active
    /// transfer that is not yet receiving and whose descriptor it matches:
    /// the Byte-Range starts at 1, its total is the offered size, and the
    /// content type agrees when the offer named one.
    fn bind_first_chunk(&self, state: &mut SessionState, message_id: &str, request: &MsrpRequest) -> Option<TransferId> {
        let range = request.byte_range?;
        if range.start != 1 {
            return None;
        }
        let id = state.order.iter().copied().find(|id| {
            state.transfers.get(id).map_or(false, |t| {
                t.direction() == TransferDirection::Incoming
                    && t.status() == TransferStatus::Active
                    && t.message_id().is_none()
                    && chunk_fits(t.descriptor(), range, request.content_type.as_deref())
            })
        })?;
        if let Some(transfer) = state.transfers.get_mut(&id) {
            transfer.bind_message_id(message_id);
        }
        state.by_message_id.insert(message_id.to_string(), id);
        trace!(peer = %self.peer_id, transfer = %id, message_id, "Bound message to transfer");
        Some(id)
    }

    /// Whether a chunk looks like content of an offer still waiting for a
    /// local decision
    fn awaits_acceptance(state: &SessionState, request: &MsrpRequest) -> Option<TransferId> {
        let range = request.byte_range?;
        state.order.iter().copied().find(|id| {
            state.transfers.get(id).map_or(false, |t| {
                t.direction() == TransferDirection::Incoming
                    && t.status() == TransferStatus::Preparing
                    && chunk_fits(t.descriptor(), range, request.content_type.as_deref())
            })
        })
    }

    async fn write_chunk(&self, state: &mut SessionState, id: TransferId, request: &MsrpRequest) -> u16 {
        let Some(transfer) = state.transfers.get(&id) else {
            return 481;
        };
        if transfer.is_terminal() || transfer.status() != TransferStatus::Active {
            warn!(peer = %self.peer_id, transfer = %id, status = ?transfer.status(), "Discarding chunk for finished transfer");
            return 481;
        }
        if let Some(range) = request.byte_range {
            if range.start != transfer.offset() + 1 {
                debug!(peer = %self.peer_id, transfer = %id, expected = transfer.offset() + 1, got = range.start, "Out of order chunk");
            }
        }
        let total = transfer.descriptor().size;

        let write_result = match state.sinks.get_mut(&id) {
            Some(sink) => {
                let mut result = sink.write_all(&request.body).await;
                if result.is_ok() && request.continuation == Continuation::Complete {
                    result = sink.shutdown().await;
                }
                result.map_err(CallError::from)
            }
            None => Err(CallError::invalid_state("Transfer has no sink")),
        };

        let Some(transfer) = state.transfers.get_mut(&id) else {
            return 481;
        };
        if let Err(e) = write_result {
            transfer.fail();
            state.sinks.remove(&id);
            warn!(peer = %self.peer_id, transfer = %id, error = %e, "Transfer failed");
            self.events.publish(CoreEvent::TransferFailed {
                peer_id: self.peer_id,
                transfer_id: id,
                reason: e.to_string(),
            });
            return 481;
        }

        let bytes = transfer.offset() + request.body.len() as u64;
        if !request.body.is_empty() {
            if let Ok(offset) = transfer.advance(request.body.len() as u64) {
                self.events.publish(CoreEvent::TransferProgress {
                    peer_id: self.peer_id,
                    transfer_id: id,
                    bytes: offset,
                    total: Some(total),
                });
            }
        }

        match request.continuation {
            Continuation::Complete => {
                transfer.complete();
                state.sinks.remove(&id);
                info!(peer = %self.peer_id, transfer = %id, bytes, "Incoming transfer completed");
                self.events.publish(CoreEvent::TransferCompleted {
                    peer_id: self.peer_id,
                    transfer_id: id,
                });
            }
            Continuation::Aborted => {
                transfer.cancel();
                state.sinks.remove(&id);
                info!(peer = %self.peer_id, transfer = %id, "Sender aborted transfer");
                self.events.publish(CoreEvent::TransferCancelled {
                    peer_id: self.peer_id,
                    transfer_id: id,
                });
            }
            Continuation::More => {}
        }
        200
    }

    fn accepts(&self, content_type: &str) -> bool {
        let base = content_type.split(';').next().unwrap_or(content_type).trim();
        self.config
            .accept_types
            .iter()
            .any(|t| t == "*" || t.eq_ignore_ascii_case(base))
    }

    fn reassemble(&self, state: &mut SessionState, message_id: String, content_type: String, request: &MsrpRequest) -> u16 {
        let entry = state
            .messages
            .entry(message_id.clone())
            .or_insert_with(|| IncomingMessage {
                content_type,
                body: BytesMut::new(),
            });
        if entry.body.len() + request.body.len() > self.config.max_message_size {
            state.messages.remove(&message_id);
            warn!(peer = %self.peer_id, message_id = %message_id, "Reassembled message too large");
            return 413;
        }
        entry.body.extend_from_slice(&request.body);

        match request.continuation {
            Continuation::More => {}
            Continuation::Aborted => {
                state.messages.remove(&message_id);
                debug!(peer = %self.peer_id, message_id = %message_id, "Sender aborted message");
            }
            Continuation::Complete => {
                if let Some(message) = state.messages.remove(&message_id) {
                    debug!(peer = %self.peer_id, message_id = %message_id, bytes = message.body.len(), "Message received");
                    self.events.publish(CoreEvent::MessageReceived {
                        peer_id: self.peer_id,
                        message_id,
                        content_type: message.content_type,
                        body: message.body.freeze(),
                    });
                }
            }
        }
        200
    }

    async fn handle_response(&self, response: MsrpResponse) {
        let pending = self.state.lock().await.pending.remove(&response.transaction_id);
        let Some(pending) = pending else {
            trace!(peer = %self.peer_id, transaction = %response.transaction_id, "Response for unknown transaction");
            return;
        };

        match pending.kind {
            PendingKind::Message { message_id } => {
                if !response.is_success() {
                    warn!(peer = %self.peer_id, message_id = %message_id, status = response.status, "Message not delivered");
                } else if pending.last {
                    self.events.publish(CoreEvent::MessageDelivered {
                        peer_id: self.peer_id,
                        message_id,
                    });
                }
            }
            PendingKind::File { transfer } => {
                if !response.is_success() {
                    self.fail_transfer(transfer, format!("remote answered {}", response.status))
                        .await;
                } else if pending.last {
                    let completed = {
                        let mut state = self.state.lock().await;
                        state.transfers.get_mut(&transfer).map_or(false, |t| t.complete())
                    };
                    if completed {
                        info!(peer = %self.peer_id, transfer = %transfer, "Outgoing transfer completed");
                        self.events.publish(CoreEvent::TransferCompleted {
                            peer_id: self.peer_id,
                            transfer_id: transfer,
                        });
                    }
                }
            }
        }
    }
}

fn chunk_fits(descriptor: &TransferDescriptor, range: ByteRange, content_type: Option<&str>) -> bool {
    if range.total != Some(descriptor.size) {
        return false;
    }
    match &descriptor.content_type {
        Some(expected) => content_type.map_or(false, |actual| {
            let base = actual.split(';').next().unwrap_or(actual).trim();
            expected.eq_ignore_ascii_case(base)
        }),
        None => true,
    }
}

/// Read up to `size` bytes, short only at end of file
async fn read_chunk(file: &mut tokio::fs::File, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
