//! Call provider
//!
//! The entry point of the layer. A provider owns the collaborators handed
//! to it (signalling transport, media engine, SDP codec, event sink), the
//! active-calls repository, the negotiator and the DTMF dispatcher. It
//! routes every [`SignalingEvent`] to the peer of its dialog and exposes
//! the user operations on calls and peers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_call_core::prelude::*;
//!
//! async fn run(
//!     transport: Arc<dyn SignalingTransport>,
//!     media: Arc<dyn MediaEngine>,
//!     mut signaling: tokio::sync::mpsc::Receiver<SignalingEvent>,
//! ) -> Result<()> {
//!     let (events, _rx) = ChannelEventSink::new();
//!     let provider = CallProvider::new(CallCoreConfig::default(), transport, media, Arc::new(events))?;
//!
//!     let (_call, peer) = provider
//!         .create_outgoing_call("sip:bob@example.com", DialogId::new())
//!         .await?;
//!     while let Some(event) = signaling.recv().await {
//!         provider.handle_event(event).await;
//!     }
//!     provider.hangup(&peer, HangupReason::NormalClearing).await
//! }
//! ```

use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::call::Call;
use crate::config::CallCoreConfig;
use crate::context::CoreContext;
use crate::errors::{CallError, Result};
use crate::events::{CoreEvent, EventSink};
use crate::media::{MediaCapabilities, MediaEngine};
use crate::msrp::descriptor::{FILE_SELECTOR, FILE_TRANSFER_ID};
use crate::msrp::MsrpSession;
use crate::peer::CallPeer;
use crate::repository::ActiveCallsRepository;
use crate::sdp::{SdpCodec, TextSdpCodec};
use crate::signaling::{
    reason_phrase, Body, Reason, SignalingEvent, SignalingTransport, SipMethod, CONTENT_TYPE_SIPFRAG,
};
use crate::types::{
    CallDirection, CallPeerState, DialogId, HangupReason, MediaType, ProviderId, TransactionId,
};

/// Calls, peers and request dispatch for one signalling endpoint
pub struct CallProvider {
    ctx: Arc<CoreContext>,
    repository: Arc<ActiveCallsRepository>,
}

impl CallProvider {
    /// Create a provider using the built-in text SDP codec
    pub fn new(
        config: CallCoreConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaEngine>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Self::with_sdp_codec(config, transport, media, Arc::new(TextSdpCodec), events)
    }

    pub fn with_sdp_codec(
        config: CallCoreConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaEngine>,
        codec: Arc<dyn SdpCodec>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(CoreContext::new(config, transport, media, codec, events));
        info!(provider = %ctx.provider_id, "Call provider created");
        Ok(Self {
            ctx,
            repository: ActiveCallsRepository::new(),
        })
    }

    pub fn id(&self) -> ProviderId {
        self.ctx.provider_id
    }

    pub fn config(&self) -> &CallCoreConfig {
        &self.ctx.config
    }

    pub fn repository(&self) -> &Arc<ActiveCallsRepository> {
        &self.repository
    }

    pub fn find_peer(&self, dialog: &DialogId) -> Option<Arc<CallPeer>> {
        self.repository.find_peer_by_dialog(dialog)
    }

    /// Create and register an empty call
    pub fn create_call(&self, direction: CallDirection) -> Arc<Call> {
        let call = Call::new(self.ctx.provider_id, direction, self.ctx.events.clone());
        self.repository.register(&call);
        info!(call = %call.id(), ?direction, "Call created");
        self.ctx.publish(CoreEvent::CallCreated {
            call_id: call.id(),
            direction,
        });
        call
    }

    /// Add an outgoing peer to `call` without inviting it yet
    pub fn add_outgoing_peer(
        &self,
        call: &Arc<Call>,
        target: &str,
        dialog: DialogId,
        capabilities: MediaCapabilities,
    ) -> Result<Arc<CallPeer>> {
        if call.provider_id() != self.ctx.provider_id {
            return Err(CallError::invalid_argument(format!(
                "Call {} belongs to another provider",
                call.id()
            )));
        }
        if target.trim().is_empty() {
            return Err(CallError::invalid_argument("Call target is empty"));
        }
        let peer = CallPeer::new(
            self.ctx.clone(),
            call.id(),
            dialog,
            CallDirection::Outgoing,
            target,
            capabilities,
        );
        self.repository.claim_dialog(call.id(), &peer)?;
        if let Err(e) = call.add_peer(peer.clone()) {
            self.repository.release_dialog(&peer);
            return Err(e);
        }
        Ok(peer)
    }

    /// Start an outgoing call with the configured default media
    pub async fn create_outgoing_call(&self, target: &str, dialog: DialogId) -> Result<(Arc<Call>, Arc<CallPeer>)> {
        let capabilities = self.ctx.config.media.capabilities.clone();
        self.create_outgoing_call_with(target, dialog, capabilities).await
    }

    /// Start an outgoing call offering `capabilities`
    pub async fn create_outgoing_call_with(
        &self,
        target: &str,
        dialog: DialogId,
        capabilities: MediaCapabilities,
    ) -> Result<(Arc<Call>, Arc<CallPeer>)> {
        let call = self.create_call(CallDirection::Outgoing);
        let peer = match self.add_outgoing_peer(&call, target, dialog, capabilities) {
            Ok(peer) => peer,
            Err(e) => {
                self.repository.deregister(&call.id());
                return Err(e);
            }
        };
        peer.invite().await?;
        Ok((call, peer))
    }

    /// Route one event from the transaction engine.
    ///
    /// Never fails: problems are logged and absorbed into peer transitions.
    pub async fn handle_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Request {
                transaction,
                dialog,
                method,
                body,
                remote,
                reason,
                refer_to,
                replaces,
            } => {
                self.handle_request(transaction, dialog, method, body, remote, reason, refer_to, replaces)
                    .await
            }
            SignalingEvent::Response {
                dialog,
                method,
                status,
                body,
            } => self.handle_response(dialog, method, status, body).await,
            SignalingEvent::DialogConfirmed { dialog } => match self.find_peer(&dialog) {
                Some(peer) => peer.confirm().await,
                None => trace!(%dialog, "Confirmation for unknown dialog"),
            },
            SignalingEvent::DialogTerminated { dialog } => match self.find_peer(&dialog) {
                Some(peer) => peer.remote_terminated().await,
                None => trace!(%dialog, "Termination of unknown dialog"),
            },
            SignalingEvent::TransportError { dialog, message } => match self.find_peer(&dialog) {
                Some(peer) => {
                    error!(%dialog, %message, "Transport error");
                    peer.fail(CallError::transport(message)).await
                }
                None => debug!(%dialog, %message, "Transport error for unknown dialog"),
            },
            SignalingEvent::Timeout { dialog } => match self.find_peer(&dialog) {
                Some(peer) => {
                    error!(%dialog, "Transaction timed out");
                    peer.fail(CallError::transport("Transaction timed out")).await
                }
                None => debug!(%dialog, "Timeout for unknown dialog"),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_request(
        &self,
        transaction: TransactionId,
        dialog: DialogId,
        method: SipMethod,
        body: Option<Body>,
        remote: String,
        reason: Option<Reason>,
        refer_to: Option<String>,
        replaces: Option<DialogId>,
    ) {
        let peer = self.find_peer(&dialog);
        match (method, peer) {
            (SipMethod::Invite, None) => match replaces {
                Some(replaced) => self.replacing_call(transaction, dialog, replaced, body, remote).await,
                None => self.incoming_call(transaction, dialog, body, remote).await,
            },
            (SipMethod::Invite | SipMethod::Update, Some(peer)) => peer.handle_reinvite(transaction, body).await,
            (SipMethod::Ack, Some(peer)) => peer.handle_ack(body).await,
            (SipMethod::Ack, None) => debug!(%dialog, "Dropping ACK for unknown dialog"),
            (SipMethod::Cancel, Some(peer)) => peer.handle_cancel(transaction, reason).await,
            (SipMethod::Bye, Some(peer)) => peer.handle_bye(transaction, reason).await,
            (SipMethod::Info, Some(peer)) => peer.handle_info(transaction, body).await,
            (SipMethod::Message, Some(_)) => self.respond(&transaction, 405).await,
            (SipMethod::Refer, Some(peer)) => self.handle_refer(transaction, peer, refer_to).await,
            (SipMethod::Notify, Some(peer)) => {
                // We never send REFER, so there is no subscription to track
                debug!(peer = %peer.id(), "Acknowledging in-dialog NOTIFY");
                self.respond(&transaction, 200).await;
            }
            (method, None) => {
                warn!(%dialog, %method, "Request for unknown dialog");
                self.respond(&transaction, 481).await;
            }
        }
    }

    async fn incoming_call(&self, transaction: TransactionId, dialog: DialogId, body: Option<Body>, remote: String) {
        let call = self.create_call(CallDirection::Incoming);
        let peer = CallPeer::new(
            self.ctx.clone(),
            call.id(),
            dialog,
            CallDirection::Incoming,
            remote,
            self.ctx.config.media.capabilities.clone(),
        );
        peer.set_invite(transaction, body.clone());
        if self.repository.claim_dialog(call.id(), &peer).is_err() {
            // A concurrent INVITE created the dialog first
            self.repository.deregister(&call.id());
            self.respond(&transaction, 491).await;
            return;
        }
        if let Err(e) = call.add_peer(peer.clone()) {
            error!(call = %call.id(), error = %e, "Cannot add incoming peer");
            self.repository.release_dialog(&peer);
            self.repository.deregister(&call.id());
            return;
        }
        info!(call = %call.id(), peer = %peer.id(), remote = %peer.remote(), "Incoming call");

        if let Some(body) = body.filter(|b| b.is_sdp() && !b.is_empty()) {
            self.offer_files(&peer, &body).await;
        }
        if let Err(e) = peer.ring().await {
            error!(peer = %peer.id(), error = %e, "Failed to ring");
        }
    }

    /// INVITE carrying Replaces (attended transfer).
    ///
    /// The new dialog joins the call of the replaced peer and is answered
    /// at once; only when that succeeds is the replaced peer hung up. An
    /// unknown or ending target gets 481 and changes nothing.
    async fn replacing_call(
        &self,
        transaction: TransactionId,
        dialog: DialogId,
        replaced: DialogId,
        body: Option<Body>,
        remote: String,
    ) {
        let target = self.find_peer(&replaced).filter(|p| {
            let state = p.state();
            !state.is_terminal() && state != CallPeerState::Disconnecting
        });
        let Some((old, call)) = target.and_then(|p| p.call().map(|call| (p, call))) else {
            warn!(%dialog, %replaced, "Replaces names no live dialog");
            self.respond(&transaction, 481).await;
            return;
        };

        let peer = CallPeer::new(
            self.ctx.clone(),
            call.id(),
            dialog,
            CallDirection::Incoming,
            remote,
            self.ctx.config.media.capabilities.clone(),
        );
        peer.set_invite(transaction, body);
        if self.repository.claim_dialog(call.id(), &peer).is_err() {
            self.respond(&transaction, 491).await;
            return;
        }
        if let Err(e) = call.add_peer(peer.clone()) {
            error!(call = %call.id(), error = %e, "Cannot add replacing peer");
            self.repository.release_dialog(&peer);
            self.respond(&transaction, 481).await;
            return;
        }
        info!(call = %call.id(), peer = %peer.id(), replaced = %old.id(), "Replacing call peer");

        if let Err(e) = peer.answer().await {
            // The INVITE was already rejected; the replaced peer stays as it was
            warn!(peer = %peer.id(), error = %e, "Replacing INVITE could not be answered");
            return;
        }
        if let Err(e) = old.hangup(HangupReason::NormalClearing).await {
            warn!(peer = %old.id(), error = %e, "Hangup of replaced peer failed");
        }
    }

    /// REFER (blind transfer): call the Refer-To target on a new dialog,
    /// report the outcome to the referrer with a NOTIFY and hang it up.
    async fn handle_refer(&self, transaction: TransactionId, peer: Arc<CallPeer>, refer_to: Option<String>) {
        let state = peer.state();
        if state.is_terminal() || state == CallPeerState::Disconnecting {
            self.respond(&transaction, 481).await;
            return;
        }
        let Some(target) = refer_to.filter(|t| !t.trim().is_empty()) else {
            warn!(peer = %peer.id(), "REFER without Refer-To");
            self.respond(&transaction, 400).await;
            return;
        };
        self.respond(&transaction, 202).await;
        info!(peer = %peer.id(), %target, "Call transferred");

        let capabilities = self.ctx.config.media.capabilities.clone();
        let (status_line, call_id) = match self
            .create_outgoing_call_with(&target, DialogId::new(), capabilities)
            .await
        {
            Ok((call, _)) => ("SIP/2.0 200 OK\r\n", Some(call.id())),
            Err(e) => {
                warn!(peer = %peer.id(), %target, error = %e, "Transfer target could not be called");
                ("SIP/2.0 603 Declined\r\n", None)
            }
        };
        if let Err(e) = self
            .ctx
            .transport
            .send_request(
                peer.dialog(),
                SipMethod::Notify,
                Some(Body::new(CONTENT_TYPE_SIPFRAG, status_line)),
                None,
            )
            .await
        {
            warn!(peer = %peer.id(), error = %e, "Failed to send transfer NOTIFY");
        }
        self.ctx.publish(CoreEvent::CallReferred {
            peer_id: *peer.id(),
            target,
            call_id,
        });

        if let Err(e) = peer.hangup(HangupReason::NormalClearing).await {
            warn!(peer = %peer.id(), error = %e, "Hangup of transferred peer failed");
        }
    }

    /// Surface file offers carried on message streams of an inbound offer
    async fn offer_files(&self, peer: &Arc<CallPeer>, body: &Body) {
        if !peer.capabilities().messaging {
            return;
        }
        // An unparsable offer is rejected when the call is answered
        let Ok(offer) = self.ctx.negotiator.codec().parse(&body.content) else {
            return;
        };
        for media in offer
            .media
            .iter()
            .filter(|m| m.media_type == MediaType::Message && !m.is_rejected())
        {
            let selector = media.attribute(FILE_SELECTOR);
            let transfer_id = media.attribute(FILE_TRANSFER_ID);
            if selector.is_none() && transfer_id.is_none() {
                continue;
            }
            let result = match peer.message_session() {
                Ok(session) => session.offer_incoming(selector, transfer_id).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(peer = %peer.id(), error = %e, "Ignoring file offer");
            }
        }
    }

    async fn handle_response(&self, dialog: DialogId, method: SipMethod, status: u16, body: Option<Body>) {
        let Some(peer) = self.find_peer(&dialog) else {
            if method == SipMethod::Invite && (200..300).contains(&status) {
                // Answer that crossed a CANCEL: the dialog exists remotely
                debug!(%dialog, "2xx for ended dialog, sending ACK and BYE");
                for method in [SipMethod::Ack, SipMethod::Bye] {
                    if let Err(e) = self.ctx.transport.send_request(&dialog, method, None, None).await {
                        warn!(%dialog, %method, error = %e, "Failed to close stray dialog");
                    }
                }
            } else {
                trace!(%dialog, %method, status, "Dropping response for unknown dialog");
            }
            return;
        };

        match status {
            100..=199 => peer.handle_provisional(status),
            200..=299 => peer.handle_success(method, body).await,
            _ => peer.handle_failure(method, status).await,
        }
    }

    async fn respond(&self, transaction: &TransactionId, status: u16) {
        if let Err(e) = self
            .ctx
            .transport
            .send_response(transaction, status, reason_phrase(status), None)
            .await
        {
            warn!(status, error = %e, "Failed to send response");
        }
    }

    fn check_peer(&self, peer: &CallPeer) -> Result<()> {
        if peer.provider_id() != self.ctx.provider_id {
            return Err(CallError::unsupported_peer(format!(
                "Peer {} belongs to provider {}",
                peer.id(),
                peer.provider_id()
            )));
        }
        Ok(())
    }

    pub async fn answer(&self, peer: &CallPeer) -> Result<()> {
        self.check_peer(peer)?;
        peer.answer().await
    }

    pub async fn hangup(&self, peer: &CallPeer, reason: HangupReason) -> Result<()> {
        self.check_peer(peer)?;
        peer.hangup(reason).await
    }

    pub async fn put_on_hold(&self, peer: &CallPeer, on_hold: bool) -> Result<()> {
        self.check_peer(peer)?;
        peer.put_on_hold(on_hold).await
    }

    pub async fn set_video_enabled(&self, peer: &CallPeer, enabled: bool) -> Result<()> {
        self.check_peer(peer)?;
        peer.set_video_enabled(enabled).await
    }

    pub async fn set_desktop_enabled(&self, peer: &CallPeer, enabled: bool) -> Result<()> {
        self.check_peer(peer)?;
        peer.set_desktop_enabled(enabled).await
    }

    pub async fn start_tone(&self, peer: &CallPeer, tone: &str) -> Result<()> {
        self.ctx.dtmf.start_tone(peer, tone).await
    }

    pub async fn stop_tone(&self, peer: &CallPeer) -> Result<()> {
        self.ctx.dtmf.stop_tone(peer).await
    }

    pub fn message_session(&self, peer: &CallPeer) -> Result<Arc<MsrpSession>> {
        self.check_peer(peer)?;
        peer.message_session()
    }

    /// Hang up every live peer of every call
    pub async fn shutdown(&self) {
        let peers: Vec<Arc<CallPeer>> = self
            .repository
            .calls()
            .iter()
            .flat_map(|call| call.peers())
            .collect();
        info!(peers = peers.len(), "Shutting down call provider");
        for peer in peers {
            if let Err(e) = peer.hangup(HangupReason::NormalClearing).await {
                warn!(peer = %peer.id(), error = %e, "Hangup during shutdown failed");
            }
        }
    }
}
