//! Call peer
//!
//! One remote party of a [`Call`] and the signalling state machine that
//! drives it:
//!
//! ```text
//! Initiating -> Ringing -> Connecting -> Connected <-> OnHold
//!      \            \           \            |
//!       +------------+-----------+-----> Disconnecting -> Disconnected | Failed
//! ```
//!
//! Every state change is reported synchronously to the owning call, which
//! publishes it and removes the peer once it is terminal. Network-driven
//! handlers never return errors: failures become a transition to `Failed`
//! carrying the error. Locks on the peer are never held across an await,
//! except the operation guard: user operations and inbound requests on one
//! peer run one at a time, so a state check and the transition it permits
//! cannot interleave with another handler.

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

use crate::call::Call;
use crate::context::CoreContext;
use crate::dtmf::parse_dtmf_relay;
use crate::errors::{CallError, Result};
use crate::events::CoreEvent;
use crate::media::{MediaCapabilities, NegotiatedStreams};
use crate::msrp::MsrpSession;
use crate::sdp::{detect_renegotiation_delta, DescriptionPair, SessionDescription};
use crate::signaling::{
    reason_phrase, Body, Reason, SipMethod, CONTENT_TYPE_DTMF_RELAY, CONTENT_TYPE_SDP,
};
use crate::types::{
    CallDirection, CallId, CallPeerState, DialogId, HangupReason, MediaType, PeerId, ProviderId,
    TransactionId,
};

#[derive(Debug)]
struct PeerInner {
    state: CallPeerState,
    capabilities: MediaCapabilities,
    /// Server transaction of the initial INVITE (incoming peers)
    invite_transaction: Option<TransactionId>,
    /// Offer received in the initial INVITE, consumed by `answer`
    pending_offer: Option<Body>,
    /// Local description before an outstanding re-negotiation
    previous_local: Option<SessionDescription>,
    /// Capabilities before our outstanding re-INVITE
    previous_capabilities: Option<MediaCapabilities>,
    /// Our own re-INVITE is waiting for its final response
    reoffer_pending: bool,
    /// We offered in a 2xx and the answer comes in the ACK
    awaiting_ack_answer: bool,
    confirming: bool,
    media_started: bool,
}

/// One remote party of a call
pub struct CallPeer {
    id: PeerId,
    dialog: DialogId,
    call_id: CallId,
    direction: CallDirection,
    remote: String,
    ctx: Arc<CoreContext>,
    call: RwLock<Weak<Call>>,
    inner: Mutex<PeerInner>,
    descriptions: Mutex<DescriptionPair>,
    msrp: Mutex<Option<Arc<MsrpSession>>>,
    ops: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for CallPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPeer")
            .field("id", &self.id)
            .field("dialog", &self.dialog)
            .field("call_id", &self.call_id)
            .field("direction", &self.direction)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl CallPeer {
    pub(crate) fn new(
        ctx: Arc<CoreContext>,
        call_id: CallId,
        dialog: DialogId,
        direction: CallDirection,
        remote: impl Into<String>,
        capabilities: MediaCapabilities,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId::new(),
            dialog,
            call_id,
            direction,
            remote: remote.into(),
            ctx,
            call: RwLock::new(Weak::new()),
            inner: Mutex::new(PeerInner {
                state: CallPeerState::Initiating,
                capabilities,
                invite_transaction: None,
                pending_offer: None,
                previous_local: None,
                previous_capabilities: None,
                reoffer_pending: false,
                awaiting_ack_answer: false,
                confirming: false,
                media_started: false,
            }),
            descriptions: Mutex::new(DescriptionPair::default()),
            msrp: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn dialog(&self) -> &DialogId {
        &self.dialog
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn provider_id(&self) -> ProviderId {
        self.ctx.provider_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Remote party address
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> CallPeerState {
        self.inner.lock().state
    }

    pub fn capabilities(&self) -> MediaCapabilities {
        self.inner.lock().capabilities.clone()
    }

    /// Snapshot of the local/remote description pair
    pub fn descriptions(&self) -> DescriptionPair {
        self.descriptions.lock().clone()
    }

    pub fn negotiated_streams(&self) -> Option<NegotiatedStreams> {
        self.descriptions.lock().negotiated.clone()
    }

    pub fn is_on_hold(&self) -> bool {
        self.descriptions.lock().is_on_hold()
    }

    /// Owning call, `None` once the peer has been removed from it
    pub fn call(&self) -> Option<Arc<Call>> {
        self.call.read().upgrade()
    }

    /// Messaging session of this peer, created on first use
    pub fn message_session(&self) -> Result<Arc<MsrpSession>> {
        if self.state().is_terminal() {
            return Err(CallError::invalid_state(format!("Peer {} has ended", self.id)));
        }
        let mut slot = self.msrp.lock();
        let session = slot.get_or_insert_with(|| {
            Arc::new(MsrpSession::new(
                self.id,
                self.ctx.config.msrp.clone(),
                self.ctx.events.clone(),
            ))
        });
        Ok(session.clone())
    }

    pub(crate) fn attach(&self, call: &Arc<Call>) {
        *self.call.write() = Arc::downgrade(call);
    }

    pub(crate) fn detach(&self) {
        *self.call.write() = Weak::new();
    }

    /// Remember the inbound INVITE transaction and the offer it carried
    pub(crate) fn set_invite(&self, transaction: TransactionId, offer: Option<Body>) {
        let mut inner = self.inner.lock();
        inner.invite_transaction = Some(transaction);
        inner.pending_offer = offer.filter(|b| b.is_sdp() && !b.is_empty());
    }

    /// Change state and notify the owning call.
    ///
    /// Returns false when nothing changed: the peer is already terminal or
    /// already in `new`.
    fn set_state(&self, new: CallPeerState, reason: Option<String>, error: Option<CallError>) -> bool {
        let old = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() || inner.state == new {
                return false;
            }
            let old = inner.state;
            inner.state = new;
            old
        };

        if new.is_terminal() {
            info!(peer = %self.id, call = %self.call_id, %old, %new, reason = ?reason, "Peer ended");
        } else {
            debug!(peer = %self.id, call = %self.call_id, %old, %new, "Peer state changed");
        }

        match self.call() {
            Some(call) => call.peer_state_changed(self, old, new, reason, error),
            None => self.ctx.publish(CoreEvent::PeerStateChanged {
                call_id: self.call_id,
                peer_id: self.id,
                old,
                new,
                reason,
                error,
            }),
        }
        true
    }

    fn transition(&self, new: CallPeerState) -> bool {
        self.set_state(new, None, None)
    }

    /// Move to a terminal state and release everything the peer holds.
    /// Only the first terminal transition has any effect.
    async fn terminate(&self, state: CallPeerState, reason: Option<String>, error: Option<CallError>) -> bool {
        if !self.set_state(state, reason, error) {
            return false;
        }
        self.release_resources().await;
        true
    }

    async fn release_resources(&self) {
        let media_started = std::mem::replace(&mut self.inner.lock().media_started, false);
        if media_started {
            if let Err(e) = self.ctx.media.stop(&self.id).await {
                warn!(peer = %self.id, error = %e, "Failed to stop media");
            }
        }
        if let Err(e) = self.ctx.negotiator.release(&self.id).await {
            warn!(peer = %self.id, error = %e, "Failed to release media addresses");
        }
        let session = self.msrp.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.ctx.dtmf.forget(&self.id);
    }

    /// Send the initial INVITE with a fresh offer
    pub async fn invite(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        let caps = {
            let inner = self.inner.lock();
            if self.direction != CallDirection::Outgoing || inner.state != CallPeerState::Initiating {
                return Err(CallError::invalid_state(format!(
                    "Cannot invite {} peer in state {}",
                    if self.direction == CallDirection::Outgoing { "outgoing" } else { "incoming" },
                    inner.state
                )));
            }
            inner.capabilities.clone()
        };

        let offer = match self
            .ctx
            .negotiator
            .create_offer(&self.id, &self.descriptions, &caps)
            .await
        {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(e.clone()).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .ctx
            .transport
            .send_request(&self.dialog, SipMethod::Invite, Some(Body::new(CONTENT_TYPE_SDP, offer)), None)
            .await
        {
            self.fail(e.clone()).await;
            return Err(e);
        }
        info!(peer = %self.id, remote = %self.remote, "INVITE sent");
        Ok(())
    }

    /// Send 180 Ringing for an incoming INVITE.
    ///
    /// On unreliable transports the response is retransmitted with a
    /// doubling interval while the peer keeps ringing.
    pub async fn ring(self: &Arc<Self>) -> Result<()> {
        let _guard = self.ops.lock().await;
        let transaction = {
            let inner = self.inner.lock();
            if self.direction != CallDirection::Incoming || inner.state != CallPeerState::Initiating {
                return Err(CallError::invalid_state(format!("Cannot ring peer in state {}", inner.state)));
            }
            inner
                .invite_transaction
                .ok_or_else(|| CallError::invalid_state("No INVITE transaction to ring on"))?
        };

        if let Err(e) = self
            .ctx
            .transport
            .send_response(&transaction, 180, reason_phrase(180), None)
            .await
        {
            self.fail(e.clone()).await;
            return Err(e);
        }
        self.transition(CallPeerState::Ringing);

        if !self.ctx.transport.is_reliable() {
            self.spawn_ringing_retransmission(transaction);
        }
        Ok(())
    }

    fn spawn_ringing_retransmission(self: &Arc<Self>, transaction: TransactionId) {
        let weak = Arc::downgrade(self);
        let mut interval = self.ctx.config.signaling.ringing_retransmit_interval();
        let max = self.ctx.config.signaling.max_ringing_retransmissions;

        tokio::spawn(async move {
            for attempt in 1..=max {
                tokio::time::sleep(interval).await;
                let Some(peer) = weak.upgrade() else {
                    return;
                };
                if peer.state() != CallPeerState::Ringing {
                    return;
                }
                trace!(peer = %peer.id, attempt, "Retransmitting 180 Ringing");
                if let Err(e) = peer
                    .ctx
                    .transport
                    .send_response(&transaction, 180, reason_phrase(180), None)
                    .await
                {
                    warn!(peer = %peer.id, error = %e, "Ringing retransmission failed");
                    return;
                }
                interval *= 2;
            }
        });
    }

    /// Answer an incoming call.
    ///
    /// A no-op once the call is answered. Negotiation failures reject the
    /// INVITE with 488, fail the peer and are returned.
    pub async fn answer(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        let (transaction, offer, caps) = {
            let inner = self.inner.lock();
            if inner.state.is_established() || inner.state == CallPeerState::Connecting {
                return Ok(());
            }
            if self.direction != CallDirection::Incoming
                || !matches!(inner.state, CallPeerState::Initiating | CallPeerState::Ringing)
            {
                return Err(CallError::invalid_state(format!("Cannot answer peer in state {}", inner.state)));
            }
            let transaction = inner
                .invite_transaction
                .ok_or_else(|| CallError::invalid_state("No INVITE to answer"))?;
            (transaction, inner.pending_offer.clone(), inner.capabilities.clone())
        };

        let negotiated = match &offer {
            Some(offer) => self
                .ctx
                .negotiator
                .process_offer(&self.id, &self.descriptions, &offer.content, &caps)
                .await
                .map(|(answer, _)| (answer, false)),
            None => self
                .ctx
                .negotiator
                .create_offer(&self.id, &self.descriptions, &caps)
                .await
                .map(|offer| (offer, true)),
        };

        let (sdp, late_offer) = match negotiated {
            Ok(result) => result,
            Err(e) => {
                warn!(peer = %self.id, error = %e, "Rejecting INVITE");
                let status = if matches!(e, CallError::Negotiation { .. }) { 488 } else { 500 };
                self.respond(&transaction, status, None).await;
                self.fail(e.clone()).await;
                return Err(e);
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.pending_offer = None;
            inner.awaiting_ack_answer = late_offer;
        }

        if let Err(e) = self
            .ctx
            .transport
            .send_response(&transaction, 200, reason_phrase(200), Some(Body::new(CONTENT_TYPE_SDP, sdp)))
            .await
        {
            self.fail(e.clone()).await;
            return Err(e);
        }
        info!(peer = %self.id, late_offer, "Call answered");
        self.transition(CallPeerState::Connecting);
        self.sync_msrp_paths();
        Ok(())
    }

    /// Provisional response to our INVITE
    pub(crate) fn handle_provisional(&self, status: u16) {
        if status > 100 && self.direction == CallDirection::Outgoing && self.state() == CallPeerState::Initiating {
            self.transition(CallPeerState::Ringing);
        }
    }

    /// ACK for our 2xx, possibly carrying the answer to a late offer
    pub(crate) async fn handle_ack(&self, body: Option<Body>) {
        let _guard = self.ops.lock().await;
        let (state, awaiting) = {
            let mut inner = self.inner.lock();
            (inner.state, std::mem::take(&mut inner.awaiting_ack_answer))
        };

        if awaiting {
            let result = match body.filter(|b| b.is_sdp() && !b.is_empty()) {
                Some(answer) => self
                    .ctx
                    .negotiator
                    .apply_answer(&self.id, &self.descriptions, &answer.content)
                    .map(|_| ()),
                None => Err(CallError::negotiation("ACK carried no answer to our offer")),
            };

            if state.is_established() {
                let previous = self.inner.lock().previous_local.take();
                match result {
                    Ok(()) => self.apply_renegotiation(previous).await,
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "Unusable answer in ACK, keeping previous session");
                        if let Some(previous) = previous {
                            self.descriptions.lock().local = Some(previous);
                        }
                    }
                }
                return;
            }

            if let Err(e) = result {
                warn!(peer = %self.id, error = %e, "Late offer answer failed");
                self.send_bye(Some(Reason::sip(488, reason_phrase(488)))).await;
                self.fail(e).await;
                return;
            }
        }

        if state == CallPeerState::Connecting {
            self.start_media().await;
        }
    }

    /// Dialog confirmed: start media and become Connected (or OnHold)
    pub(crate) async fn confirm(&self) {
        let _guard = self.ops.lock().await;
        self.start_media().await;
    }

    async fn start_media(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != CallPeerState::Connecting || inner.awaiting_ack_answer || inner.confirming {
                return;
            }
            inner.confirming = true;
        }

        if let Some(streams) = self.negotiated_streams() {
            if let Err(e) = self.ctx.media.start(&self.id, &streams).await {
                error!(peer = %self.id, error = %e, "Media start failed");
                self.send_bye(Some(Reason::sip(500, "Media start failed"))).await;
                self.fail(e).await;
                return;
            }
            self.inner.lock().media_started = true;
        }

        let state = if self.is_on_hold() {
            CallPeerState::OnHold
        } else {
            CallPeerState::Connected
        };
        self.transition(state);
        self.sync_msrp_paths();
    }

    /// 2xx to a request we sent
    pub(crate) async fn handle_success(&self, method: SipMethod, body: Option<Body>) {
        let _guard = self.ops.lock().await;
        match method {
            SipMethod::Invite => self.handle_invite_success(body).await,
            SipMethod::Bye => {
                self.terminate(CallPeerState::Disconnected, Some("Call ended".to_string()), None)
                    .await;
            }
            other => trace!(peer = %self.id, method = %other, "Request accepted"),
        }
    }

    async fn handle_invite_success(&self, body: Option<Body>) {
        let state = self.state();
        let answer = body.filter(|b| b.is_sdp() && !b.is_empty());

        match state {
            CallPeerState::Initiating | CallPeerState::Ringing if self.direction == CallDirection::Outgoing => {
                let result = match &answer {
                    Some(answer) => self
                        .ctx
                        .negotiator
                        .apply_answer(&self.id, &self.descriptions, &answer.content)
                        .map(|_| ()),
                    None => Err(CallError::negotiation("2xx carried no answer to our offer")),
                };
                self.send_ack().await;
                if let Err(e) = result {
                    warn!(peer = %self.id, error = %e, "Answer rejected, ending call");
                    self.send_bye(Some(Reason::sip(488, reason_phrase(488)))).await;
                    self.fail(e).await;
                    return;
                }
                self.transition(CallPeerState::Connecting);
                self.start_media().await;
            }
            s if s.is_established() => {
                let (previous, previous_caps) = {
                    let mut inner = self.inner.lock();
                    inner.reoffer_pending = false;
                    (inner.previous_local.take(), inner.previous_capabilities.take())
                };
                let result = match &answer {
                    Some(answer) => self
                        .ctx
                        .negotiator
                        .apply_answer(&self.id, &self.descriptions, &answer.content)
                        .map(|_| ()),
                    None => Err(CallError::negotiation("re-INVITE 2xx carried no answer")),
                };
                self.send_ack().await;
                match result {
                    Ok(()) => self.apply_renegotiation(previous).await,
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "Re-negotiation answer rejected, keeping previous session");
                        self.restore_previous(previous, previous_caps);
                    }
                }
            }
            CallPeerState::Connecting => {
                trace!(peer = %self.id, "Retransmitted 2xx");
                self.send_ack().await;
            }
            _ => {
                // A 2xx that crossed our hangup still needs ACK and BYE
                debug!(peer = %self.id, %state, "2xx after hangup, closing dialog");
                self.send_ack().await;
                self.send_bye(None).await;
            }
        }
    }

    /// Final non-2xx response to a request we sent
    pub(crate) async fn handle_failure(&self, method: SipMethod, status: u16) {
        let _guard = self.ops.lock().await;
        let phrase = reason_phrase(status);
        let reason = if phrase.is_empty() {
            status.to_string()
        } else {
            format!("{} {}", status, phrase)
        };

        match method {
            SipMethod::Invite => {
                let state = self.state();
                if state.is_established() {
                    let (previous, previous_caps) = {
                        let mut inner = self.inner.lock();
                        inner.reoffer_pending = false;
                        (inner.previous_local.take(), inner.previous_capabilities.take())
                    };
                    self.restore_previous(previous, previous_caps);
                    warn!(peer = %self.id, status, "Re-INVITE rejected");
                    if status == 481 || status == 408 {
                        self.terminate(CallPeerState::Disconnected, Some(reason), None).await;
                    }
                } else {
                    self.terminate(CallPeerState::Disconnected, Some(reason), None).await;
                }
            }
            SipMethod::Bye => {
                self.terminate(CallPeerState::Disconnected, Some(reason), None).await;
            }
            other => debug!(peer = %self.id, method = %other, status, "Request rejected"),
        }
    }

    /// CANCEL of the initial INVITE
    pub(crate) async fn handle_cancel(&self, transaction: TransactionId, reason: Option<Reason>) {
        let _guard = self.ops.lock().await;
        let invite = {
            let inner = self.inner.lock();
            if self.direction == CallDirection::Incoming
                && matches!(inner.state, CallPeerState::Initiating | CallPeerState::Ringing)
            {
                inner.invite_transaction
            } else {
                None
            }
        };

        self.respond(&transaction, 200, None).await;
        if let Some(invite) = invite {
            self.respond(&invite, 487, None).await;
            let text = reason
                .and_then(|r| r.text)
                .unwrap_or_else(|| "Cancelled by caller".to_string());
            self.terminate(CallPeerState::Disconnected, Some(text), None).await;
        }
    }

    /// BYE from the remote side
    pub(crate) async fn handle_bye(&self, transaction: TransactionId, reason: Option<Reason>) {
        let _guard = self.ops.lock().await;
        self.respond(&transaction, 200, None).await;
        let text = reason
            .and_then(|r| r.text)
            .unwrap_or_else(|| "Remote hangup".to_string());
        self.terminate(CallPeerState::Disconnected, Some(text), None).await;
    }

    /// In-dialog INVITE or UPDATE
    pub(crate) async fn handle_reinvite(&self, transaction: TransactionId, body: Option<Body>) {
        let _guard = self.ops.lock().await;
        let (state, reoffer_pending, caps) = {
            let inner = self.inner.lock();
            (inner.state, inner.reoffer_pending, inner.capabilities.clone())
        };
        if state.is_terminal() || state == CallPeerState::Disconnecting {
            self.respond(&transaction, 481, None).await;
            return;
        }
        if !state.is_established() || reoffer_pending {
            self.respond(&transaction, 491, None).await;
            return;
        }

        let old_local = self.descriptions.lock().local.clone();
        match body.filter(|b| b.is_sdp() && !b.is_empty()) {
            Some(offer) => {
                let result = self
                    .ctx
                    .negotiator
                    .process_offer(&self.id, &self.descriptions, &offer.content, &caps)
                    .await;
                match result {
                    Ok((answer, _)) => {
                        if self.respond(&transaction, 200, Some(Body::new(CONTENT_TYPE_SDP, answer))).await {
                            self.apply_renegotiation(old_local).await;
                        } else {
                            self.fail(CallError::transport("Could not answer re-INVITE")).await;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "Re-INVITE failed");
                        self.respond(&transaction, 500, None).await;
                        self.send_bye(Some(Reason::sip(500, reason_phrase(500)))).await;
                        self.fail(e).await;
                    }
                }
            }
            None => {
                // Offerless re-INVITE: we offer in the 2xx, the answer comes in the ACK
                match self.ctx.negotiator.create_offer(&self.id, &self.descriptions, &caps).await {
                    Ok(offer) => {
                        {
                            let mut inner = self.inner.lock();
                            inner.previous_local = old_local;
                            inner.awaiting_ack_answer = true;
                        }
                        self.respond(&transaction, 200, Some(Body::new(CONTENT_TYPE_SDP, offer)))
                            .await;
                    }
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "Cannot offer in re-INVITE answer");
                        self.respond(&transaction, 500, None).await;
                        self.send_bye(Some(Reason::sip(500, reason_phrase(500)))).await;
                        self.fail(e).await;
                    }
                }
            }
        }
    }

    /// In-dialog INFO; dtmf-relay bodies become DTMF notifications
    pub(crate) async fn handle_info(&self, transaction: TransactionId, body: Option<Body>) {
        self.respond(&transaction, 200, None).await;
        let Some(body) = body else {
            return;
        };
        if !body.content_type.eq_ignore_ascii_case(CONTENT_TYPE_DTMF_RELAY) {
            debug!(peer = %self.id, content_type = %body.content_type, "Ignoring INFO body");
            return;
        }
        match parse_dtmf_relay(&body.as_text()) {
            Ok((tone, duration_ms)) => {
                debug!(peer = %self.id, %tone, "DTMF received via INFO");
                self.ctx.publish(CoreEvent::DtmfReceived {
                    peer_id: self.id,
                    tone,
                    duration_ms,
                });
            }
            Err(e) => warn!(peer = %self.id, error = %e, "Malformed dtmf-relay body"),
        }
    }

    /// Hang up locally.
    ///
    /// A no-op once the peer is ending or ended, so a hangup racing a remote
    /// BYE is harmless. The peer always ends, even when the request cannot
    /// be sent; that error is then returned.
    pub async fn hangup(&self, reason: HangupReason) -> Result<()> {
        let _guard = self.ops.lock().await;
        let (previous, invite) = {
            let inner = self.inner.lock();
            if inner.state.is_terminal() || inner.state == CallPeerState::Disconnecting {
                return Ok(());
            }
            (inner.state, inner.invite_transaction)
        };
        if !self.set_state(CallPeerState::Disconnecting, Some(reason.text().to_string()), None) {
            return Ok(());
        }

        let header = reason.sip_code().map(|code| Reason::sip(code, reason.text()));
        let result = match (self.direction, previous) {
            (_, CallPeerState::Connected | CallPeerState::OnHold | CallPeerState::Connecting) => {
                self.ctx
                    .transport
                    .send_request(&self.dialog, SipMethod::Bye, None, header)
                    .await
            }
            (CallDirection::Outgoing, _) => {
                self.ctx
                    .transport
                    .send_request(&self.dialog, SipMethod::Cancel, None, header)
                    .await
            }
            (CallDirection::Incoming, _) => match invite {
                Some(invite) => {
                    let status = reason
                        .sip_code()
                        .filter(|code| (400..700).contains(code))
                        .unwrap_or(486);
                    self.ctx
                        .transport
                        .send_response(&invite, status, reason_phrase(status), None)
                        .await
                }
                None => Ok(()),
            },
        };

        if let Err(e) = &result {
            warn!(peer = %self.id, error = %e, "Hangup request could not be sent");
        }
        let terminal = if reason.is_failure() {
            CallPeerState::Failed
        } else {
            CallPeerState::Disconnected
        };
        self.terminate(terminal, Some(reason.text().to_string()), result.as_ref().err().cloned())
            .await;
        result
    }

    /// Put the peer on hold or resume it with a re-INVITE
    pub async fn put_on_hold(&self, on_hold: bool) -> Result<()> {
        self.reoffer(|caps| {
            if caps.on_hold == on_hold {
                return false;
            }
            caps.on_hold = on_hold;
            true
        })
        .await
    }

    /// Add or remove the video stream with a re-INVITE
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.reoffer(|caps| {
            if caps.video == enabled {
                return false;
            }
            caps.video = enabled;
            true
        })
        .await
    }

    /// Enable or disable desktop sharing with a re-INVITE
    pub async fn set_desktop_enabled(&self, enabled: bool) -> Result<()> {
        self.reoffer(|caps| {
            if caps.desktop == enabled {
                return false;
            }
            caps.desktop = enabled;
            true
        })
        .await
    }

    async fn reoffer(&self, change: impl FnOnce(&mut MediaCapabilities) -> bool) -> Result<()> {
        let _guard = self.ops.lock().await;
        let caps = {
            let mut inner = self.inner.lock();
            if !inner.state.is_established() {
                return Err(CallError::invalid_state(format!(
                    "Cannot re-negotiate peer in state {}",
                    inner.state
                )));
            }
            if inner.reoffer_pending || inner.awaiting_ack_answer {
                return Err(CallError::invalid_state("Re-negotiation already in progress"));
            }
            let previous_caps = inner.capabilities.clone();
            let mut caps = previous_caps.clone();
            if !change(&mut caps) {
                return Ok(());
            }
            inner.capabilities = caps.clone();
            inner.reoffer_pending = true;
            inner.previous_local = self.descriptions.lock().local.clone();
            inner.previous_capabilities = Some(previous_caps);
            caps
        };

        let sent = match self.ctx.negotiator.create_offer(&self.id, &self.descriptions, &caps).await {
            Ok(offer) => {
                self.ctx
                    .transport
                    .send_request(&self.dialog, SipMethod::Invite, Some(Body::new(CONTENT_TYPE_SDP, offer)), None)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            let (previous, previous_caps) = {
                let mut inner = self.inner.lock();
                inner.reoffer_pending = false;
                (inner.previous_local.take(), inner.previous_capabilities.take())
            };
            self.restore_previous(previous, previous_caps);
            return Err(e);
        }
        debug!(peer = %self.id, on_hold = caps.on_hold, video = caps.video, "Re-INVITE sent");
        Ok(())
    }

    /// Transport error or transaction timeout for this dialog
    pub(crate) async fn fail(&self, error: CallError) {
        self.terminate(CallPeerState::Failed, Some(error.to_string()), Some(error))
            .await;
    }

    /// The dialog went away underneath us
    pub(crate) async fn remote_terminated(&self) {
        self.terminate(CallPeerState::Disconnected, Some("Dialog terminated".to_string()), None)
            .await;
    }

    /// Restart media and surface what a completed re-negotiation changed
    async fn apply_renegotiation(&self, old_local: Option<SessionDescription>) {
        let (new_remote, on_hold, streams) = {
            let pair = self.descriptions.lock();
            (pair.remote.clone(), pair.is_on_hold(), pair.negotiated.clone())
        };

        if let Some(streams) = &streams {
            match self.ctx.media.start(&self.id, streams).await {
                Ok(()) => self.inner.lock().media_started = true,
                Err(e) => warn!(peer = %self.id, error = %e, "Media update failed"),
            }
        }

        if let (Some(old_local), Some(new_remote)) = (old_local, new_remote) {
            let delta = detect_renegotiation_delta(&old_local, &new_remote);
            if !delta.is_empty() {
                debug!(peer = %self.id, ?delta, "Streams changed");
                self.ctx.publish(CoreEvent::MediaStreamsChanged {
                    peer_id: self.id,
                    delta,
                });
            }
        }

        let was_on_hold = self.state() == CallPeerState::OnHold;
        if was_on_hold != on_hold {
            self.ctx.publish(CoreEvent::HoldChanged {
                peer_id: self.id,
                on_hold,
            });
        }
        self.transition(if on_hold { CallPeerState::OnHold } else { CallPeerState::Connected });
        self.sync_msrp_paths();
    }

    /// Roll back a re-negotiation that did not complete
    fn restore_previous(&self, local: Option<SessionDescription>, capabilities: Option<MediaCapabilities>) {
        if let Some(capabilities) = capabilities {
            self.inner.lock().capabilities = capabilities;
        }
        if let Some(local) = local {
            self.descriptions.lock().local = Some(local);
        }
    }

    /// Hand the negotiated MSRP paths to the messaging session
    fn sync_msrp_paths(&self) {
        let paths = {
            let pair = self.descriptions.lock();
            let path_of = |sd: &Option<SessionDescription>| {
                sd.as_ref()
                    .and_then(|d| d.active_media(MediaType::Message))
                    .and_then(|m| m.attribute("path"))
                    .map(str::to_string)
            };
            (path_of(&pair.local), path_of(&pair.remote))
        };
        if let (Some(local), Some(remote)) = paths {
            if let Ok(session) = self.message_session() {
                session.set_paths(local, remote);
            }
        }
    }

    async fn send_ack(&self) {
        if let Err(e) = self
            .ctx
            .transport
            .send_request(&self.dialog, SipMethod::Ack, None, None)
            .await
        {
            warn!(peer = %self.id, error = %e, "Failed to send ACK");
        }
    }

    async fn send_bye(&self, reason: Option<Reason>) {
        if let Err(e) = self
            .ctx
            .transport
            .send_request(&self.dialog, SipMethod::Bye, None, reason)
            .await
        {
            warn!(peer = %self.id, error = %e, "Failed to send BYE");
        }
    }

    /// Answer a server transaction; returns whether it went out
    async fn respond(&self, transaction: &TransactionId, status: u16, body: Option<Body>) -> bool {
        match self
            .ctx
            .transport
            .send_response(transaction, status, reason_phrase(status), body)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %self.id, status, error = %e, "Failed to send response");
                false
            }
        }
    }
}
