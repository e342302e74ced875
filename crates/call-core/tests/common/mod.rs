//! Shared test utilities for call-core integration tests
//!
//! Recording mocks for the signalling transport, the media engine and the
//! MSRP data channel, plus helpers that build signalling events and SDP.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use rvoip_call_core::logging::{setup_logging, LoggingConfig};
use rvoip_call_core::prelude::*;
use rvoip_call_core::EventEnvelope;

/// Something the core handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Request {
        dialog: DialogId,
        method: SipMethod,
        body: Option<Body>,
        reason: Option<Reason>,
    },
    Response {
        transaction: TransactionId,
        status: u16,
        body: Option<Body>,
    },
}

pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    reliable: bool,
    fail_requests: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            reliable: true,
            fail_requests: AtomicBool::new(false),
        })
    }

    pub fn unreliable() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            reliable: false,
            fail_requests: AtomicBool::new(false),
        })
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Methods of every request sent, in order
    pub fn methods(&self) -> Vec<SipMethod> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Request { method, .. } => Some(method),
                _ => None,
            })
            .collect()
    }

    /// Every request of `method`
    pub fn requests(&self, method: SipMethod) -> Vec<(Option<Body>, Option<Reason>)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Request {
                    method: m, body, reason, ..
                } if m == method => Some((body, reason)),
                _ => None,
            })
            .collect()
    }

    /// Status codes answered on `transaction`, in order
    pub fn statuses(&self, transaction: &TransactionId) -> Vec<u16> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Response {
                    transaction: t, status, ..
                } if t == *transaction => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Body of the last response with `status` on `transaction`
    pub fn response_body(&self, transaction: &TransactionId, status: u16) -> Option<String> {
        self.sent().into_iter().rev().find_map(|s| match s {
            Sent::Response {
                transaction: t,
                status: st,
                body: Some(body),
            } if t == *transaction && st == status => Some(body.as_text()),
            _ => None,
        })
    }

    /// Body of the last request of `method`
    pub fn last_request_body(&self, method: SipMethod) -> Option<String> {
        self.requests(method)
            .into_iter()
            .rev()
            .find_map(|(body, _)| body.map(|b| b.as_text()))
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn send_request(
        &self,
        dialog: &DialogId,
        method: SipMethod,
        body: Option<Body>,
        reason: Option<Reason>,
    ) -> Result<()> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(CallError::transport("connection refused"));
        }
        self.sent.lock().push(Sent::Request {
            dialog: *dialog,
            method,
            body,
            reason,
        });
        Ok(())
    }

    async fn send_response(
        &self,
        transaction: &TransactionId,
        status: u16,
        _reason_phrase: &str,
        body: Option<Body>,
    ) -> Result<()> {
        self.sent.lock().push(Sent::Response {
            transaction: *transaction,
            status,
            body,
        });
        Ok(())
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }
}

/// What the core asked of the media engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    Reserve(PeerId, MediaType),
    Release(PeerId),
    Start(PeerId),
    Stop(PeerId),
    ToneStart(PeerId, DtmfTone, u8),
    ToneStop(PeerId),
}

pub struct MockMedia {
    next_port: AtomicU16,
    calls: Mutex<Vec<MediaCall>>,
    fail_reserve: AtomicBool,
    yield_in_reserve: AtomicBool,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(40000),
            calls: Mutex::new(Vec::new()),
            fail_reserve: AtomicBool::new(false),
            yield_in_reserve: AtomicBool::new(false),
        })
    }

    /// Make address reservation give other tasks a chance to run
    pub fn yield_in_reserve(&self, enabled: bool) {
        self.yield_in_reserve.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().clone()
    }

    pub fn tone_calls(&self) -> Vec<MediaCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, MediaCall::ToneStart(..) | MediaCall::ToneStop(..)))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&MediaCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl MediaEngine for MockMedia {
    async fn reserve(&self, peer: &PeerId, media_type: MediaType) -> Result<SocketAddr> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(CallError::io("no free ports"));
        }
        if self.yield_in_reserve.load(Ordering::SeqCst) {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }
        self.calls.lock().push(MediaCall::Reserve(*peer, media_type));
        let port = self.next_port.fetch_add(2, Ordering::SeqCst);
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    async fn release(&self, peer: &PeerId) -> Result<()> {
        self.calls.lock().push(MediaCall::Release(*peer));
        Ok(())
    }

    async fn start(&self, peer: &PeerId, _streams: &NegotiatedStreams) -> Result<()> {
        self.calls.lock().push(MediaCall::Start(*peer));
        Ok(())
    }

    async fn stop(&self, peer: &PeerId) -> Result<()> {
        self.calls.lock().push(MediaCall::Stop(*peer));
        Ok(())
    }

    async fn start_telephone_event(&self, peer: &PeerId, tone: DtmfTone, payload_type: u8) -> Result<()> {
        self.calls.lock().push(MediaCall::ToneStart(*peer, tone, payload_type));
        Ok(())
    }

    async fn stop_telephone_event(&self, peer: &PeerId) -> Result<()> {
        self.calls.lock().push(MediaCall::ToneStop(*peer));
        Ok(())
    }
}

/// Data channel that records what the MSRP session writes
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Bytes>>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for RecordingChannel {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.sent.lock().push(data);
        Ok(())
    }
}

/// A provider wired to recording mocks
pub struct Harness {
    pub provider: CallProvider,
    pub transport: Arc<MockTransport>,
    pub media: Arc<MockMedia>,
    pub events: UnboundedReceiver<EventEnvelope>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(CallCoreConfig::default(), MockTransport::new())
    }

    pub fn with_config(config: CallCoreConfig) -> Self {
        Self::with(config, MockTransport::new())
    }

    pub fn with(config: CallCoreConfig, transport: Arc<MockTransport>) -> Self {
        // Only the first harness of a test binary installs the subscriber
        let _ = setup_logging(LoggingConfig::new(tracing::Level::ERROR));
        let media = MockMedia::new();
        let (sink, events) = ChannelEventSink::new();
        let provider = CallProvider::new(config, transport.clone(), media.clone(), Arc::new(sink))
            .expect("valid config");
        Self {
            provider,
            transport,
            media,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    /// Deliver an inbound INVITE and return its transaction and the new peer
    pub async fn incoming(&self, dialog: DialogId, offer: Option<&str>) -> (TransactionId, Arc<CallPeer>) {
        let transaction = TransactionId::new();
        self.provider
            .handle_event(request(transaction, dialog, SipMethod::Invite, offer.map(Body::sdp)))
            .await;
        let peer = self.provider.find_peer(&dialog).expect("incoming peer");
        (transaction, peer)
    }

    /// Incoming call answered and acknowledged
    pub async fn connected_incoming(&self, offer: &str) -> Arc<CallPeer> {
        let dialog = DialogId::new();
        let (_, peer) = self.incoming(dialog, Some(offer)).await;
        self.provider.answer(&peer).await.expect("answer");
        self.provider
            .handle_event(request(TransactionId::new(), dialog, SipMethod::Ack, None))
            .await;
        assert_eq!(peer.state(), CallPeerState::Connected);
        peer
    }

    /// Outgoing call that received a 2xx with `answer`
    pub async fn connected_outgoing(&self, answer: &str) -> Arc<CallPeer> {
        let dialog = DialogId::new();
        let (_, peer) = self
            .provider
            .create_outgoing_call("sip:bob@example.com", dialog)
            .await
            .expect("outgoing call");
        self.provider
            .handle_event(response(dialog, SipMethod::Invite, 200, Some(answer)))
            .await;
        assert_eq!(peer.state(), CallPeerState::Connected);
        peer
    }
}

pub fn request(transaction: TransactionId, dialog: DialogId, method: SipMethod, body: Option<Body>) -> SignalingEvent {
    SignalingEvent::Request {
        transaction,
        dialog,
        method,
        body,
        remote: "sip:bob@example.com".to_string(),
        reason: None,
        refer_to: None,
        replaces: None,
    }
}

/// In-dialog REFER asking us to call `target`
pub fn refer(transaction: TransactionId, dialog: DialogId, target: &str) -> SignalingEvent {
    SignalingEvent::Request {
        transaction,
        dialog,
        method: SipMethod::Refer,
        body: None,
        remote: "sip:bob@example.com".to_string(),
        reason: None,
        refer_to: Some(target.to_string()),
        replaces: None,
    }
}

/// INVITE on a new dialog that takes over `replaced`
pub fn replacing_invite(transaction: TransactionId, dialog: DialogId, replaced: DialogId, sdp: &str) -> SignalingEvent {
    SignalingEvent::Request {
        transaction,
        dialog,
        method: SipMethod::Invite,
        body: Some(Body::sdp(sdp)),
        remote: "sip:carol@example.com".to_string(),
        reason: None,
        refer_to: None,
        replaces: Some(replaced),
    }
}

pub fn response(dialog: DialogId, method: SipMethod, status: u16, sdp: Option<&str>) -> SignalingEvent {
    SignalingEvent::Response {
        dialog,
        method,
        status,
        body: sdp.map(Body::sdp),
    }
}

/// Remote description with the requested streams
pub struct RemoteSdp {
    version: u64,
    audio: Option<&'static str>,
    video: bool,
    telephone_event: bool,
    message: Option<String>,
    trailing: String,
}

impl RemoteSdp {
    pub fn audio() -> Self {
        Self {
            version: 1,
            audio: Some("sendrecv"),
            video: false,
            telephone_event: false,
            message: None,
            trailing: String::new(),
        }
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn direction(mut self, direction: &'static str) -> Self {
        self.audio = Some(direction);
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.audio = None;
        self
    }

    pub fn video(mut self) -> Self {
        self.video = true;
        self
    }

    pub fn telephone_event(mut self) -> Self {
        self.telephone_event = true;
        self
    }

    /// Message stream, optionally carrying extra attribute lines
    pub fn message(mut self, extra: &str) -> Self {
        self.message = Some(extra.to_string());
        self
    }

    /// Raw lines appended after every other stream
    pub fn trailing(mut self, lines: &str) -> Self {
        self.trailing.push_str(lines);
        self
    }

    pub fn build(&self) -> String {
        let mut sdp = format!(
            "v=0\r\no=bob 2890844526 {} IN IP4 192.0.2.20\r\ns=-\r\nc=IN IP4 192.0.2.20\r\nt=0 0\r\n",
            self.version
        );
        if let Some(direction) = self.audio {
            if self.telephone_event {
                sdp.push_str("m=audio 49170 RTP/AVP 0 101\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:101 telephone-event/8000\r\na=fmtp:101 0-15\r\n");
            } else {
                sdp.push_str("m=audio 49170 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n");
            }
            sdp.push_str(&format!("a={}\r\n", direction));
        }
        if self.video {
            sdp.push_str("m=video 51372 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=sendrecv\r\n");
        }
        if let Some(extra) = &self.message {
            sdp.push_str("m=message 7394 TCP/MSRP *\r\na=accept-types:text/plain\r\na=path:msrp://192.0.2.20:7394/bob;tcp\r\n");
            sdp.push_str(extra);
        }
        sdp.push_str(&self.trailing);
        sdp
    }
}
